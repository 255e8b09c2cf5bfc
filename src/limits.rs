//! Hard limits. Violations surface as `EngineError::LimitExceeded` with the
//! limit named.

/// Max salons per tenant engine.
pub const MAX_SALONS_PER_TENANT: usize = 10_000;

/// Max bookings recorded against a single slot window, terminal ones
/// included. Caps ledger growth from request/cancel churn.
pub const MAX_BOOKINGS_PER_LEDGER: usize = 4_096;

/// Upper bound on configurable per-slot capacity.
pub const MAX_CAPACITY_PER_SLOT: u32 = 1_000;

/// How far into the future a date may be queried or reserved, in days.
pub const MAX_BOOKING_HORIZON_DAYS: u64 = 365;

/// Bounded retries when a schedule edit races a reserve.
pub const MAX_RESERVE_RETRIES: usize = 3;

/// Max tenants (databases) per process.
pub const MAX_TENANTS: usize = 256;

/// Max tenant (database) name length.
pub const MAX_TENANT_NAME_LEN: usize = 256;
