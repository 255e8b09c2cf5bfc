use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown salon or booking.
    NotFound(Ulid),
    /// Duplicate booking id.
    AlreadyExists(Ulid),
    /// Malformed schedule; names the violated invariant.
    Validation(&'static str),
    /// Slot at capacity at the moment of the atomic check.
    SlotFull(u32),
    /// Window is not generated by the salon's current schedule.
    SlotClosed,
    /// Date in the past (or beyond the booking horizon).
    InvalidDate,
    /// Confirm arrived after the hold lapsed.
    ReservationExpired(Ulid),
    /// Transition not allowed from the booking's current status.
    InvalidState(BookingStatus),
    /// Schedule edit would undercut confirmed bookings in a future slot.
    CapacityConflict { confirmed: u32, new_capacity: u32 },
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(inv) => write!(f, "invalid schedule: {inv}"),
            EngineError::SlotFull(cap) => write!(f, "slot full: capacity {cap} exhausted"),
            EngineError::SlotClosed => write!(f, "slot closed: not a window of the current schedule"),
            EngineError::InvalidDate => write!(f, "invalid date"),
            EngineError::ReservationExpired(id) => write!(f, "reservation expired: {id}"),
            EngineError::InvalidState(status) => {
                write!(f, "invalid state: booking is {}", status.as_str())
            }
            EngineError::CapacityConflict { confirmed, new_capacity } => write!(
                f,
                "capacity conflict: {confirmed} confirmed bookings exceed new capacity {new_capacity}"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
