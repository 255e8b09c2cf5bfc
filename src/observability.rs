use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Counter: reservation attempts. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "slotd_reservations_total";

/// Counter: holds expired by the sweeper.
pub const SWEEP_EXPIRED_TOTAL: &str = "slotd_sweep_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertSchedule { .. } => "upsert_schedule",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
