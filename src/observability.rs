use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: booking operations by outcome. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "slotbook_bookings_total";

/// Histogram: time spent waiting for a slot's exclusive section, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "slotbook_lock_wait_seconds";

/// Counter: slots created, by source. Labels: source.
pub const SLOTS_CREATED_TOTAL: &str = "slotbook_slots_created_total";

/// Counter: outbound booking notices. Labels: status.
pub const NOTICES_TOTAL: &str = "slotbook_notices_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::PublishSchedule { .. } => "publish_schedule",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::InsertReschedule { .. } => "insert_reschedule",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookableSlots { .. } => "select_bookable_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectFreeRanges { .. } => "select_free_ranges",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectProviders => "select_providers",
    }
}
