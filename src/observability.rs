use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings created. Labels: status.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotkeeper_bookings_created_total";

/// Counter: reservations refused. Labels: reason (overlap, capacity, lock_timeout).
pub const RESERVATION_REJECTIONS_TOTAL: &str = "slotkeeper_reservation_rejections_total";

/// Counter: manage-token presentations that did not authenticate.
pub const TOKEN_FAILURES_TOTAL: &str = "slotkeeper_token_failures_total";

/// Counter: notice deliveries that failed or timed out. Labels: collaborator.
pub const NOTICE_FAILURES_TOTAL: &str = "slotkeeper_notice_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Histogram: time spent waiting for a scope write lock, in seconds.
pub const SCOPE_LOCK_WAIT_SECONDS: &str = "slotkeeper_scope_lock_wait_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Gauge: version of the configuration in force.
pub const CONFIG_VERSION: &str = "slotkeeper_config_version";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookingById { .. } => "select_booking_by_id",
        Command::SelectBookingByToken { .. } => "select_booking_by_token",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelByToken { .. } => "cancel_by_token",
        Command::SetStatusByToken { .. } => "set_status_by_token",
        Command::RescheduleByToken { .. } => "reschedule_by_token",
        Command::TransitionById { .. } => "transition_by_id",
        Command::CompleteElapsed { .. } => "complete_elapsed",
    }
}
