use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "stationd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "stationd_request_duration_seconds";

/// Counter: operations rejected by a domain rule. Labels: code.
pub const REJECTIONS_TOTAL: &str = "stationd_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "stationd_connections_active";

pub const CONNECTIONS_TOTAL: &str = "stationd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stationd_connections_rejected_total";

pub const AUTH_FAILURES_TOTAL: &str = "stationd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stationd_wal_flush_duration_seconds";

/// Histogram: commits per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "stationd_wal_flush_batch_size";

/// Counter: commits made durable.
pub const COMMITS_TOTAL: &str = "stationd_commits_total";

// ── Broadcast ───────────────────────────────────────────────────

/// Gauge: observers currently subscribed.
pub const OBSERVERS_ACTIVE: &str = "stationd_observers_active";

/// Counter: observers dropped. Labels: reason (lagged, closed).
pub const OBSERVERS_DROPPED_TOTAL: &str = "stationd_observers_dropped_total";

/// Counter: events fanned out. Labels: type.
pub const EVENTS_PUBLISHED_TOTAL: &str = "stationd_events_published_total";

/// Gauge: committed seqs waiting for an earlier seq before delivery.
pub const EVENTS_PARKED: &str = "stationd_events_parked";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: bookings moved by the sweeper. Labels: outcome.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "stationd_sweep_transitions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus metrics exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used on metrics and spans.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::CreateBooking { .. } => "create_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::Assign { .. } => "assign",
        Request::Unassign { .. } => "unassign",
        Request::Withdraw { .. } => "withdraw",
        Request::Restore { .. } => "restore",
        Request::GrantUsage { .. } => "grant_usage",
        Request::ToggleActive { .. } => "toggle_active",
        Request::CreateStation { .. } => "create_station",
        Request::DeleteStation { .. } => "delete_station",
        Request::RegisterPerson { .. } => "register_person",
        Request::RemovePerson { .. } => "remove_person",
        Request::GetStation { .. } => "get_station",
        Request::ListStations => "list_stations",
        Request::GetPerson { .. } => "get_person",
        Request::ListPeople => "list_people",
        Request::GetBooking { .. } => "get_booking",
        Request::ListBookings { .. } => "list_bookings",
        Request::LabStatus => "lab_status",
        Request::WeekSchedule => "week_schedule",
        Request::ToggleDay { .. } => "toggle_day",
        Request::DayBookings { .. } => "day_bookings",
        Request::Subscribe => "subscribe",
    }
}
