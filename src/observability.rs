use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkease_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkease_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: reservation outcomes. Labels: outcome (created, unavailable,
/// duplicate, cancelled).
pub const RESERVATIONS_TOTAL: &str = "parkease_reservations_total";

/// Counter: reservations released by the expiry sweep.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "parkease_reservations_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkease_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkease_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkease_connections_rejected_total";

/// Gauge: number of open sites (loaded engines).
pub const SITES_ACTIVE: &str = "parkease_sites_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkease_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkease_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server runs without an exporter.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertReservation(_) => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUpcoming => "select_upcoming",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectFloorCounts { .. } => "select_floor_counts",
        Command::InsertSlotStatus { .. } => "insert_slot_status",
        Command::InsertUser(_) => "insert_user",
        Command::SelectUser => "select_user",
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::SelectVehicles => "select_vehicles",
        Command::SelectDocuments => "select_documents",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
