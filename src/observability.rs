use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reservd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reservd_query_duration_seconds";

/// Counter: reservation lifecycle operations. Labels: op, outcome.
pub const RESERVATIONS_TOTAL: &str = "reservd_reservations_total";

/// Counter: reservations moved to `expired` by the reaper.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "reservd_reservations_expired_total";

/// Counter: records physically removed. Labels: source (reaper, cleanup).
pub const RESERVATIONS_PURGED_TOTAL: &str = "reservd_reservations_purged_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "reservd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertReservation { .. } => "reserve",
        Command::Confirm { .. } => "confirm",
        Command::Cancel { .. } => "cancel",
        Command::Cleanup { .. } => "cleanup",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectSlots { .. } => "select_slots",
    }
}

/// Outcome label for a lifecycle operation result.
pub fn outcome_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(EngineError::Validation(_)) => "invalid",
        Err(EngineError::Conflict(_)) => "conflict",
        Err(EngineError::NotFound(_)) => "not_found",
        Err(EngineError::Expired(_)) => "expired",
        Err(EngineError::AlreadyExists(_)) => "already_exists",
        Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        Err(EngineError::WalError(_)) => "wal_error",
    }
}
