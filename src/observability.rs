use std::net::SocketAddr;

use crate::engine::EngineError;

// ── Engine metrics ──────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "occupant_reservations_created_total";

/// Counter: reservation attempts rejected. Labels: kind.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "occupant_reservations_rejected_total";

/// Counter: reservations closed. Labels: cause.
pub const RESERVATIONS_FINISHED_TOTAL: &str = "occupant_reservations_finished_total";

/// Counter: expiry sweeps run. Labels: status.
pub const SWEEPS_TOTAL: &str = "occupant_sweeps_total";

/// Histogram: expiry sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "occupant_sweep_duration_seconds";

/// Counter: device status reports. Labels: status.
pub const DEVICE_REPORTS_TOTAL: &str = "occupant_device_reports_total";

/// Counter: device auto-release notifications. Labels: status.
pub const DEVICE_AUTO_RELEASES_TOTAL: &str = "occupant_device_auto_releases_total";

/// Counter: more than one active reservation found covering the same instant.
pub const INTEGRITY_VIOLATIONS_TOTAL: &str = "occupant_integrity_violations_total";

/// Counter: audit events the sink failed to record.
pub const AUDIT_FAILURES_TOTAL: &str = "occupant_audit_failures_total";

// ── Transport metrics ───────────────────────────────────────────

/// Gauge: open device connections.
pub const CONNECTIONS_ACTIVE: &str = "occupant_connections_active";

/// Counter: device connections accepted.
pub const CONNECTIONS_TOTAL: &str = "occupant_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "occupant_connections_rejected_total";

/// Counter: gateway requests. Labels: op, status.
pub const GATEWAY_REQUESTS_TOTAL: &str = "occupant_gateway_requests_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "occupant_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "occupant_wal_flush_batch_size";

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

/// Label for a result, `"ok"` or the error kind.
pub fn status_label<T>(result: &Result<T, EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}
