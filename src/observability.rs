use std::net::SocketAddr;

// ── Write pipeline ──────────────────────────────────────────────

/// Counter: appointments created. Labels: kind (single, recurrence).
pub const APPOINTMENTS_CREATED_TOTAL: &str = "visitas_appointments_created_total";

/// Counter: appointments updated.
pub const APPOINTMENTS_UPDATED_TOTAL: &str = "visitas_appointments_updated_total";

/// Counter: appointments soft-deleted.
pub const APPOINTMENTS_DELETED_TOTAL: &str = "visitas_appointments_deleted_total";

/// Counter: saves rejected by the slot check. Labels: stage (cache, store).
pub const CONFLICTS_REJECTED_TOTAL: &str = "visitas_conflicts_rejected_total";

/// Counter: saves or deletes rejected by the time lock.
pub const LOCK_REJECTED_TOTAL: &str = "visitas_lock_rejected_total";

/// Counter: failed store calls surfaced as communication errors.
pub const STORE_ERRORS_TOTAL: &str = "visitas_store_errors_total";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: soft-deleted documents removed by the retention sweep.
pub const SWEEP_REMOVED_TOTAL: &str = "visitas_sweep_removed_total";

/// Counter: hard deletes that failed during a sweep.
pub const SWEEP_FAILURES_TOTAL: &str = "visitas_sweep_failures_total";

/// Gauge: appointments in the live cache.
pub const CACHE_APPOINTMENTS: &str = "visitas_cache_appointments";

/// Counter: failed sign-ins.
pub const AUTH_FAILURES_TOTAL: &str = "visitas_auth_failures_total";

/// Histogram: log group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "visitas_wal_flush_duration_seconds";

/// Histogram: commits per log flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "visitas_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
