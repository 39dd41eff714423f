use std::net::SocketAddr;

use crate::admission::AdmissionError;

// ── Admission (request-driven) ──────────────────────────────────

/// Counter: admission attempts. Labels: op, outcome.
pub const ADMISSIONS_TOTAL: &str = "bookd_admissions_total";

/// Histogram: admission latency in seconds, lease wait included. Labels: op.
pub const ADMISSION_DURATION_SECONDS: &str = "bookd_admission_duration_seconds";

/// Counter: idempotent replays answered from a committed record.
pub const IDEMPOTENCY_REPLAYS_TOTAL: &str = "bookd_idempotency_replays_total";

// ── Leases ──────────────────────────────────────────────────────

/// Counter: conditional lease writes attempted.
pub const LEASE_ACQUIRE_ATTEMPTS_TOTAL: &str = "bookd_lease_acquire_attempts_total";

/// Counter: acquire attempts that found a live lease.
pub const LEASE_BUSY_TOTAL: &str = "bookd_lease_busy_total";

/// Counter: expired leases taken over from a holder that never released.
pub const LEASE_RECLAIMED_TOTAL: &str = "bookd_lease_reclaimed_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

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

/// Short label for the `outcome` dimension.
pub fn outcome_label<T>(result: &Result<T, AdmissionError>) -> &'static str {
    match result {
        Ok(_) => "admitted",
        Err(AdmissionError::Conflict(_)) => "conflict",
        Err(AdmissionError::CapacityExceeded { .. }) => "capacity_exceeded",
        Err(AdmissionError::InvalidWindow { .. }) => "invalid_window",
        Err(AdmissionError::InvalidTransition { .. }) => "invalid_transition",
        Err(AdmissionError::OutsideWorkingHours) => "outside_working_hours",
        Err(AdmissionError::BookingCancelled(_)) => "booking_cancelled",
        Err(AdmissionError::NotFound(_)) => "not_found",
        Err(AdmissionError::LimitExceeded(_)) => "limit_exceeded",
        Err(AdmissionError::IdempotencyKeyReused) => "idempotency_key_reused",
        Err(AdmissionError::Unencodable(_)) => "unencodable",
        Err(AdmissionError::Contended) => "contended",
        Err(AdmissionError::InFlight) => "in_flight",
        Err(AdmissionError::DeadlineExceeded) => "deadline_exceeded",
        Err(AdmissionError::StoreUnavailable(_)) => "store_unavailable",
    }
}
