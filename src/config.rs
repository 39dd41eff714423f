use std::time::Duration;

use crate::model::{DAY_MS, Ms};

/// Contention scope for admission leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGranularity {
    /// One lease per schedule.
    Schedule,
    /// One lease per schedule per UTC day; admissions on different days run in parallel.
    Day,
}

impl LockGranularity {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "schedule" => Some(LockGranularity::Schedule),
            "day" => Some(LockGranularity::Day),
            _ => None,
        }
    }
}

/// Knobs for the admission core. Defaults suit a single-region deployment.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub lease_duration: Duration,
    /// Conditional lease writes per admission before giving up with `Contended`.
    pub acquire_max_attempts: u32,
    pub acquire_backoff: Duration,
    pub acquire_backoff_max: Duration,
    pub idempotency_ttl: Duration,
    /// Deadline for one whole admission attempt, lease wait included.
    pub request_timeout: Duration,
    pub lock_granularity: LockGranularity,
    /// Recorded on lease documents for diagnostics.
    pub holder: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(5_000),
            acquire_max_attempts: 6,
            acquire_backoff: Duration::from_millis(10),
            acquire_backoff_max: Duration::from_millis(250),
            idempotency_ttl: Duration::from_millis(DAY_MS as u64),
            request_timeout: Duration::from_millis(10_000),
            lock_granularity: LockGranularity::Schedule,
            holder: format!("bookd-{}", std::process::id()),
        }
    }
}

impl AdmissionConfig {
    /// Read `BOOKD_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ms = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };
        let defaults = Self::default();
        let mut config = Self {
            lease_duration: ms("BOOKD_LEASE_DURATION_MS").unwrap_or(defaults.lease_duration),
            acquire_max_attempts: lookup("BOOKD_ACQUIRE_MAX_ATTEMPTS")
                .and_then(|s| s.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.acquire_max_attempts),
            acquire_backoff: ms("BOOKD_ACQUIRE_BACKOFF_MS").unwrap_or(defaults.acquire_backoff),
            acquire_backoff_max: ms("BOOKD_ACQUIRE_BACKOFF_MAX_MS")
                .unwrap_or(defaults.acquire_backoff_max),
            idempotency_ttl: ms("BOOKD_IDEMPOTENCY_TTL_MS").unwrap_or(defaults.idempotency_ttl),
            request_timeout: ms("BOOKD_REQUEST_TIMEOUT_MS").unwrap_or(defaults.request_timeout),
            lock_granularity: lookup("BOOKD_LOCK_GRANULARITY")
                .and_then(|s| LockGranularity::parse(&s))
                .unwrap_or(defaults.lock_granularity),
            holder: lookup("BOOKD_HOLDER").unwrap_or(defaults.holder),
        };
        if config.acquire_backoff_max < config.acquire_backoff {
            config.acquire_backoff_max = config.acquire_backoff;
        }
        config
    }

    pub fn lease_duration_ms(&self) -> Ms {
        self.lease_duration.as_millis() as Ms
    }

    pub fn idempotency_ttl_ms(&self) -> Ms {
        self.idempotency_ttl.as_millis() as Ms
    }

    pub fn request_timeout_ms(&self) -> Ms {
        self.request_timeout.as_millis() as Ms
    }

    /// Sleep before retry number `attempt` (1-based): base · 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.acquire_backoff
            .saturating_mul(factor)
            .min(self.acquire_backoff_max)
    }
}
