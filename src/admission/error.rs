use ulid::Ulid;

use crate::lease::LeaseError;
use crate::model::{BookingStatus, Ms};
use crate::store::StoreError;

#[derive(Debug)]
pub enum AdmissionError {
    // ── Rejections: terminal for this request ──
    /// Overlaps an active booking on an exclusive schedule.
    Conflict(Ulid),
    CapacityExceeded {
        requested: u32,
        max: u32,
    },
    InvalidWindow {
        start: Ms,
        end: Ms,
    },
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    OutsideWorkingHours,
    BookingCancelled(Ulid),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    IdempotencyKeyReused,
    /// The request could not be encoded for its idempotency fingerprint.
    Unencodable(String),

    // ── Transient: safe to retry the whole request ──
    /// Lease not obtained within the retry budget, or lost a version race.
    Contended,
    /// The same idempotency key is being admitted right now.
    InFlight,
    DeadlineExceeded,
    StoreUnavailable(String),
}

impl AdmissionError {
    /// True when retrying the whole request (same idempotency key included) is sane.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdmissionError::Contended
                | AdmissionError::InFlight
                | AdmissionError::DeadlineExceeded
                | AdmissionError::StoreUnavailable(_)
        )
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            AdmissionError::CapacityExceeded { requested, max } => {
                write!(f, "capacity exceeded: {requested} more would pass the slot maximum of {max}")
            }
            AdmissionError::InvalidWindow { start, end } => {
                write!(f, "invalid window [{start}, {end}): end must be after start")
            }
            AdmissionError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition {from} -> {to}")
            }
            AdmissionError::OutsideWorkingHours => write!(f, "outside the schedule's working hours"),
            AdmissionError::BookingCancelled(id) => write!(f, "booking {id} is cancelled"),
            AdmissionError::NotFound(id) => write!(f, "not found: {id}"),
            AdmissionError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            AdmissionError::IdempotencyKeyReused => {
                write!(f, "idempotency key already used for a different request")
            }
            AdmissionError::Unencodable(e) => write!(f, "request cannot be encoded: {e}"),
            AdmissionError::Contended => write!(f, "schedule busy, retry the request"),
            AdmissionError::InFlight => write!(f, "request with this idempotency key in progress"),
            AdmissionError::DeadlineExceeded => write!(f, "admission deadline exceeded"),
            AdmissionError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AdmissionError::NotFound(id),
            StoreError::VersionMismatch { .. } => AdmissionError::Contended,
            StoreError::Unavailable(msg) => AdmissionError::StoreUnavailable(msg),
            other @ StoreError::AlreadyExists(_) => AdmissionError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<LeaseError> for AdmissionError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::Busy(_) | LeaseError::Lost(_) => AdmissionError::Contended,
            LeaseError::Store(e) => e.into(),
        }
    }
}
