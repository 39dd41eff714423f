//! Booking admission: the one place that decides whether a booking may exist.
//!
//! Every create, and every update that moves a booking or changes its
//! capacity, goes through the same sequence:
//!
//! ```text
//! Received → LockPending → Validating → Decided{Admitted|Rejected} → Released
//! ```
//!
//! The lease is taken before conflicts are read, so two requests for
//! overlapping windows on the same schedule can never both see a clear
//! calendar. The lease is given back on every exit path.

mod error;
mod mutations;

pub use error::AdmissionError;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::AdmissionConfig;
use crate::idempotency::IdempotencyGuard;
use crate::lease::{LeaseError, LeaseSet, LockManager, lock_keys};
use crate::limits::*;
use crate::model::*;
use crate::overlap::{Verdict, find_conflicts, verdict};
use crate::store::DocumentStore;

/// A booking request that has passed field-level validation upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDraft {
    pub business_id: Ulid,
    pub schedule_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub participants: Contacts,
    pub managed_by: Contacts,
    pub label: Option<String>,
    /// Contact of the admin acting for the business. Stripped from
    /// `participants` and `managed_by` before admission.
    pub requested_by: Option<String>,
    /// Not part of the request fingerprint.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

impl BookingDraft {
    pub fn new(business_id: Ulid, schedule_id: Ulid, span: Span, capacity: u32) -> Self {
        Self {
            business_id,
            schedule_id,
            span,
            capacity,
            participants: Contacts::new(),
            managed_by: Contacts::new(),
            label: None,
            requested_by: None,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_participant(mut self, contact: impl Into<String>, name: impl Into<String>) -> Self {
        self.participants.insert(contact.into(), name.into());
        self
    }
}

/// Partial update. Changing `span` or `capacity` re-enters admission;
/// everything else is a plain conditional replace.
#[derive(Debug, Clone, Default)]
pub struct BookingPatch {
    pub span: Option<Span>,
    pub capacity: Option<u32>,
    pub participants: Option<Contacts>,
    pub managed_by: Option<Contacts>,
    pub label: Option<Option<String>>,
    pub requested_by: Option<String>,
}

/// Successful create. A replay is not an error: it hands back the original booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(Booking),
    Replayed(Booking),
}

impl Admission {
    pub fn booking(&self) -> &Booking {
        match self {
            Admission::Admitted(b) | Admission::Replayed(b) => b,
        }
    }

    pub fn into_booking(self) -> Booking {
        match self {
            Admission::Admitted(b) | Admission::Replayed(b) => b,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Admission::Replayed(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Received,
    LockPending,
    Validating,
    Admitted,
    Rejected,
    Released,
}

fn phase(booking_id: Ulid, phase: Phase) {
    debug!("booking {booking_id}: {phase:?}");
}

/// What to persist once the window is clear.
enum Write {
    Insert(Booking),
    Replace { booking: Booking, expected_version: u64 },
}

impl Write {
    fn booking(&self) -> &Booking {
        match self {
            Write::Insert(b) | Write::Replace { booking: b, .. } => b,
        }
    }
}

pub struct BookingCoordinator {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    idempotency: IdempotencyGuard,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
}

impl BookingCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, config: AdmissionConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn DocumentStore>, config: AdmissionConfig, clock: Arc<dyn Clock>) -> Self {
        let locks = LockManager::new(store.clone(), clock.clone(), config.holder.clone());
        // A reservation must outlast the attempt it guards, including the commit after it.
        let idempotency = IdempotencyGuard::new(
            store.clone(),
            clock.clone(),
            config.idempotency_ttl_ms(),
            2 * config.request_timeout_ms(),
        );
        Self {
            store,
            locks,
            idempotency,
            clock,
            config,
        }
    }

    pub async fn get(&self, id: Ulid) -> Result<Booking, AdmissionError> {
        self.store
            .get_booking(id)
            .await?
            .ok_or(AdmissionError::NotFound(id))
    }

    /// Active bookings on a schedule overlapping `window`, in start order.
    pub async fn active_bookings(&self, schedule_id: Ulid, window: Span) -> Result<Vec<Booking>, AdmissionError> {
        let mut bookings: Vec<Booking> = self
            .store
            .bookings_overlapping(schedule_id, window)
            .await?
            .into_iter()
            .filter(|b| b.status.is_active())
            .collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));
        Ok(bookings)
    }

    async fn load_schedule(&self, schedule_id: Ulid, business_id: Ulid) -> Result<Schedule, AdmissionError> {
        match self.store.get_schedule(schedule_id).await? {
            // A schedule of another business is as good as missing
            Some(s) if s.business_id == business_id => {
                if !(0..=MAX_BUFFER_AFTER_MS).contains(&s.buffer()) {
                    return Err(AdmissionError::LimitExceeded("schedule buffer out of range"));
                }
                Ok(s)
            }
            _ => Err(AdmissionError::NotFound(schedule_id)),
        }
    }

    /// Lease → decide → write → release.
    async fn admit_under_lease(&self, schedule: &Schedule, write: Write) -> Result<Booking, AdmissionError> {
        let booking_id = write.booking().id;
        let span = write.booking().span;
        let buffer = schedule.buffer();
        let lock_window = Span {
            start: span.start - buffer,
            end: span.end + buffer,
        };
        let keys = lock_keys(schedule.id, &lock_window, self.config.lock_granularity);

        phase(booking_id, Phase::LockPending);
        let mut leases = self.acquire_with_backoff(&keys).await?;

        phase(booking_id, Phase::Validating);
        let decided = self.decide_and_write(&mut leases, schedule, write).await;
        match &decided {
            Ok(_) => phase(booking_id, Phase::Admitted),
            Err(e) => debug!("booking {booking_id}: {:?} ({e})", Phase::Rejected),
        }

        leases.release().await;
        phase(booking_id, Phase::Released);
        decided
    }

    async fn acquire_with_backoff(&self, keys: &[String]) -> Result<LeaseSet, AdmissionError> {
        let lease_ms = self.config.lease_duration_ms();
        let mut attempt = 1;
        loop {
            match self.locks.acquire_all(keys, lease_ms).await {
                Ok(set) => return Ok(set),
                Err(LeaseError::Busy(key)) if attempt < self.config.acquire_max_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!("lease {key} busy, retry {attempt} in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(LeaseError::Busy(key)) => {
                    debug!("lease {key} still busy after {attempt} attempts");
                    return Err(AdmissionError::Contended);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Runs with every lease for the window held.
    async fn decide_and_write(
        &self,
        leases: &mut LeaseSet,
        schedule: &Schedule,
        write: Write,
    ) -> Result<Booking, AdmissionError> {
        // The schedule may have been edited while we waited. Lock keys depend on
        // the buffer, so a changed buffer means we may hold the wrong keys.
        let current = self.load_schedule(schedule.id, schedule.business_id).await?;
        if current.buffer() != schedule.buffer() {
            return Err(AdmissionError::Contended);
        }

        let booking = write.booking();
        let exclude = match &write {
            Write::Insert(_) => None,
            Write::Replace { booking, .. } => Some(booking.id),
        };
        let conflicts = find_conflicts(self.store.as_ref(), &current, &booking.span, exclude).await?;
        match verdict(&conflicts, booking.capacity, current.max_participants_per_slot) {
            Verdict::Clear => {}
            Verdict::Conflict(id) => return Err(AdmissionError::Conflict(id)),
            Verdict::CapacityExceeded { requested, max } => {
                return Err(AdmissionError::CapacityExceeded { requested, max });
            }
        }

        self.keep_alive(leases).await?;
        match write {
            Write::Insert(booking) => {
                self.store.insert_booking(booking.clone()).await?;
                Ok(booking)
            }
            Write::Replace {
                booking,
                expected_version,
            } => Ok(self.store.replace_booking(booking, expected_version).await?),
        }
    }

    /// Renew if more than half the lease is gone, so the write never lands on a
    /// lease someone else may already have reclaimed.
    async fn keep_alive(&self, leases: &mut LeaseSet) -> Result<(), AdmissionError> {
        let lease_ms = self.config.lease_duration_ms();
        let Some(acquired_at) = leases.acquired_at() else {
            return Ok(());
        };
        if self.clock.now_ms() - acquired_at > lease_ms / 2 {
            leases.renew(lease_ms).await?;
        }
        Ok(())
    }
}

// ── Request checks ───────────────────────────────────────────────

fn validate_window(span: &Span) -> Result<(), AdmissionError> {
    if !span.is_valid() {
        return Err(AdmissionError::InvalidWindow {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(AdmissionError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(AdmissionError::LimitExceeded("booking too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), AdmissionError> {
    if capacity == 0 {
        return Err(AdmissionError::LimitExceeded("capacity must be at least 1"));
    }
    if capacity > MAX_BOOKING_CAPACITY {
        return Err(AdmissionError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_contacts(contacts: &Contacts) -> Result<(), AdmissionError> {
    if contacts.len() > MAX_PARTICIPANTS {
        return Err(AdmissionError::LimitExceeded("too many contacts"));
    }
    if contacts
        .iter()
        .any(|(k, v)| k.len() > MAX_CONTACT_LEN || v.len() > MAX_CONTACT_LEN)
    {
        return Err(AdmissionError::LimitExceeded("contact too long"));
    }
    Ok(())
}

fn validate_label(label: Option<&str>) -> Result<(), AdmissionError> {
    if label.is_some_and(|l| l.len() > MAX_LABEL_LEN) {
        return Err(AdmissionError::LimitExceeded("label too long"));
    }
    Ok(())
}

fn check_working_hours(schedule: &Schedule, span: &Span) -> Result<(), AdmissionError> {
    match &schedule.working_hours {
        Some(hours) if !hours.admits(span) => Err(AdmissionError::OutsideWorkingHours),
        _ => Ok(()),
    }
}

/// The acting admin is never their own participant or maintainer.
fn strip_admin(contacts: &mut Contacts, admin: Option<&str>) {
    if let Some(admin) = admin {
        contacts.remove(admin);
    }
}
