use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::idempotency::{IdempotencyCheck, Reservation, fingerprint};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, outcome_label};
use crate::store::StoreError;

use super::*;

fn record<T>(op: &'static str, started: Instant, result: &Result<T, AdmissionError>) {
    metrics::counter!(observability::ADMISSIONS_TOTAL, "op" => op, "outcome" => outcome_label(result))
        .increment(1);
    metrics::histogram!(observability::ADMISSION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}

impl BookingCoordinator {
    /// Admit a new booking, or replay the result of an earlier attempt with the
    /// same idempotency key.
    pub async fn create(&self, draft: BookingDraft) -> Result<Admission, AdmissionError> {
        let started = Instant::now();
        let result = self.create_inner(draft).await;
        record("create", started, &result);
        if let Ok(Admission::Admitted(b)) = &result {
            info!("admitted booking {} on schedule {} [{}, {})", b.id, b.schedule_id, b.span.start, b.span.end);
        }
        result
    }

    async fn create_inner(&self, mut draft: BookingDraft) -> Result<Admission, AdmissionError> {
        validate_window(&draft.span)?;
        validate_capacity(draft.capacity)?;
        validate_label(draft.label.as_deref())?;
        let admin = draft.requested_by.clone();
        strip_admin(&mut draft.participants, admin.as_deref());
        strip_admin(&mut draft.managed_by, admin.as_deref());
        validate_contacts(&draft.participants)?;
        validate_contacts(&draft.managed_by)?;

        let reservation = match draft.idempotency_key.as_deref() {
            None => None,
            Some(key) if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN => {
                return Err(AdmissionError::LimitExceeded("bad idempotency key"));
            }
            Some(key) => {
                let request_fp =
                    fingerprint(&draft).map_err(|e| AdmissionError::Unencodable(e.to_string()))?;
                match self.idempotency.check_or_reserve(key, request_fp).await? {
                    IdempotencyCheck::Reserved(r) => Some(r),
                    IdempotencyCheck::Seen(booking_id) => {
                        metrics::counter!(observability::IDEMPOTENCY_REPLAYS_TOTAL).increment(1);
                        info!("replayed idempotency key {key} -> booking {booking_id}");
                        return Ok(Admission::Replayed(self.get(booking_id).await?));
                    }
                    IdempotencyCheck::InFlight => return Err(AdmissionError::InFlight),
                    IdempotencyCheck::KeyReused => return Err(AdmissionError::IdempotencyKeyReused),
                }
            }
        };

        let outcome = match tokio::time::timeout(self.config.request_timeout, self.admit_new(&draft)).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::DeadlineExceeded),
        };

        if let Some(reservation) = reservation {
            self.settle(&reservation, &outcome).await;
        }
        outcome.map(Admission::Admitted)
    }

    /// Commit the key on success, free it on anything else.
    async fn settle(&self, reservation: &Reservation, outcome: &Result<Booking, AdmissionError>) {
        match outcome {
            Ok(booking) => match self.idempotency.commit(reservation, booking.id).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "idempotency key {} lapsed before commit of booking {}",
                    reservation.key, booking.id
                ),
                Err(e) => warn!("idempotency commit for {} failed: {e}", reservation.key),
            },
            Err(_) => {
                if let Err(e) = self.idempotency.abandon(reservation).await {
                    warn!("idempotency abandon for {} failed, left to expire: {e}", reservation.key);
                }
            }
        }
    }

    async fn admit_new(&self, draft: &BookingDraft) -> Result<Booking, AdmissionError> {
        let schedule = self.load_schedule(draft.schedule_id, draft.business_id).await?;
        check_working_hours(&schedule, &draft.span)?;

        let now = self.clock.now_ms();
        let booking = Booking {
            id: Ulid::new(),
            business_id: draft.business_id,
            schedule_id: draft.schedule_id,
            span: draft.span,
            capacity: draft.capacity,
            participants: draft.participants.clone(),
            managed_by: draft.managed_by.clone(),
            label: draft.label.clone(),
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        phase(booking.id, Phase::Received);
        self.admit_under_lease(&schedule, Write::Insert(booking)).await
    }

    /// Apply a patch. A new window or capacity is re-admitted with the booking's
    /// own interval excluded; other fields are replaced without a lease.
    pub async fn update(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, AdmissionError> {
        let started = Instant::now();
        let result = self.update_inner(id, patch).await;
        record("update", started, &result);
        result
    }

    async fn update_inner(&self, id: Ulid, patch: BookingPatch) -> Result<Booking, AdmissionError> {
        if let Some(span) = &patch.span {
            validate_window(span)?;
        }
        if let Some(capacity) = patch.capacity {
            validate_capacity(capacity)?;
        }
        if let Some(Some(label)) = &patch.label {
            validate_label(Some(label))?;
        }

        let current = self.get(id).await?;
        if !current.status.is_active() {
            return Err(AdmissionError::BookingCancelled(id));
        }

        let mut next = current.clone();
        next.span = patch.span.unwrap_or(current.span);
        next.capacity = patch.capacity.unwrap_or(current.capacity);
        if let Some(participants) = patch.participants {
            next.participants = participants;
        }
        if let Some(managed_by) = patch.managed_by {
            next.managed_by = managed_by;
        }
        if let Some(label) = patch.label {
            next.label = label;
        }
        strip_admin(&mut next.participants, patch.requested_by.as_deref());
        strip_admin(&mut next.managed_by, patch.requested_by.as_deref());
        validate_contacts(&next.participants)?;
        validate_contacts(&next.managed_by)?;
        next.updated_at = self.clock.now_ms();

        if next.span == current.span && next.capacity == current.capacity {
            return Ok(self.store.replace_booking(next, current.version).await?);
        }

        let readmit = async {
            let schedule = self.load_schedule(current.schedule_id, current.business_id).await?;
            check_working_hours(&schedule, &next.span)?;
            phase(id, Phase::Received);
            self.admit_under_lease(
                &schedule,
                Write::Replace {
                    booking: next,
                    expected_version: current.version,
                },
            )
            .await
        };
        let booking = match tokio::time::timeout(self.config.request_timeout, readmit).await {
            Ok(result) => result?,
            Err(_) => return Err(AdmissionError::DeadlineExceeded),
        };
        info!("rescheduled booking {id} to [{}, {})", booking.span.start, booking.span.end);
        Ok(booking)
    }

    /// Move a booking along its lifecycle. Only pending→confirmed,
    /// pending→cancelled and confirmed→cancelled are legal.
    pub async fn set_status(&self, id: Ulid, to: BookingStatus) -> Result<Booking, AdmissionError> {
        let started = Instant::now();
        let result = self.set_status_inner(id, to).await;
        record("set_status", started, &result);
        result
    }

    async fn set_status_inner(&self, id: Ulid, to: BookingStatus) -> Result<Booking, AdmissionError> {
        for _ in 0..MAX_STATUS_RETRIES {
            let current = self.get(id).await?;
            if !current.status.can_transition_to(to) {
                return Err(AdmissionError::InvalidTransition {
                    from: current.status,
                    to,
                });
            }
            let mut next = current.clone();
            next.status = to;
            next.updated_at = self.clock.now_ms();
            match self.store.replace_booking(next, current.version).await {
                Ok(booking) => {
                    info!("booking {id}: {} -> {to}", current.status);
                    return Ok(booking);
                }
                // Someone else changed it; re-read and re-check the edge
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(AdmissionError::Contended)
    }

    pub async fn confirm(&self, id: Ulid) -> Result<Booking, AdmissionError> {
        self.set_status(id, BookingStatus::Confirmed).await
    }

    /// Cancelled bookings stay on record but stop counting against the schedule at once.
    pub async fn cancel(&self, id: Ulid) -> Result<Booking, AdmissionError> {
        self.set_status(id, BookingStatus::Cancelled).await
    }
}
