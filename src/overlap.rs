use ulid::Ulid;

use crate::model::*;
use crate::store::{DocumentStore, StoreError};

/// Why a window cannot be admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    /// Exclusive schedule and this booking is in the way.
    Conflict(Ulid),
    CapacityExceeded { requested: u32, max: u32 },
}

/// Non-cancelled bookings on `schedule` that collide with `window`.
///
/// Both sides are padded by the schedule's `buffer_after`: an existing booking
/// blocks until its end + buffer, and the new one needs its own buffer free.
/// `exclude` drops the booking being rescheduled so it doesn't collide with itself.
pub async fn find_conflicts(
    store: &dyn DocumentStore,
    schedule: &Schedule,
    window: &Span,
    exclude: Option<Ulid>,
) -> Result<Vec<Booking>, StoreError> {
    let buffer = schedule.buffer();
    // Widen the search so bookings ending within `buffer` before us are seen.
    let search = Span {
        start: window.start - buffer,
        end: window.end + buffer,
    };
    let candidates = store.bookings_overlapping(schedule.id, search).await?;
    Ok(conflicts_among(candidates, window, buffer, exclude))
}

/// Pure part of [`find_conflicts`]: filter candidates by status, exclusion, and padded overlap.
pub fn conflicts_among(
    candidates: Vec<Booking>,
    window: &Span,
    buffer: Ms,
    exclude: Option<Ulid>,
) -> Vec<Booking> {
    let ours = window.padded(buffer);
    let mut conflicts: Vec<Booking> = candidates
        .into_iter()
        .filter(|b| b.status.is_active())
        .filter(|b| Some(b.id) != exclude)
        .filter(|b| b.span.padded(buffer).overlaps(window) || ours.overlaps(&b.span))
        .collect();
    conflicts.sort_by_key(|b| (b.span.start, b.id));
    conflicts
}

/// Sum of reserved capacity across `conflicts` plus `requested` is over `max_per_slot`.
pub fn capacity_exceeded(conflicts: &[Booking], requested: u32, max_per_slot: u32) -> bool {
    let reserved: u64 = conflicts.iter().map(|b| u64::from(b.capacity)).sum();
    reserved + u64::from(requested) > u64::from(max_per_slot)
}

/// Decide a window given its conflicts. Exclusive schedules report the first
/// conflicting booking; shared ones report capacity.
pub fn verdict(conflicts: &[Booking], requested: u32, max_per_slot: u32) -> Verdict {
    if requested > max_per_slot {
        return Verdict::CapacityExceeded {
            requested,
            max: max_per_slot,
        };
    }
    if max_per_slot <= 1 {
        if let Some(first) = conflicts.first() {
            return Verdict::Conflict(first.id);
        }
        return Verdict::Clear;
    }
    if capacity_exceeded(conflicts, requested, max_per_slot) {
        return Verdict::CapacityExceeded {
            requested,
            max: max_per_slot,
        };
    }
    Verdict::Clear
}
