use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Position of one booking in its schedule's start-ordered index.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: Ulid,
    span: Span,
}

/// In-memory document collections plus the `(schedule_id, start, end)` index.
pub(super) struct Documents {
    pub(super) schedules: DashMap<Ulid, Schedule>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    by_schedule: DashMap<Ulid, Vec<IndexEntry>>,
    pub(super) leases: DashMap<String, Lease>,
    pub(super) idempotency: DashMap<String, IdempotencyRecord>,
}

impl Documents {
    pub(super) fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            bookings: DashMap::new(),
            by_schedule: DashMap::new(),
            leases: DashMap::new(),
            idempotency: DashMap::new(),
        }
    }

    /// Apply a journal event. Conditions were checked by the caller; this only mutates.
    pub(super) fn apply_event(&self, event: &Event) {
        match event {
            Event::SchedulePut { schedule } => {
                self.schedules.insert(schedule.id, schedule.clone());
            }
            Event::BookingInserted { booking } => {
                self.index_insert(booking.schedule_id, booking.id, booking.span);
                self.bookings.insert(booking.id, booking.clone());
            }
            Event::BookingReplaced { booking } => {
                let previous = self.bookings.insert(booking.id, booking.clone());
                if let Some(prev) = previous
                    && (prev.span != booking.span || prev.schedule_id != booking.schedule_id)
                {
                    self.index_remove(prev.schedule_id, booking.id);
                    self.index_insert(booking.schedule_id, booking.id, booking.span);
                } else if !self.index_contains(booking.schedule_id, booking.id) {
                    self.index_insert(booking.schedule_id, booking.id, booking.span);
                }
            }
            Event::LeaseWritten { lease } => {
                self.leases.insert(lease.lock_key.clone(), lease.clone());
            }
            Event::LeaseExtended {
                lock_key,
                token,
                expires_at,
            } => {
                if let Some(mut lease) = self.leases.get_mut(lock_key)
                    && lease.token == *token
                {
                    lease.expires_at = *expires_at;
                }
            }
            Event::LeaseDeleted { lock_key, token } => {
                self.leases.remove_if(lock_key, |_, l| l.token == *token);
            }
            Event::IdempotencyWritten { record } => {
                self.idempotency.insert(record.key.clone(), record.clone());
            }
            Event::IdempotencyCommitted {
                key,
                token,
                booking_id,
                expires_at,
            } => {
                if let Some(mut record) = self.idempotency.get_mut(key)
                    && record.token == *token
                {
                    record.state = IdempotencyState::Committed {
                        booking_id: *booking_id,
                    };
                    record.expires_at = *expires_at;
                }
            }
            Event::IdempotencyDeleted { key, token } => {
                self.idempotency.remove_if(key, |_, r| r.token == *token);
            }
        }
    }

    /// Bookings on a schedule whose span overlaps `window`.
    /// Binary search skips entries starting at or after `window.end`.
    pub(super) fn overlapping(&self, schedule_id: Ulid, window: &Span) -> Vec<Booking> {
        let ids: Vec<Ulid> = match self.by_schedule.get(&schedule_id) {
            Some(entries) => {
                let right_bound = entries.partition_point(|e| e.span.start < window.end);
                entries[..right_bound]
                    .iter()
                    .filter(|e| e.span.end > window.start)
                    .map(|e| e.id)
                    .collect()
            }
            None => return Vec::new(),
        };
        ids.into_iter()
            .filter_map(|id| self.bookings.get(&id).map(|b| b.value().clone()))
            // A concurrent replace may have moved it since the index read
            .filter(|b| b.schedule_id == schedule_id && b.span.overlaps(window))
            .collect()
    }

    /// Every document that is still meaningful at `now`, as events that recreate it.
    pub(super) fn snapshot(&self, now: Ms) -> Vec<Event> {
        let mut events = Vec::new();
        for entry in self.schedules.iter() {
            events.push(Event::SchedulePut {
                schedule: entry.value().clone(),
            });
        }
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        for booking in bookings {
            events.push(Event::BookingInserted { booking });
        }
        for entry in self.leases.iter() {
            if entry.value().is_live(now) {
                events.push(Event::LeaseWritten {
                    lease: entry.value().clone(),
                });
            }
        }
        for entry in self.idempotency.iter() {
            if entry.value().is_live(now) {
                events.push(Event::IdempotencyWritten {
                    record: entry.value().clone(),
                });
            }
        }
        events
    }

    fn index_insert(&self, schedule_id: Ulid, id: Ulid, span: Span) {
        let mut entries = self.by_schedule.entry(schedule_id).or_default();
        let pos = entries
            .binary_search_by_key(&span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        entries.insert(pos, IndexEntry { id, span });
    }

    fn index_remove(&self, schedule_id: Ulid, id: Ulid) {
        if let Some(mut entries) = self.by_schedule.get_mut(&schedule_id)
            && let Some(pos) = entries.iter().position(|e| e.id == id)
        {
            entries.remove(pos);
        }
    }

    fn index_contains(&self, schedule_id: Ulid, id: Ulid) -> bool {
        self.by_schedule
            .get(&schedule_id)
            .is_some_and(|entries| entries.iter().any(|e| e.id == id))
    }
}
