use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    /// Build a span, checking `start < end`. Use this for anything that came from a caller.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Extend the end by `after` ms (buffer/cleaning time).
    pub fn padded(&self, after: Ms) -> Span {
        Span {
            start: self.start,
            end: self.end + after,
        }
    }

    /// UTC day numbers touched by this span (end exclusive).
    pub fn days(&self) -> std::ops::RangeInclusive<i64> {
        self.start.div_euclid(DAY_MS)..=(self.end - 1).div_euclid(DAY_MS)
    }
}

// ── Booking status lifecycle ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    /// The only legal edges: pending→confirmed, pending→cancelled, confirmed→cancelled.
    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled)
        )
    }

    pub fn is_active(self) -> bool {
        self != BookingStatus::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contact identifier → display name.
pub type Contacts = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub business_id: Ulid,
    pub schedule_id: Ulid,
    pub span: Span,
    /// Participants reserved out of the schedule's per-slot maximum.
    pub capacity: u32,
    pub participants: Contacts,
    pub managed_by: Contacts,
    pub label: Option<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Bumped on every replace; conditional replaces compare against it.
    pub version: u64,
}

/// Schedule configuration. Owned by the schedule CRUD layer; the core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Ulid,
    pub business_id: Ulid,
    pub name: Option<String>,
    pub max_participants_per_slot: u32,
    pub working_hours: Option<WorkingHours>,
    /// Dead time in ms after each booking ends (e.g. cleaning).
    pub buffer_after: Option<Ms>,
}

impl Schedule {
    pub fn new(id: Ulid, business_id: Ulid, max_participants_per_slot: u32) -> Self {
        Self {
            id,
            business_id,
            name: None,
            max_participants_per_slot,
            working_hours: None,
            buffer_after: None,
        }
    }

    pub fn buffer(&self) -> Ms {
        self.buffer_after.unwrap_or(0)
    }
}

/// Daily opening window, as offsets from UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub open: Ms,
    pub close: Ms,
}

impl WorkingHours {
    /// A booking fits if it starts and ends on the same day inside `[open, close]`.
    pub fn admits(&self, span: &Span) -> bool {
        let day = span.start.div_euclid(DAY_MS);
        let base = day * DAY_MS;
        span.end <= base + DAY_MS
            && span.start - base >= self.open
            && span.end - base <= self.close
    }
}

// ── Coordination documents ───────────────────────────────────────

/// Advisory lock document. At most one live lease per `lock_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_key: String,
    /// Identifies one acquisition; renew/release must present it.
    pub token: Ulid,
    pub holder: String,
    pub expires_at: Ms,
    pub created_at: Ms,
}

impl Lease {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyState {
    /// First attempt in flight.
    Reserved,
    Committed { booking_id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub token: Ulid,
    /// CRC32 of the encoded draft that reserved the key.
    pub fingerprint: u32,
    pub state: IdempotencyState,
    pub expires_at: Ms,
}

impl IdempotencyRecord {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

/// Journal record format: one event per document mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SchedulePut {
        schedule: Schedule,
    },
    BookingInserted {
        booking: Booking,
    },
    BookingReplaced {
        booking: Booking,
    },
    LeaseWritten {
        lease: Lease,
    },
    LeaseExtended {
        lock_key: String,
        token: Ulid,
        expires_at: Ms,
    },
    LeaseDeleted {
        lock_key: String,
        token: Ulid,
    },
    IdempotencyWritten {
        record: IdempotencyRecord,
    },
    IdempotencyCommitted {
        key: String,
        token: Ulid,
        booking_id: Ulid,
        expires_at: Ms,
    },
    IdempotencyDeleted {
        key: String,
        token: Ulid,
    },
}
