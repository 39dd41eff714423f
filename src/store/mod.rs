//! Document store contract the admission core is written against.
//!
//! The store offers single-document atomic conditional writes and a range
//! query over bookings by `(schedule_id, start, end)`. Nothing here spans two
//! documents; mutual exclusion across documents is built out of leases.

mod documents;
mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// Backend unreachable or the journal failed. Transient.
    Unavailable(String),
    AlreadyExists(Ulid),
    NotFound(Ulid),
    VersionMismatch { expected: u64, actual: u64 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::AlreadyExists(id) => write!(f, "document already exists: {id}"),
            StoreError::NotFound(id) => write!(f, "document not found: {id}"),
            StoreError::VersionMismatch { expected, actual } => {
                write!(f, "version mismatch: expected {expected}, found {actual}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of the conditional lease write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseWrite {
    /// No lease existed for the key.
    Created,
    /// An expired lease was overwritten.
    Reclaimed,
    /// A live lease exists; nothing was written.
    Held,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // ── Schedules (read-mostly, owned by the schedule CRUD layer) ──

    async fn get_schedule(&self, id: Ulid) -> Result<Option<Schedule>, StoreError>;

    async fn put_schedule(&self, schedule: Schedule) -> Result<(), StoreError>;

    // ── Bookings ──

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Insert; fails with `AlreadyExists` if the id is taken.
    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError>;

    /// Replace only if the stored version equals `expected_version`.
    /// The store assigns `expected_version + 1` and returns what it wrote.
    async fn replace_booking(
        &self,
        booking: Booking,
        expected_version: u64,
    ) -> Result<Booking, StoreError>;

    /// All bookings on `schedule_id` (any status) whose span overlaps `window`.
    async fn bookings_overlapping(
        &self,
        schedule_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    // ── Leases ──

    /// Write `lease` only if no live lease exists for its key at `now`.
    async fn try_insert_lease(&self, lease: Lease, now: Ms) -> Result<LeaseWrite, StoreError>;

    /// Move `expires_at` forward if the stored lease carries `token` and is live.
    async fn extend_lease(
        &self,
        lock_key: &str,
        token: Ulid,
        expires_at: Ms,
        now: Ms,
    ) -> Result<bool, StoreError>;

    /// Delete the lease if it still carries `token`. Missing or reclaimed is Ok.
    async fn delete_lease(&self, lock_key: &str, token: Ulid) -> Result<(), StoreError>;

    async fn get_lease(&self, lock_key: &str) -> Result<Option<Lease>, StoreError>;

    // ── Idempotency records ──

    /// Write `record` if the key is absent or expired at `now`.
    /// Returns the live record that blocked the write, if any.
    async fn try_insert_idempotency(
        &self,
        record: IdempotencyRecord,
        now: Ms,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Mark a reserved record committed if it still carries `token`.
    async fn commit_idempotency(
        &self,
        key: &str,
        token: Ulid,
        booking_id: Ulid,
        expires_at: Ms,
    ) -> Result<bool, StoreError>;

    /// Delete the record if it still carries `token`.
    async fn delete_idempotency(&self, key: &str, token: Ulid) -> Result<(), StoreError>;
}
