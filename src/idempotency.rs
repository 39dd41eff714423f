//! Replay deduplication for booking creation.
//!
//! A client-supplied key is reserved before admission runs, committed with the
//! booking id on success, and abandoned on any failure so a retry can reuse it
//! at once. Expired records are treated as absent when read; nothing sweeps them.

use std::sync::Arc;

use serde::Serialize;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::store::{DocumentStore, StoreError};

/// Token proving this caller owns an in-flight reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: String,
    pub token: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// The key is ours; run admission, then commit or abandon.
    Reserved(Reservation),
    /// A previous attempt succeeded with this booking.
    Seen(Ulid),
    /// A previous attempt is still running. Retry shortly.
    InFlight,
    /// The key is live but was used for a different request.
    KeyReused,
}

/// CRC32 of a request's encoded form. Two requests with equal fields share it.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<u32, bincode::Error> {
    let bytes = bincode::serialize(request)?;
    Ok(crc32fast::hash(&bytes))
}

pub struct IdempotencyGuard {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    /// How long a committed key answers replays.
    ttl: Ms,
    /// How long an uncommitted reservation blocks the key if its owner vanishes.
    reservation_ttl: Ms,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, ttl: Ms, reservation_ttl: Ms) -> Self {
        Self {
            store,
            clock,
            ttl,
            reservation_ttl,
        }
    }

    pub async fn check_or_reserve(&self, key: &str, fingerprint: u32) -> Result<IdempotencyCheck, StoreError> {
        let now = self.clock.now_ms();
        let record = IdempotencyRecord {
            key: key.to_string(),
            token: Ulid::new(),
            fingerprint,
            state: IdempotencyState::Reserved,
            expires_at: now + self.reservation_ttl,
        };
        let token = record.token;
        let Some(existing) = self.store.try_insert_idempotency(record, now).await? else {
            return Ok(IdempotencyCheck::Reserved(Reservation {
                key: key.to_string(),
                token,
            }));
        };
        if existing.fingerprint != fingerprint {
            return Ok(IdempotencyCheck::KeyReused);
        }
        Ok(match existing.state {
            IdempotencyState::Committed { booking_id } => IdempotencyCheck::Seen(booking_id),
            IdempotencyState::Reserved => IdempotencyCheck::InFlight,
        })
    }

    /// Record the booking a reservation produced. `false` if the reservation had
    /// already lapsed and someone else owns the key now.
    pub async fn commit(&self, reservation: &Reservation, booking_id: Ulid) -> Result<bool, StoreError> {
        let expires_at = self.clock.now_ms() + self.ttl;
        self.store
            .commit_idempotency(&reservation.key, reservation.token, booking_id, expires_at)
            .await
    }

    /// Free the key immediately.
    pub async fn abandon(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.store
            .delete_idempotency(&reservation.key, reservation.token)
            .await
    }
}
