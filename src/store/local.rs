use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::documents::Documents;
use super::{DocumentStore, LeaseWrite, StoreError};

// ── Group-commit journal channel ─────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal and batches appends: block for the first append, drain
/// whatever else is already queued, fsync once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: a failed batch is cut back out of the file, so no caller
/// sees an error for an event that replay would later resurrect.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!("journal append of {} events failed: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            warn!("journal rollback failed: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Per-document mutex held across check → journal → apply.
struct DocGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody is waiting, drop the entry.
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// What a conditional write decided: the event to persist, if any, and the
/// caller's answer.
type Decision<T> = Result<(Option<Event>, T), StoreError>;

struct Shared {
    docs: Documents,
    doc_locks: DashMap<String, Arc<Mutex<()>>>,
    journal: Option<mpsc::Sender<WalCommand>>,
    /// Writers hold it shared; compaction holds it exclusively so the snapshot
    /// never misses an event that was journaled but not yet applied.
    compaction_gate: RwLock<()>,
}

impl Shared {
    async fn lock_doc(&self, key: String) -> DocGuard<'_> {
        let mutex = self.doc_locks.entry(key.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        DocGuard {
            locks: &self.doc_locks,
            key,
            guard: Some(guard),
        }
    }

    /// Journal (if any) then apply. Caller holds the document's lock.
    async fn commit(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.read().await;
        if let Some(journal) = &self.journal {
            let (tx, rx) = oneshot::channel();
            journal
                .send(WalCommand::Append {
                    event: event.clone(),
                    response: tx,
                })
                .await
                .map_err(|_| StoreError::Unavailable("journal writer shut down".into()))?;
            rx.await
                .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        self.docs.apply_event(&event);
        Ok(())
    }
}

/// Document store living in this process, optionally journaled to a WAL.
///
/// Conditional writes take a per-document mutex, check the condition against
/// the in-memory documents, append to the journal, then apply. Writes to
/// different documents proceed concurrently and share group commits.
///
/// Each write runs to completion on its own task. A caller that is dropped
/// mid-write (a request deadline) never leaves an event journaled but not
/// applied.
pub struct LocalStore {
    shared: Arc<Shared>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self::with_journal(Documents::new(), None)
    }

    fn with_journal(docs: Documents, journal: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                docs,
                doc_locks: DashMap::new(),
                journal,
                compaction_gate: RwLock::new(()),
            }),
        }
    }

    /// Replay the journal at `path` and keep appending to it. A torn tail left
    /// by a crash is cut off first.
    /// Must be called inside a tokio runtime: the journal writer is a spawned task.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx));

        let docs = Documents::new();
        for event in &events {
            docs.apply_event(event);
        }
        info!(
            "opened journal {} ({} events, {} bookings)",
            path.display(),
            events.len(),
            docs.bookings.len()
        );

        Ok(Self::with_journal(docs, Some(tx)))
    }

    pub fn is_journaled(&self) -> bool {
        self.shared.journal.is_some()
    }

    pub fn booking_count(&self) -> usize {
        self.shared.docs.bookings.len()
    }

    fn docs(&self) -> &Documents {
        &self.shared.docs
    }

    /// Lock `doc_key`, decide against current state, then commit the event.
    async fn write<T, F>(&self, doc_key: String, decide: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Documents) -> Decision<T> + Send + 'static,
    {
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let _doc = shared.lock_doc(doc_key).await;
            let (event, answer) = decide(&shared.docs)?;
            if let Some(event) = event {
                shared.commit(event).await?;
            }
            Ok::<T, StoreError>(answer)
        });
        task.await
            .map_err(|e| StoreError::Unavailable(format!("store write aborted: {e}")))?
    }

    /// Rewrite the journal as a snapshot of live documents at `now`.
    /// Expired leases and idempotency records are dropped. No-op in memory.
    pub async fn compact(&self, now: Ms) -> Result<(), StoreError> {
        let Some(journal) = &self.shared.journal else {
            return Ok(());
        };
        let _gate = self.shared.compaction_gate.write().await;
        let events = self.docs().snapshot(now);
        let (tx, rx) = oneshot::channel();
        journal
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("journal writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(journal) = &self.shared.journal else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if journal
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn get_schedule(&self, id: Ulid) -> Result<Option<Schedule>, StoreError> {
        Ok(self.docs().schedules.get(&id).map(|s| s.value().clone()))
    }

    async fn put_schedule(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.write(format!("schedule:{}", schedule.id), move |_| {
            Ok((Some(Event::SchedulePut { schedule }), ()))
        })
        .await
    }

    async fn get_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.docs().bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError> {
        self.write(format!("booking:{}", booking.id), move |docs| {
            if docs.bookings.contains_key(&booking.id) {
                return Err(StoreError::AlreadyExists(booking.id));
            }
            Ok((Some(Event::BookingInserted { booking }), ()))
        })
        .await
    }

    async fn replace_booking(
        &self,
        mut booking: Booking,
        expected_version: u64,
    ) -> Result<Booking, StoreError> {
        self.write(format!("booking:{}", booking.id), move |docs| {
            let actual = docs
                .bookings
                .get(&booking.id)
                .map(|b| b.version)
                .ok_or(StoreError::NotFound(booking.id))?;
            if actual != expected_version {
                return Err(StoreError::VersionMismatch {
                    expected: expected_version,
                    actual,
                });
            }
            booking.version = expected_version + 1;
            let event = Event::BookingReplaced {
                booking: booking.clone(),
            };
            Ok((Some(event), booking))
        })
        .await
    }

    async fn bookings_overlapping(
        &self,
        schedule_id: Ulid,
        window: Span,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.docs().overlapping(schedule_id, &window))
    }

    async fn try_insert_lease(&self, lease: Lease, now: Ms) -> Result<LeaseWrite, StoreError> {
        self.write(format!("lease:{}", lease.lock_key), move |docs| {
            let outcome = match docs.leases.get(&lease.lock_key).map(|l| l.is_live(now)) {
                Some(true) => return Ok((None, LeaseWrite::Held)),
                Some(false) => LeaseWrite::Reclaimed,
                None => LeaseWrite::Created,
            };
            Ok((Some(Event::LeaseWritten { lease }), outcome))
        })
        .await
    }

    async fn extend_lease(
        &self,
        lock_key: &str,
        token: Ulid,
        expires_at: Ms,
        now: Ms,
    ) -> Result<bool, StoreError> {
        let lock_key = lock_key.to_string();
        self.write(format!("lease:{lock_key}"), move |docs| {
            let held = docs
                .leases
                .get(&lock_key)
                .is_some_and(|l| l.token == token && l.is_live(now));
            if !held {
                return Ok((None, false));
            }
            let event = Event::LeaseExtended {
                lock_key,
                token,
                expires_at,
            };
            Ok((Some(event), true))
        })
        .await
    }

    async fn delete_lease(&self, lock_key: &str, token: Ulid) -> Result<(), StoreError> {
        let lock_key = lock_key.to_string();
        self.write(format!("lease:{lock_key}"), move |docs| {
            let ours = docs.leases.get(&lock_key).is_some_and(|l| l.token == token);
            let event = ours.then(|| Event::LeaseDeleted { lock_key, token });
            Ok((event, ()))
        })
        .await
    }

    async fn get_lease(&self, lock_key: &str) -> Result<Option<Lease>, StoreError> {
        Ok(self.docs().leases.get(lock_key).map(|l| l.value().clone()))
    }

    async fn try_insert_idempotency(
        &self,
        record: IdempotencyRecord,
        now: Ms,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.write(format!("idempotency:{}", record.key), move |docs| {
            let existing = docs
                .idempotency
                .get(&record.key)
                .map(|r| r.value().clone())
                .filter(|r| r.is_live(now));
            if existing.is_some() {
                return Ok((None, existing));
            }
            Ok((Some(Event::IdempotencyWritten { record }), None))
        })
        .await
    }

    async fn commit_idempotency(
        &self,
        key: &str,
        token: Ulid,
        booking_id: Ulid,
        expires_at: Ms,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.write(format!("idempotency:{key}"), move |docs| {
            let ours = docs.idempotency.get(&key).is_some_and(|r| r.token == token);
            if !ours {
                return Ok((None, false));
            }
            let event = Event::IdempotencyCommitted {
                key,
                token,
                booking_id,
                expires_at,
            };
            Ok((Some(event), true))
        })
        .await
    }

    async fn delete_idempotency(&self, key: &str, token: Ulid) -> Result<(), StoreError> {
        let key = key.to_string();
        self.write(format!("idempotency:{key}"), move |docs| {
            let ours = docs.idempotency.get(&key).is_some_and(|r| r.token == token);
            let event = ours.then(|| Event::IdempotencyDeleted { key, token });
            Ok((event, ()))
        })
        .await
    }
}
