//! Advisory leases: the only mutual-exclusion primitive the admission core has.
//!
//! A lease is one document per lock key with an expiry. Acquisition is a
//! single conditional write (insert if absent or expired), so exclusion holds
//! across any number of processes sharing the store. A holder that dies
//! without releasing is recovered once `expires_at` passes.

use std::sync::Arc;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::LockGranularity;
use crate::model::*;
use crate::store::{DocumentStore, LeaseWrite, StoreError};

#[derive(Debug)]
pub enum LeaseError {
    /// A live lease is held by someone else.
    Busy(String),
    /// Our lease expired or was reclaimed; the handle is stale.
    Lost(String),
    Store(StoreError),
}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseError::Busy(key) => write!(f, "lease busy: {key}"),
            LeaseError::Lost(key) => write!(f, "lease lost: {key}"),
            LeaseError::Store(e) => write!(f, "lease store error: {e}"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<StoreError> for LeaseError {
    fn from(e: StoreError) -> Self {
        LeaseError::Store(e)
    }
}

/// Proof of one acquisition. Renew/release present its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    pub lock_key: String,
    pub token: Ulid,
    pub expires_at: Ms,
    pub acquired_at: Ms,
}

/// Lock keys covering `window` on a schedule, sorted so every caller takes them
/// in the same order. `window` should already include any buffer padding.
pub fn lock_keys(schedule_id: Ulid, window: &Span, granularity: LockGranularity) -> Vec<String> {
    let mut keys: Vec<String> = match granularity {
        LockGranularity::Schedule => vec![format!("booking:{schedule_id}")],
        LockGranularity::Day => window
            .days()
            .map(|day| format!("booking:{schedule_id}:{day}"))
            .collect(),
    };
    keys.sort();
    keys
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    holder: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, holder: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            holder: holder.into(),
        }
    }

    /// One conditional write. `Busy` if a live lease exists; store errors propagate
    /// so the caller can fail closed.
    pub async fn acquire(&self, lock_key: &str, lease_duration: Ms) -> Result<LeaseHandle, LeaseError> {
        let now = self.clock.now_ms();
        let lease = Lease {
            lock_key: lock_key.to_string(),
            token: Ulid::new(),
            holder: self.holder.clone(),
            expires_at: now + lease_duration,
            created_at: now,
        };
        let handle = LeaseHandle {
            lock_key: lease.lock_key.clone(),
            token: lease.token,
            expires_at: lease.expires_at,
            acquired_at: now,
        };
        metrics::counter!(crate::observability::LEASE_ACQUIRE_ATTEMPTS_TOTAL).increment(1);
        match self.store.try_insert_lease(lease, now).await? {
            LeaseWrite::Created => Ok(handle),
            LeaseWrite::Reclaimed => {
                info!("reclaimed expired lease {lock_key}");
                metrics::counter!(crate::observability::LEASE_RECLAIMED_TOTAL).increment(1);
                Ok(handle)
            }
            LeaseWrite::Held => {
                metrics::counter!(crate::observability::LEASE_BUSY_TOTAL).increment(1);
                Err(LeaseError::Busy(lock_key.to_string()))
            }
        }
    }

    /// Push expiry to `now + extra`. `Lost` if the lease expired or changed hands.
    pub async fn renew(&self, handle: &mut LeaseHandle, extra: Ms) -> Result<(), LeaseError> {
        let now = self.clock.now_ms();
        let expires_at = now + extra;
        if self
            .store
            .extend_lease(&handle.lock_key, handle.token, expires_at, now)
            .await?
        {
            handle.expires_at = expires_at;
            Ok(())
        } else {
            Err(LeaseError::Lost(handle.lock_key.clone()))
        }
    }

    /// Delete the lease if still ours. Releasing twice, or after a reclaim, is fine.
    pub async fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
        self.store.delete_lease(&handle.lock_key, handle.token).await?;
        Ok(())
    }

    /// Acquire every key in order. On the first `Busy`, give back what was taken
    /// so nobody holds part of a set while waiting for the rest.
    pub async fn acquire_all(&self, keys: &[String], lease_duration: Ms) -> Result<LeaseSet, LeaseError> {
        let mut set = LeaseSet {
            manager: self.clone(),
            handles: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            match self.acquire(key, lease_duration).await {
                Ok(handle) => set.handles.push(handle),
                Err(e) => {
                    set.release().await;
                    return Err(e);
                }
            }
        }
        Ok(set)
    }
}

/// Leases held together for one admission. Released explicitly with
/// [`LeaseSet::release`]; if dropped while still holding (the owning future was
/// cancelled), a best-effort release is spawned.
pub struct LeaseSet {
    manager: LockManager,
    handles: Vec<LeaseHandle>,
}

impl LeaseSet {
    pub fn handles(&self) -> &[LeaseHandle] {
        &self.handles
    }

    /// Earliest acquisition time across the set.
    pub fn acquired_at(&self) -> Option<Ms> {
        self.handles.iter().map(|h| h.acquired_at).min()
    }

    /// Renew every lease; stops at the first one that was lost.
    pub async fn renew(&mut self, extra: Ms) -> Result<(), LeaseError> {
        for handle in &mut self.handles {
            self.manager.renew(handle, extra).await?;
        }
        Ok(())
    }

    /// Release everything. Store failures are logged; the TTL covers them.
    pub async fn release(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = self.manager.release(&handle).await {
                warn!("release of {} failed, left to expire: {e}", handle.lock_key);
            } else {
                debug!("released lease {}", handle.lock_key);
            }
        }
    }
}

impl Drop for LeaseSet {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.handles);
        let manager = self.manager.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    for handle in handles {
                        if let Err(e) = manager.release(&handle).await {
                            warn!("deferred release of {} failed: {e}", handle.lock_key);
                        }
                    }
                });
            }
            Err(_) => warn!("{} leases dropped outside a runtime, left to expire", handles.len()),
        }
    }
}
