use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::LocalStore;

/// Background task that rewrites the journal once enough appends pile up.
/// Compaction also drops expired leases and idempotency records for good.
pub async fn run_compactor(store: Arc<LocalStore>, clock: Arc<dyn Clock>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_due(&store, clock.as_ref(), threshold).await;
    }
}

/// One compactor pass. Returns whether the journal was rewritten.
pub async fn compact_if_due(store: &LocalStore, clock: &dyn Clock, threshold: u64) -> bool {
    if !store.is_journaled() {
        return false;
    }
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends, threshold {threshold}");
        return false;
    }
    match store.compact(clock.now_ms()).await {
        Ok(()) => {
            info!("compacted journal after {appends} appends");
            true
        }
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;
    use crate::store::DocumentStore;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let path = test_wal_path("compactor_threshold.wal");
        let store = LocalStore::open(&path).unwrap();
        let clock = ManualClock::new(1_700_000_000_000);

        let schedule = Schedule::new(Ulid::new(), Ulid::new(), 1);
        for _ in 0..5 {
            store.put_schedule(schedule.clone()).await.unwrap();
        }
        assert!(!compact_if_due(&store, &clock, 10).await);
        assert_eq!(store.appends_since_compact().await, 5);

        for _ in 0..5 {
            store.put_schedule(schedule.clone()).await.unwrap();
        }
        assert!(compact_if_due(&store, &clock, 10).await);
        assert_eq!(store.appends_since_compact().await, 0);

        // Ten puts of one schedule collapse to a single record
        drop(store);
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.get_schedule(schedule.id).await.unwrap(), Some(schedule));
    }

    #[tokio::test]
    async fn in_memory_store_is_never_due() {
        let store = LocalStore::in_memory();
        let clock = ManualClock::new(0);
        assert!(!compact_if_due(&store, &clock, 0).await);
    }
}
