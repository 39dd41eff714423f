use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use bookd::clock::{Clock, SystemClock};
use bookd::reaper;
use bookd::store::LocalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("BOOKD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    bookd::observability::init(metrics_port)?;

    let data_dir = std::env::var("BOOKD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("BOOKD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("bookd.wal");
    let store = Arc::new(LocalStore::open(&wal_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!("bookd started");
    info!("  journal: {} ({} bookings)", wal_path.display(), store.booking_count());
    info!("  compaction threshold: {compact_threshold} appends");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let compactor = tokio::spawn(reaper::run_compactor(
        store.clone(),
        clock.clone(),
        compact_threshold,
        Duration::from_secs(5),
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    compactor.abort();
    if let Err(e) = store.compact(clock.now_ms()).await {
        warn!("final compaction failed: {e}");
    }
    info!("bookd stopped");
    Ok(())
}
