use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use ulid::Ulid;

use bookd::admission::{AdmissionError, BookingCoordinator, BookingDraft};
use bookd::config::{AdmissionConfig, LockGranularity};
use bookd::model::{DAY_MS, Schedule, Span};
use bookd::store::{DocumentStore, LocalStore};

const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 20_000 * DAY_MS;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn bench_config(granularity: LockGranularity) -> AdmissionConfig {
    AdmissionConfig {
        acquire_max_attempts: 1000,
        acquire_backoff: Duration::from_millis(1),
        acquire_backoff_max: Duration::from_millis(5),
        lock_granularity: granularity,
        holder: "stress".into(),
        ..AdmissionConfig::default()
    }
}

async fn new_schedule(store: &LocalStore, business: Ulid, capacity: u32) -> Ulid {
    let id = Ulid::new();
    store
        .put_schedule(Schedule::new(id, business, capacity))
        .await
        .unwrap();
    id
}

fn journaled_store(name: &str) -> Arc<LocalStore> {
    let dir = std::env::temp_dir().join("bookd_stress");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}_{}.wal", Ulid::new()));
    Arc::new(LocalStore::open(&path).unwrap())
}

async fn phase1_sequential() {
    let store = journaled_store("sequential");
    let business = Ulid::new();
    let schedule = new_schedule(&store, business, 1).await;
    let coordinator = BookingCoordinator::new(store.clone(), bench_config(LockGranularity::Schedule));

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let s = BASE + (i as i64) * HOUR;
        let draft = BookingDraft::new(business, schedule, Span::new(s, s + HOUR), 1);
        let t = Instant::now();
        coordinator.create(draft).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} admissions in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("admission latency", &mut latencies);
}

async fn phase2_disjoint_schedules() {
    let store = journaled_store("disjoint");
    let business = Ulid::new();
    let coordinator = Arc::new(BookingCoordinator::new(store.clone(), bench_config(LockGranularity::Schedule)));
    let n_tasks = 10;
    let n_per_task = 200;

    let mut schedules = Vec::new();
    for _ in 0..n_tasks {
        schedules.push(new_schedule(&store, business, 1).await);
    }

    let start = Instant::now();
    let handles = schedules.into_iter().map(|schedule| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            for j in 0..n_per_task {
                let s = BASE + (j as i64) * HOUR;
                let draft = BookingDraft::new(business, schedule, Span::new(s, s + HOUR), 1);
                coordinator.create(draft).await.unwrap();
            }
        })
    });
    for h in join_all(handles).await {
        h.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} schedules x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many requests for the same slot. Exactly `capacity` may win.
async fn phase3_hot_slot(granularity: LockGranularity) {
    let store = Arc::new(LocalStore::in_memory());
    let business = Ulid::new();
    let capacity = 5;
    let schedule = new_schedule(&store, business, capacity).await;
    let coordinator = Arc::new(BookingCoordinator::new(store.clone(), bench_config(granularity)));

    let n = 500;
    let start = Instant::now();
    let handles = (0..n).map(|_| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let draft = BookingDraft::new(business, schedule, Span::new(BASE, BASE + HOUR), 1);
            let t = Instant::now();
            let result = coordinator.create(draft).await;
            (result, t.elapsed())
        })
    });

    let mut latencies = Vec::with_capacity(n);
    let (mut admitted, mut full, mut contended) = (0u32, 0u32, 0u32);
    for h in join_all(handles).await {
        let (result, latency) = h.unwrap();
        latencies.push(latency);
        match result {
            Ok(_) => admitted += 1,
            Err(AdmissionError::CapacityExceeded { .. }) => full += 1,
            Err(AdmissionError::Contended) => contended += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    println!(
        "  {n} requests in {:.2}s: {admitted} admitted, {full} full, {contended} contended",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(admitted, capacity, "slot oversubscribed or underfilled");
    print_latency("contended admission", &mut latencies);
}

async fn phase4_retry_storm() {
    let store = Arc::new(LocalStore::in_memory());
    let business = Ulid::new();
    let schedule = new_schedule(&store, business, 1).await;
    let coordinator = Arc::new(BookingCoordinator::new(store.clone(), bench_config(LockGranularity::Schedule)));

    let n_clients = 50;
    let retries = 10;
    let start = Instant::now();
    let handles = (0..n_clients).map(|c| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let s = BASE + (c as i64) * HOUR;
            let draft = BookingDraft::new(business, schedule, Span::new(s, s + HOUR), 1)
                .with_idempotency_key(format!("client-{c}"));
            let mut ids = Vec::new();
            for _ in 0..retries {
                match coordinator.create(draft.clone()).await {
                    Ok(a) => ids.push(a.booking().id),
                    Err(AdmissionError::InFlight) => tokio::task::yield_now().await,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            ids.dedup();
            ids.len()
        })
    });
    let distinct: Vec<usize> = join_all(handles).await.into_iter().map(|h| h.unwrap()).collect();

    println!(
        "  {n_clients} clients x {retries} retries in {:.2}s, {} bookings stored",
        start.elapsed().as_secs_f64(),
        store.booking_count()
    );
    assert!(distinct.iter().all(|&d| d == 1), "a retry created a second booking");
    assert_eq!(store.booking_count(), n_clients);
}

#[tokio::main]
async fn main() {
    println!("=== bookd stress benchmark ===\n");

    println!("[phase 1] sequential admission throughput (journaled)");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent admissions on disjoint schedules (journaled)");
    phase2_disjoint_schedules().await;

    println!("\n[phase 3] hot slot, schedule leases");
    phase3_hot_slot(LockGranularity::Schedule).await;

    println!("\n[phase 3b] hot slot, day leases");
    phase3_hot_slot(LockGranularity::Day).await;

    println!("\n[phase 4] idempotent retry storm");
    phase4_retry_storm().await;

    println!("\n=== benchmark complete ===");
}
