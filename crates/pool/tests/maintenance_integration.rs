//! Housekeeping: aging, forced expiry of long-active connections, and a loop
//! that survives failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use nebula_pool::{Pool, PoolConfig, PoolEvent, RemovalReason, Resource, Result};

// ---------------------------------------------------------------------------
// Test resource
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProbedResource {
    serial: AtomicU64,
    validations: AtomicU64,
    cleanups: AtomicU64,
    panic_next_probe: AtomicBool,
}

impl Resource for ProbedResource {
    type Instance = u64;

    fn id(&self) -> &str {
        "probed"
    }

    async fn create(&self) -> Result<u64> {
        Ok(self.serial.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn validate(&self, _instance: &u64, _query: &str) -> Result<()> {
        assert!(
            !self.panic_next_probe.swap(false, Ordering::SeqCst),
            "probe blew up"
        );
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self, _instance: u64) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> PoolConfig {
    PoolConfig {
        alias: "maintenance".into(),
        maximum_connection_count: 4,
        minimum_connection_count: 0,
        maximum_connection_lifetime: Duration::from_secs(60),
        maximum_active_time: Duration::from_secs(30),
        house_keeping_sleep_time: Duration::from_secs(5),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn aged_idle_connection_is_removed_and_its_id_never_returns() {
    let pool = Pool::new(ProbedResource::default(), config()).unwrap();
    let mut events = pool.subscribe();

    let conn = pool.acquire().await.unwrap();
    let aged_id = conn.id();
    conn.release().await;

    tokio::time::advance(Duration::from_secs(61)).await;
    pool.house_keep().await;

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.resource().cleanups.load(Ordering::SeqCst), 1);

    let removed = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
        PoolEvent::Removed { id, reason, .. } => Some((id, reason)),
        _ => None,
    });
    assert!(matches!(
        removed,
        Some((id, RemovalReason::Expired { .. })) if id == aged_id
    ));

    for _ in 0..3 {
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), aged_id);
        conn.release().await;
    }
}

#[tokio::test(start_paused = true)]
async fn long_active_connection_is_force_expired_and_release_is_a_no_op() {
    let pool = Pool::new(ProbedResource::default(), config()).unwrap();
    let conn = pool.acquire().await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    pool.house_keep().await;

    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.active_count(), 0);
    assert!(pool.connection_infos().is_empty());

    conn.release().await;
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.available_count(), 0);
    assert_eq!(pool.resource().cleanups.load(Ordering::SeqCst), 1);
    assert!(pool.is_consistent());
}

#[tokio::test(start_paused = true)]
async fn busy_connections_are_skipped_by_validation() {
    let pool = Pool::new(
        ProbedResource::default(),
        PoolConfig {
            house_keeping_test_query: Some("SELECT 1".into()),
            ..config()
        },
    )
    .unwrap();
    let busy = pool.acquire().await.unwrap();
    let idle = pool.acquire().await.unwrap();
    idle.release().await;

    pool.house_keep().await;
    assert_eq!(pool.resource().validations.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.available_count(), 1);
    drop(busy);
}

#[tokio::test(start_paused = true)]
async fn housekeeper_keeps_running_after_a_panicking_pass() {
    init_tracing();
    let pool = Pool::new(
        ProbedResource::default(),
        PoolConfig {
            house_keeping_test_query: Some("SELECT 1".into()),
            minimum_connection_count: 2,
            ..config()
        },
    )
    .unwrap();
    assert_eq!(pool.prototype().await, 2);
    pool.resource().panic_next_probe.store(true, Ordering::SeqCst);

    pool.start();
    tokio::time::sleep(Duration::from_secs(16)).await;

    // The first pass panicked on its first probe; later passes still ran.
    assert!(pool.resource().validations.load(Ordering::SeqCst) >= 2);
    assert!(pool.is_running());
    pool.shutdown(Duration::ZERO).await;
}

#[tokio::test(start_paused = true)]
async fn background_housekeeping_expires_aged_connections() {
    let pool = Pool::new(ProbedResource::default(), config()).unwrap();
    let conn = pool.acquire().await.unwrap();
    conn.release().await;
    pool.start();

    tokio::time::sleep(Duration::from_secs(66)).await;
    assert_eq!(pool.connection_count(), 0);
    assert_eq!(pool.resource().cleanups.load(Ordering::SeqCst), 1);
    pool.shutdown(Duration::ZERO).await;
}
