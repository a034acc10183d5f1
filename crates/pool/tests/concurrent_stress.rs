//! Many tasks hammering a small pool from several worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use nebula_pool::{Error, Pool, PoolConfig, Resource, Result};

/// Instance that panics the test if two callers ever hold it at once.
struct Exclusive {
    in_use: AtomicBool,
}

#[derive(Default)]
struct ExclusiveResource {
    created: AtomicU64,
}

impl Resource for ExclusiveResource {
    type Instance = Arc<Exclusive>;

    fn id(&self) -> &str {
        "exclusive"
    }

    async fn create(&self) -> Result<Arc<Exclusive>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(Arc::new(Exclusive {
            in_use: AtomicBool::new(false),
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connections_are_never_double_claimed() {
    let pool = Pool::new(
        ExclusiveResource::default(),
        PoolConfig {
            alias: "stress".into(),
            maximum_connection_count: 6,
            minimum_connection_count: 2,
            prototype_count: 1,
            house_keeping_sleep_time: Duration::from_millis(5),
            ..Default::default()
        },
    )
    .unwrap();
    pool.start();

    let workers: Vec<_> = (0..16)
        .map(|worker| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut served = 0u64;
                for round in 0..200 {
                    match pool.acquire_for(&format!("worker-{worker}")).await {
                        Ok(conn) => {
                            assert!(
                                !conn.in_use.swap(true, Ordering::SeqCst),
                                "connection #{} handed out twice",
                                conn.id()
                            );
                            tokio::task::yield_now().await;
                            conn.in_use.store(false, Ordering::SeqCst);
                            if round % 50 == 0 {
                                conn.discard().await;
                            } else {
                                conn.release().await;
                            }
                            served += 1;
                        }
                        Err(error) => assert!(error.is_capacity(), "{error:?}"),
                    }
                }
                served
            })
        })
        .collect();

    let mut served = 0;
    for worker in workers {
        served += worker.await.unwrap();
    }

    assert_eq!(pool.served_count(), served);
    assert_eq!(pool.served_count() + pool.refused_count(), 16 * 200);
    assert!(pool.connection_count() <= 6);
    assert_eq!(pool.active_count(), 0);
    assert!(pool.is_consistent());

    pool.shutdown(Duration::ZERO).await;
    assert_eq!(pool.connection_count(), 0);
    assert!(pool.is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expiry_racing_with_callers_keeps_counters_consistent() {
    let pool = Pool::new(
        ExclusiveResource::default(),
        PoolConfig {
            alias: "expiry-race".into(),
            maximum_connection_count: 4,
            minimum_connection_count: 0,
            ..Default::default()
        },
    )
    .unwrap();

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    if let Ok(conn) = pool.acquire().await {
                        tokio::task::yield_now().await;
                        conn.release().await;
                    }
                }
            })
        })
        .collect();

    let expirer = tokio::spawn({
        let pool = pool.clone();
        async move {
            for round in 0..50 {
                pool.expire_all(round % 2 == 0).await;
                tokio::task::yield_now().await;
            }
        }
    });

    for caller in callers {
        caller.await.unwrap();
    }
    expirer.await.unwrap();

    assert_eq!(pool.active_count(), 0);
    assert!(pool.is_consistent());
    assert!(matches!(
        pool.acquire().await.map(|conn| conn.id()),
        Ok(_) | Err(Error::Exhausted { .. })
    ));
}
