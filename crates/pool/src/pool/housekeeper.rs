//! Periodic housekeeping: validation, aging and forced expiry.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::Pool;
use crate::error::Error;
use crate::events::RemovalReason;
use crate::resource::Resource;
use crate::slot::Slot;
use crate::status::Status;

/// Spawn the housekeeper.
///
/// Cancellation interrupts a pass in progress, including a probe stuck on a
/// hung backend.
pub(super) fn spawn<R: Resource>(pool: &Pool<R>) -> JoinHandle<()> {
    let weak = Arc::downgrade(&pool.inner);
    let cancel = pool.inner.cancel.clone();
    let interval = pool.inner.config.house_keeping_sleep_time;

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = Pool { inner };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    outcome = AssertUnwindSafe(pool.house_keep()).catch_unwind() => {
                        if let Err(panic) = outcome {
                            tracing::error!(panic = panic_message(&*panic), "housekeeping pass panicked");
                        }
                    }
                }
            }
            tracing::debug!("housekeeper stopped");
        }
        .instrument(pool.span()),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl<R: Resource> Pool<R> {
    /// Run one housekeeping pass now.
    ///
    /// Walks the collection back to front. Idle connections are claimed
    /// OFFLINE, checked for closure and probed with the test query; idle ones
    /// past their lifetime (or marked for expiry) are removed and busy ones
    /// are marked. Connections active longer than `maximum_active_time` are
    /// removed outright.
    pub async fn house_keep(&self) {
        let config = &self.inner.config;
        tracing::trace!(alias = %self.alias(), stats = %self.stats(), "housekeeping start");

        let mut recently_started = 0;
        for slot in self.slots_snapshot().iter().rev() {
            if !self.is_running() {
                return;
            }

            if self.transition(slot, Status::Available, Status::Offline)
                && !self.check_idle(slot).await
            {
                continue;
            }

            if slot.age() > config.maximum_connection_lifetime || slot.is_marked_for_expiry() {
                let reason = if slot.is_marked_for_expiry() {
                    RemovalReason::ExpiryRequested
                } else {
                    RemovalReason::Expired { age: slot.age() }
                };
                self.expire(slot, false, reason).await;
            }

            if let Some(active_time) = slot.active_time() {
                if active_time < config.recently_started_threshold {
                    recently_started += 1;
                } else if active_time > config.maximum_active_time {
                    tracing::warn!(
                        alias = %self.alias(),
                        id = slot.id(),
                        requester = slot.requester().unwrap_or_default(),
                        active_ms = active_time.as_millis() as u64,
                        "connection active too long; expiring it"
                    );
                    self.remove(slot, RemovalReason::ActiveTooLong { active_time }, true)
                        .await;
                }
            }
        }

        self.set_recently_started(recently_started);
        self.wake_prototyper();
        self.recompute_health();
        tracing::trace!(alias = %self.alias(), stats = %self.stats(), recently_started, "housekeeping end");
    }

    /// Validate a connection housekeeping holds OFFLINE.
    ///
    /// Returns `true` if it went back to AVAILABLE.
    async fn check_idle(&self, slot: &Arc<Slot<R::Instance>>) -> bool {
        let Some(instance) = slot.take_instance() else {
            // A forced removal got there first.
            return false;
        };

        let resource = &self.inner.resource;
        let failure = if resource.is_closed(&instance) {
            Some(RemovalReason::AppearsClosed)
        } else if let Some(query) = self.inner.config.test_query() {
            resource
                .validate(&instance, query)
                .await
                .err()
                .map(|error| {
                    let reason = error.to_string();
                    let error = Error::validation(self.alias(), slot.id(), reason.clone());
                    tracing::debug!(alias = %self.alias(), error = %error, "test query failed");
                    RemovalReason::ValidationFailed { reason }
                })
        } else {
            None
        };

        if let Some(reason) = failure {
            tracing::info!(alias = %self.alias(), id = slot.id(), reason = %reason, "removing bad connection");
            self.transition(slot, Status::Offline, Status::Null);
            self.detach(slot, reason, true);
            self.close_instance(slot.id(), instance).await;
            return false;
        }

        slot.park(instance);
        if self.transition(slot, Status::Offline, Status::Available) {
            return true;
        }
        // Removed while we were probing it.
        if let Some(instance) = slot.take_instance() {
            self.close_instance(slot.id(), instance).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::status::Status;
    use crate::testing::MockResource;

    fn pool(config: PoolConfig) -> Pool<MockResource> {
        Pool::new(MockResource::new("hk"), config).unwrap()
    }

    fn config() -> PoolConfig {
        PoolConfig {
            alias: "hk".into(),
            maximum_connection_count: 4,
            minimum_connection_count: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn closed_connection_is_removed() {
        let pool = pool(config());
        let slot = pool.create_connection(Status::Available).await.unwrap();
        pool.resource().mark_closed(1);

        pool.house_keep().await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.resource().cleanup_count(), 1);
        assert_eq!(slot.status(), Status::Null);
        assert!(pool.is_consistent());
    }

    #[tokio::test]
    async fn failed_probe_removes_only_when_query_set() {
        let pool = pool(config());
        pool.create_connection(Status::Available).await.unwrap();
        pool.resource().set_fail_validation(true);

        pool.house_keep().await;
        assert_eq!(pool.available_count(), 1, "no test query, no probe");

        let pool = self::pool(PoolConfig {
            house_keeping_test_query: Some("SELECT 1".into()),
            ..config()
        });
        pool.create_connection(Status::Available).await.unwrap();
        pool.resource().set_fail_validation(true);

        pool.house_keep().await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.resource().validation_count(), 1);
    }

    #[tokio::test]
    async fn healthy_connection_goes_back_to_available() {
        let pool = pool(PoolConfig {
            house_keeping_test_query: Some("SELECT 1".into()),
            ..config()
        });
        pool.create_connection(Status::Available).await.unwrap();

        pool.house_keep().await;
        assert_eq!(pool.available_count(), 1);
        assert_eq!(pool.offline_count(), 0);
        assert!(pool.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn aged_active_connection_is_marked_not_removed() {
        let pool = pool(PoolConfig {
            maximum_connection_lifetime: Duration::from_secs(10),
            ..config()
        });
        let conn = pool.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        pool.house_keep().await;
        assert_eq!(pool.active_count(), 1);
        assert!(conn.is_marked_for_expiry());

        conn.release().await;
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recently_started_connections_are_counted() {
        let pool = pool(config());
        let _conn = pool.acquire().await.unwrap();

        pool.house_keep().await;
        assert_eq!(pool.inner.books.lock().recently_started, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        pool.house_keep().await;
        assert_eq!(pool.inner.books.lock().recently_started, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aged_connection_is_removed_even_when_close_fails() {
        let pool = pool(PoolConfig {
            maximum_connection_lifetime: Duration::from_secs(10),
            ..config()
        });
        pool.create_connection(Status::Available).await.unwrap();
        pool.resource().set_fail_cleanup(true);
        tokio::time::advance(Duration::from_secs(11)).await;

        pool.house_keep().await;
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(pool.resource().cleanup_count(), 1);
        assert!(pool.is_consistent());
    }
}
