//! Keeps spare connections ready ahead of demand.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::Instrument;

use super::Pool;
use crate::error::Error;
use crate::resource::Resource;
use crate::status::Status;

/// Spawn the prototyper.
///
/// It fills the pool once, then sleeps until woken. Wakes coalesce: any
/// number of wakes while a pass runs produce at most one more pass.
/// Cancellation drops a creation in progress; its reserved count is
/// released.
pub(super) fn spawn<R: Resource>(pool: &Pool<R>) -> JoinHandle<()> {
    let weak = Arc::downgrade(&pool.inner);
    let cancel = pool.inner.cancel.clone();
    let wake = Arc::clone(&pool.inner.wake_prototyper);
    wake.notify_one();

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = wake.notified() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = Pool { inner };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = pool.prototype() => {}
                }
            }
            tracing::debug!("prototyper stopped");
        }
        .instrument(pool.span()),
    )
}

impl<R: Resource> Pool<R> {
    /// Create AVAILABLE connections until the minimum and the spare target
    /// are met, or the maximum is reached.
    ///
    /// Stops quietly at capacity. Any other creation failure is logged and
    /// ends the pass; the next wake tries again. Returns how many
    /// connections were created.
    pub async fn prototype(&self) -> usize {
        let config = &self.inner.config;
        let mut created = 0;
        while self.is_running() && self.needs_connection() {
            match self.create_connection(Status::Available).await {
                Ok(_) => created += 1,
                Err(Error::Exhausted { .. } | Error::ShutDown { .. }) => break,
                Err(error) => {
                    tracing::warn!(
                        alias = %self.alias(),
                        error = %error,
                        minimum = config.minimum_connection_count,
                        "prototyper could not create a connection"
                    );
                    break;
                }
            }
        }
        if created > 0 {
            tracing::debug!(alias = %self.alias(), created, stats = %self.stats(), "prototyped connections");
        }
        created
    }

    fn needs_connection(&self) -> bool {
        let config = &self.inner.config;
        let books = self.inner.books.lock();
        (books.connection_count < config.minimum_connection_count
            || books.count(Status::Available) < config.prototype_count)
            && books.connection_count < config.maximum_connection_count
    }
}

#[cfg(test)]
mod tests {
    use crate::config::PoolConfig;
    use crate::pool::Pool;
    use crate::testing::MockResource;

    fn config(min: usize, spare: usize, max: usize) -> PoolConfig {
        PoolConfig {
            alias: "proto".into(),
            minimum_connection_count: min,
            prototype_count: spare,
            maximum_connection_count: max,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fills_to_minimum() {
        let pool = Pool::new(MockResource::new("proto"), config(3, 0, 5)).unwrap();
        assert_eq!(pool.prototype().await, 3);
        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.prototype().await, 0);
    }

    #[tokio::test]
    async fn keeps_spares_beside_active_connections() {
        let pool = Pool::new(MockResource::new("proto"), config(0, 2, 5)).unwrap();
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        assert_eq!(pool.prototype().await, 2);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.available_count(), 2);
    }

    #[tokio::test]
    async fn never_exceeds_maximum() {
        let pool = Pool::new(MockResource::new("proto"), config(2, 4, 3)).unwrap();
        assert_eq!(pool.prototype().await, 3);
        assert_eq!(pool.connection_count(), 3);
    }

    #[tokio::test]
    async fn backs_off_after_creation_failure() {
        let pool = Pool::new(MockResource::new("proto"), config(3, 0, 5)).unwrap();
        pool.resource().set_fail_create(true);
        assert_eq!(pool.prototype().await, 0);
        assert_eq!(pool.resource().create_attempts(), 1);
        assert_eq!(pool.connection_count(), 0);
    }
}
