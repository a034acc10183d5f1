//! RAII handle for checked-out connections

use std::sync::Arc;

use crate::pool::Pool;
use crate::resource::Resource;
use crate::slot::Slot;

/// A connection checked out of a [`Pool`].
///
/// Dereferences to the resource instance. Dropping the handle releases the
/// connection; use [`release`](Self::release) or [`discard`](Self::discard)
/// to return it explicitly and await any close that follows.
///
/// If the pool expired the connection while it was in use, returning the
/// handle only closes the instance.
pub struct PooledConnection<R: Resource> {
    pool: Pool<R>,
    slot: Arc<Slot<R::Instance>>,
    instance: Option<R::Instance>,
}

impl<R: Resource> PooledConnection<R> {
    pub(crate) fn new(pool: Pool<R>, slot: Arc<Slot<R::Instance>>, instance: R::Instance) -> Self {
        Self {
            pool,
            slot,
            instance: Some(instance),
        }
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    /// The requester label recorded at acquire.
    #[must_use]
    pub fn requester(&self) -> Option<String> {
        self.slot.requester()
    }

    /// Whether expiry has been requested for this connection.
    #[must_use]
    pub fn is_marked_for_expiry(&self) -> bool {
        self.slot.is_marked_for_expiry()
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        self.give_back(false).await;
    }

    /// Return the connection as broken. It is removed and closed.
    pub async fn discard(mut self) {
        self.give_back(true).await;
    }

    async fn give_back(&mut self, discard: bool) {
        if let Some(instance) = self.instance.take()
            && let Some(instance) = self.pool.settle(&self.slot, instance, discard)
        {
            self.pool.close_instance(self.slot.id(), instance).await;
        }
    }
}

impl<R: Resource> std::ops::Deref for PooledConnection<R> {
    type Target = R::Instance;

    fn deref(&self) -> &R::Instance {
        self.instance.as_ref().expect("connection used after release")
    }
}

impl<R: Resource> std::ops::DerefMut for PooledConnection<R> {
    fn deref_mut(&mut self) -> &mut R::Instance {
        self.instance.as_mut().expect("connection used after release")
    }
}

impl<R: Resource> Drop for PooledConnection<R> {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        let Some(instance) = self.pool.settle(&self.slot, instance, false) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                let id = self.slot.id();
                runtime.spawn(async move { pool.close_instance(id, instance).await });
            }
            Err(_) => {
                tracing::debug!(alias = %self.pool.alias(), id = self.slot.id(), "no runtime to close connection; dropping it");
                drop(instance);
            }
        }
    }
}

impl<R: Resource> std::fmt::Debug for PooledConnection<R>
where
    R::Instance: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("alias", &self.pool.alias())
            .field("id", &self.slot.id())
            .field("instance", &self.instance)
            .finish()
    }
}
