//! Listener traits for connection lifecycle and pool health.
//!
//! Listeners are called synchronously on the thread that caused the event,
//! outside the pool's counter lock. Keep them quick.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::slot::ConnectionInfo;
use crate::status::UpState;

/// Notified when connections are born and when they die.
pub trait ConnectionListener: Send + Sync {
    /// Called after a connection is created, before it joins the pool.
    ///
    /// Returning an error aborts that creation: the connection is closed and
    /// the caller (or prototyper) sees a creation failure.
    fn on_birth(&self, _connection: &ConnectionInfo) -> Result<()> {
        Ok(())
    }

    /// Called when a connection is removed. Errors are logged and ignored.
    fn on_death(&self, _connection: &ConnectionInfo) -> Result<()> {
        Ok(())
    }
}

/// Notified when the pool's derived health changes.
pub trait StateListener: Send + Sync {
    /// Called only on an actual transition.
    fn up_state_changed(&self, from: UpState, to: UpState);
}

/// Registered listeners of one kind.
pub(crate) struct Listeners<L: ?Sized> {
    inner: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) {
        self.inner.write().push(listener);
    }

    /// Snapshot the listeners so they can be called without holding the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl<L: ?Sized> std::fmt::Debug for Listeners<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}
