//! Process-wide registry of pools by alias.
//!
//! A [`Registry`] is an explicit object: create one, share it as an
//! `Arc<Registry>`, and hand it to [`Pool::registered`](crate::Pool::registered).
//! Pools are held weakly, so a dropped pool never keeps its entry alive and
//! its alias can be reused.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{Error, Result};
use crate::pool::PoolStats;
use crate::status::UpState;

/// Read-only view of a pool, independent of its resource type.
pub trait PoolMonitor: Send + Sync {
    /// The pool alias.
    fn alias(&self) -> &str;

    /// Counter snapshot.
    fn stats(&self) -> PoolStats;

    /// Current derived health.
    fn up_state(&self) -> UpState;
}

/// Maps aliases to live pools.
#[derive(Default)]
pub struct Registry {
    pools: DashMap<String, Weak<dyn PoolMonitor>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry ready to share.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a pool. A dead entry under the same alias is replaced.
    pub fn register(&self, alias: &str, pool: Weak<dyn PoolMonitor>) -> Result<()> {
        match self.pools.entry(alias.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().strong_count() > 0 {
                    return Err(Error::configuration(format!(
                        "a pool with alias '{alias}' is already registered"
                    )));
                }
                entry.insert(pool);
            }
            Entry::Vacant(entry) => {
                entry.insert(pool);
            }
        }
        tracing::debug!(alias, "pool registered");
        Ok(())
    }

    /// Remove an alias. Returns `true` if it was present.
    pub fn deregister(&self, alias: &str) -> bool {
        let removed = self.pools.remove(alias).is_some();
        if removed {
            tracing::debug!(alias, "pool deregistered");
        }
        removed
    }

    /// Look up a live pool.
    #[must_use]
    pub fn get(&self, alias: &str) -> Option<Arc<dyn PoolMonitor>> {
        self.pools.get(alias).and_then(|entry| entry.upgrade())
    }

    /// Counter snapshot of the pool registered under `alias`.
    #[must_use]
    pub fn stats(&self, alias: &str) -> Option<PoolStats> {
        self.get(alias).map(|pool| pool.stats())
    }

    /// Health of the pool registered under `alias`.
    #[must_use]
    pub fn up_state(&self, alias: &str) -> Option<UpState> {
        self.get(alias).map(|pool| pool.up_state())
    }

    /// Aliases of all live pools, sorted.
    #[must_use]
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .pools
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        aliases.sort();
        aliases
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("aliases", &self.aliases())
            .finish()
    }
}
