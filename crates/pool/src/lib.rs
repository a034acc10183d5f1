//! # Nebula Pool
//!
//! A managed pool of expensive, stateful connections shared by many
//! concurrent callers.
//!
//! The pool hands out a ready connection or fails fast, bounds how many
//! connections exist and how many are being opened at once, keeps spare
//! connections ready, evicts connections that went bad or lived too long,
//! and derives a health signal (quiet, busy, overloaded, down).
//!
//! The backing protocol lives behind the [`Resource`] trait; the pool only
//! decides when to create, probe and close.

pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod slot;
pub mod stats;
pub mod status;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use events::{EventBus, PoolEvent, RemovalReason};
pub use guard::PooledConnection;
pub use listener::{ConnectionListener, StateListener};
pub use pool::{Pool, PoolStats};
pub use registry::{PoolMonitor, Registry};
pub use resource::Resource;
pub use slot::ConnectionInfo;
pub use stats::{Period, Statistics, StatsRoller};
pub use status::{Status, UpState};
