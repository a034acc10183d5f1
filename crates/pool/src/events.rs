//! Event broadcasting for pool observability.
//!
//! Provides [`PoolEvent`] variants emitted during connection lifecycle
//! operations and an [`EventBus`] backed by `tokio::sync::broadcast`.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::status::{Status, UpState};

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted by a pool.
///
/// All variants carry the `alias` of the pool that emitted them.
/// Subscribers receive cloned copies via [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A connection was created and admitted.
    Born {
        /// The pool alias.
        alias: String,
        /// The connection id.
        id: u64,
        /// The state it was admitted in (ACTIVE on demand, AVAILABLE when prototyped).
        status: Status,
    },
    /// A caller was handed a connection.
    Served {
        /// The pool alias.
        alias: String,
        /// The connection id.
        id: u64,
        /// The requester label.
        requester: String,
    },
    /// A caller was refused.
    Refused {
        /// The pool alias.
        alias: String,
        /// Human-readable refusal reason.
        reason: String,
    },
    /// A connection came back from a caller.
    Returned {
        /// The pool alias.
        alias: String,
        /// The connection id.
        id: u64,
        /// How long the caller held it.
        active_time: Duration,
    },
    /// Expiry was requested for a connection that is in use.
    MarkedForExpiry {
        /// The pool alias.
        alias: String,
        /// The connection id.
        id: u64,
    },
    /// A connection was removed from the pool.
    Removed {
        /// The pool alias.
        alias: String,
        /// The connection id.
        id: u64,
        /// Why it was removed.
        reason: RemovalReason,
    },
    /// The derived health state changed.
    UpStateChanged {
        /// The pool alias.
        alias: String,
        /// Previous state.
        from: UpState,
        /// New state.
        to: UpState,
    },
}

// ---------------------------------------------------------------------------
// RemovalReason
// ---------------------------------------------------------------------------

/// Reason a connection was permanently removed from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalReason {
    /// The connection exceeded its maximum lifetime.
    Expired {
        /// Age at removal.
        age: Duration,
    },
    /// Expiry had been requested and the connection came back.
    ExpiryRequested,
    /// The housekeeping test statement failed.
    ValidationFailed {
        /// The probe error.
        reason: String,
    },
    /// The driver reported the connection as already closed.
    AppearsClosed,
    /// The connection was active longer than allowed.
    ActiveTooLong {
        /// How long it had been active.
        active_time: Duration,
    },
    /// An administrator expired it.
    ManuallyKilled,
    /// The caller reported it as broken.
    Discarded,
    /// The pool is shutting down.
    Shutdown,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired { age } => write!(f, "age is {}ms", age.as_millis()),
            Self::ExpiryRequested => write!(f, "expiry was requested"),
            Self::ValidationFailed { reason } => write!(f, "it has problems: {reason}"),
            Self::AppearsClosed => write!(f, "it appears to be closed"),
            Self::ActiveTooLong { active_time } => {
                write!(f, "it has been active for {}ms", active_time.as_millis())
            }
            Self::ManuallyKilled => write!(f, "it was manually killed"),
            Self::Discarded => write!(f, "it was discarded by its caller"),
            Self::Shutdown => write!(f, "the pool is shutting down"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped (no backpressure on the
/// emitter).
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    ///
    /// The buffer size determines how many events can be queued before
    /// slow subscribers start lagging (and losing events).
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // An error only means nobody is subscribed.
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    ///
    /// If the subscriber falls behind by more than `buffer_size` events, it
    /// will receive a `Lagged` error and skip to the latest.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}
