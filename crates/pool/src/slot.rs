//! One pooled connection and its status cell.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::status::Status;

#[derive(Debug, Default)]
struct Activity {
    last_start_active: Option<Instant>,
    last_stop_active: Option<Instant>,
    requester: Option<String>,
}

/// A connection owned by the pool's collection.
///
/// The status cell is only written while the pool's counter lock is held, so
/// a status change and the per-state counters always move together. Reads
/// are lock-free.
///
/// The instance is parked here while the connection is AVAILABLE or OFFLINE
/// and moved out into a [`PooledConnection`](crate::PooledConnection) while it
/// is ACTIVE.
pub(crate) struct Slot<T> {
    id: u64,
    status: AtomicU8,
    created_at: Instant,
    marked_for_expiry: AtomicBool,
    activity: Mutex<Activity>,
    instance: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    /// Wrap a freshly created instance. New slots start OFFLINE.
    pub(crate) fn new(id: u64, instance: T) -> Self {
        Self {
            id,
            status: AtomicU8::new(Status::Offline as u8),
            created_at: Instant::now(),
            marked_for_expiry: AtomicBool::new(false),
            activity: Mutex::new(Activity::default()),
            instance: Mutex::new(Some(instance)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Compare-and-set the status. Caller must hold the counter lock.
    pub(crate) fn compare_and_set(&self, from: Status, to: Status) -> bool {
        let swapped = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.stamp(from, to);
        }
        swapped
    }

    /// Unconditionally set the status, returning the previous one. Caller
    /// must hold the counter lock.
    pub(crate) fn force(&self, to: Status) -> Status {
        let from = Status::from_u8(self.status.swap(to as u8, Ordering::AcqRel));
        if from != to {
            self.stamp(from, to);
        }
        from
    }

    fn stamp(&self, from: Status, to: Status) {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        if to == Status::Active {
            activity.last_start_active = Some(now);
        }
        if from == Status::Active {
            activity.last_stop_active = Some(now);
        }
    }

    /// How long the connection has been ACTIVE, if it is.
    pub(crate) fn active_time(&self) -> Option<Duration> {
        if self.status() != Status::Active {
            return None;
        }
        self.activity
            .lock()
            .last_start_active
            .map(|started| started.elapsed())
    }

    /// Request expiry at the next release or housekeeping visit.
    ///
    /// Returns `true` if the flag was not already set.
    pub(crate) fn mark_for_expiry(&self) -> bool {
        !self.marked_for_expiry.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_marked_for_expiry(&self) -> bool {
        self.marked_for_expiry.load(Ordering::Acquire)
    }

    pub(crate) fn set_requester(&self, requester: &str) {
        self.activity.lock().requester = Some(requester.to_string());
    }

    pub(crate) fn requester(&self) -> Option<String> {
        self.activity.lock().requester.clone()
    }

    /// Put the instance back into the slot.
    pub(crate) fn park(&self, instance: T) {
        *self.instance.lock() = Some(instance);
    }

    /// Move the instance out of the slot, if it is parked here.
    pub(crate) fn take_instance(&self) -> Option<T> {
        self.instance.lock().take()
    }

    /// Diagnostic snapshot.
    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            status: self.status(),
            age: self.age(),
            requester: self.requester(),
            marked_for_expiry: self.is_marked_for_expiry(),
            active_time: self.active_time(),
        }
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("marked_for_expiry", &self.is_marked_for_expiry())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of one connection, for listeners and administration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ConnectionInfo {
    /// Unique, never reused connection id
    pub id: u64,
    /// Status at the time of the snapshot
    pub status: Status,
    /// Time since the connection was created
    pub age: Duration,
    /// Label of the caller that last acquired it
    pub requester: Option<String>,
    /// Whether expiry has been requested
    pub marked_for_expiry: bool,
    /// How long it has been active, if it is
    pub active_time: Option<Duration>,
}
