//! Connection status and derived pool health.

use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lifecycle status of one pooled connection.
///
/// Permitted transitions:
///
/// ```text
/// OFFLINE   -> AVAILABLE | ACTIVE   (creation)
/// AVAILABLE -> ACTIVE               (acquire)
/// ACTIVE    -> AVAILABLE | NULL     (release, discard, forced expiry)
/// AVAILABLE -> OFFLINE              (housekeeping claims it)
/// OFFLINE   -> AVAILABLE | NULL     (validation result)
/// ```
///
/// NULL is terminal: the connection is about to be closed and removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Status {
    /// Dead; waiting to be physically closed and removed.
    Null = 0,
    /// Idle and claimable by callers.
    Available = 1,
    /// Checked out by a caller.
    Active = 2,
    /// Held by housekeeping or still being created; not claimable.
    Offline = 3,
}

impl Status {
    /// All states, indexed by their discriminant.
    pub const ALL: [Self; 4] = [Self::Null, Self::Available, Self::Active, Self::Offline];

    /// Index into per-state counter arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Active,
            3 => Self::Offline,
            _ => Self::Null,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Null => "NULL",
            Self::Available => "AVAILABLE",
            Self::Active => "ACTIVE",
            Self::Offline => "OFFLINE",
        };
        f.write_str(label)
    }
}

/// Derived health signal of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UpState {
    /// Idle capacity and no recent refusals.
    #[default]
    Quiet,
    /// At least one connection is in use.
    Busy,
    /// A caller was refused within the overload window.
    Overloaded,
    /// Nothing available and nothing recently started.
    Down,
}

/// Counter readings the health derivation depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    /// Connections currently AVAILABLE
    pub available: usize,
    /// Connections currently ACTIVE
    pub active: usize,
    /// Active connections that started recently
    pub recently_started: usize,
    /// Time since the last refusal, if there ever was one
    pub since_last_refusal: Option<Duration>,
}

impl UpState {
    /// Derive the health state from current counters.
    ///
    /// Pure: the same inputs always give the same answer.
    #[must_use]
    pub fn derive(inputs: HealthInputs, overload_window: Duration) -> Self {
        if inputs.available == 0 && inputs.recently_started == 0 {
            return Self::Down;
        }
        if inputs
            .since_last_refusal
            .is_some_and(|elapsed| elapsed < overload_window)
        {
            return Self::Overloaded;
        }
        if inputs.active > 0 {
            return Self::Busy;
        }
        Self::Quiet
    }
}

impl fmt::Display for UpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Quiet => "quiet",
            Self::Busy => "busy",
            Self::Overloaded => "overloaded",
            Self::Down => "down",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn status_round_trips_through_u8() {
        for status in Status::ALL {
            assert_eq!(Status::from_u8(status as u8), status);
            assert_eq!(Status::ALL[status.index()], status);
        }
    }

    #[test]
    fn down_without_available_or_recent_activity() {
        let inputs = HealthInputs {
            available: 0,
            active: 3,
            recently_started: 0,
            since_last_refusal: Some(Duration::from_secs(1)),
        };
        assert_eq!(UpState::derive(inputs, WINDOW), UpState::Down);
    }

    #[test]
    fn recent_activity_keeps_pool_up() {
        let inputs = HealthInputs {
            available: 0,
            active: 1,
            recently_started: 1,
            since_last_refusal: None,
        };
        assert_eq!(UpState::derive(inputs, WINDOW), UpState::Busy);
    }

    #[test]
    fn refusal_inside_window_is_overloaded() {
        let mut inputs = HealthInputs {
            available: 1,
            active: 0,
            recently_started: 0,
            since_last_refusal: Some(Duration::from_secs(59)),
        };
        assert_eq!(UpState::derive(inputs, WINDOW), UpState::Overloaded);

        inputs.since_last_refusal = Some(Duration::from_secs(61));
        assert_eq!(UpState::derive(inputs, WINDOW), UpState::Quiet);
    }

    #[test]
    fn idle_capacity_is_quiet() {
        let inputs = HealthInputs {
            available: 2,
            ..Default::default()
        };
        assert_eq!(UpState::derive(inputs, WINDOW), UpState::Quiet);
    }
}
