//! Rolling statistics windows.
//!
//! A [`StatsRoller`] accumulates served, refused and returned counts into a
//! half-open window `[start, stop)` and closes the window at calendar-aligned
//! boundaries. Rolling happens lazily on the first record past the boundary;
//! the pool also runs a backstop timer so idle pools still roll.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Timelike, Utc};
use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::error::{Error, Result};

/// How often the backstop timer rolls idle windows.
pub(crate) const ROLL_CHECK_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Period
// ---------------------------------------------------------------------------

/// Calendar unit of a statistics period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Seconds (`s`), aligned to the start of the minute.
    Second,
    /// Minutes (`m`), aligned to the start of the hour.
    Minute,
    /// Hours (`h`), aligned to midnight.
    Hour,
    /// Days (`d`), aligned to midnight.
    Day,
}

impl Unit {
    const fn seconds(self) -> i64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 60 * 60,
            Self::Day => 24 * 60 * 60,
        }
    }

    const fn suffix(self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
        }
    }
}

/// A statistics period such as `10s` or `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    count: u32,
    unit: Unit,
}

impl Period {
    /// Build a period from a count and a unit.
    pub fn new(count: u32, unit: Unit) -> Result<Self> {
        if count == 0 {
            return Err(Error::configuration("statistics period must be at least 1"));
        }
        Ok(Self { count, unit })
    }

    /// The number of units in one window.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The calendar unit.
    #[must_use]
    pub fn unit(&self) -> Unit {
        self.unit
    }

    fn step(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.count) * self.unit.seconds())
    }

    /// The first boundary strictly after `now`, counted in whole periods from
    /// the enclosing minute, hour or day.
    fn first_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let aligned = match self.unit {
            Unit::Second => date.and_hms_opt(now.hour(), now.minute(), 0),
            Unit::Minute => date.and_hms_opt(now.hour(), 0, 0),
            Unit::Hour | Unit::Day => date.and_hms_opt(0, 0, 0),
        };
        let mut boundary = aligned.map_or(now, |naive| naive.and_utc());
        let step = self.step();
        while boundary <= now {
            boundary += step;
        }
        boundary
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        let token = token.trim();
        let Some(suffix) = token.chars().last() else {
            return Err(Error::configuration("empty statistics period"));
        };
        let unit = match suffix {
            's' => Unit::Second,
            'm' => Unit::Minute,
            'h' => Unit::Hour,
            'd' => Unit::Day,
            _ => {
                return Err(Error::configuration(format!(
                    "unrecognised suffix in statistics: {token}"
                )));
            }
        };
        let count = token[..token.len() - suffix.len_utf8()]
            .parse::<u32>()
            .map_err(|_| Error::configuration(format!("bad statistics period: {token}")))?;
        Self::new(count, unit)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters accumulated over one window.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Statistics {
    /// Window start (inclusive)
    pub start: DateTime<Utc>,
    /// Window stop (exclusive); `None` while the window is open
    pub stop: Option<DateTime<Utc>>,
    /// Connections handed out
    pub served_count: u64,
    /// Acquire attempts refused
    pub refused_count: u64,
    /// Completed active periods (connections returned)
    pub returned_count: u64,
    /// Sum of the completed active periods
    pub total_active_time: Duration,
}

impl Statistics {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            stop: None,
            served_count: 0,
            refused_count: 0,
            returned_count: 0,
            total_active_time: Duration::ZERO,
        }
    }

    /// Length of a closed window; zero while it is still open.
    #[must_use]
    pub fn length(&self) -> Duration {
        self.stop
            .and_then(|stop| (stop - self.start).to_std().ok())
            .unwrap_or_default()
    }

    /// Served connections per second over the window.
    #[must_use]
    pub fn served_per_second(&self) -> f64 {
        per_second(self.served_count, self.length())
    }

    /// Refusals per second over the window.
    #[must_use]
    pub fn refused_per_second(&self) -> f64 {
        per_second(self.refused_count, self.length())
    }

    /// Mean length of a completed active period.
    #[must_use]
    pub fn average_active_time(&self) -> Duration {
        match u32::try_from(self.returned_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_active_time / n,
            Err(_) => Duration::from_secs_f64(
                self.total_active_time.as_secs_f64() / self.returned_count as f64,
            ),
        }
    }

    /// Mean number of connections active at once over the window.
    #[must_use]
    pub fn average_active_count(&self) -> f64 {
        let length = self.length().as_secs_f64();
        if length > 0.0 {
            self.total_active_time.as_secs_f64() / length
        } else {
            0.0
        }
    }
}

fn per_second(count: u64, length: Duration) -> f64 {
    let secs = length.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}

// ---------------------------------------------------------------------------
// StatsRoller
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RollerState {
    current: Statistics,
    complete: Option<Statistics>,
    next_roll: DateTime<Utc>,
}

/// Rolls statistics into fixed, calendar-aligned windows for one period.
#[derive(Debug)]
pub struct StatsRoller {
    alias: String,
    period: Period,
    state: Mutex<RollerState>,
}

impl StatsRoller {
    /// Start collecting from now.
    pub fn new(alias: impl Into<String>, period: Period) -> Self {
        Self::starting_at(alias, period, Utc::now())
    }

    pub(crate) fn starting_at(alias: impl Into<String>, period: Period, now: DateTime<Utc>) -> Self {
        let next_roll = period.first_boundary(now);
        let alias = alias.into();
        tracing::debug!(alias = %alias, period = %period, first_roll = %next_roll, "collecting statistics");
        Self {
            alias,
            period,
            state: Mutex::new(RollerState {
                current: Statistics::new(now),
                complete: None,
                next_roll,
            }),
        }
    }

    /// The period this roller covers.
    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }

    /// Count a served connection.
    pub fn record_served(&self) {
        self.record_at(Utc::now(), |stats| stats.served_count += 1);
    }

    /// Count a refusal.
    pub fn record_refused(&self) {
        self.record_at(Utc::now(), |stats| stats.refused_count += 1);
    }

    /// Count a returned connection and its active time.
    pub fn record_returned(&self, active_time: Duration) {
        self.record_at(Utc::now(), |stats| {
            stats.returned_count += 1;
            stats.total_active_time += active_time;
        });
    }

    pub(crate) fn record_at(&self, now: DateTime<Utc>, update: impl FnOnce(&mut Statistics)) {
        let mut state = self.state.lock();
        self.roll_locked(&mut state, now);
        update(&mut state.current);
    }

    /// Close the current window if its boundary has passed.
    pub fn roll(&self) {
        self.roll_at(Utc::now());
    }

    pub(crate) fn roll_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        self.roll_locked(&mut state, now);
    }

    fn roll_locked(&self, state: &mut RollerState, now: DateTime<Utc>) {
        while now >= state.next_roll {
            let boundary = state.next_roll;
            let mut done = std::mem::replace(&mut state.current, Statistics::new(boundary));
            done.stop = Some(boundary);
            self.log_window(&done);
            state.complete = Some(done);
            state.next_roll = boundary + self.period.step();
        }
    }

    fn log_window(&self, stats: &Statistics) {
        tracing::info!(
            alias = %self.alias,
            period = %self.period,
            start = %stats.start.format("%H:%M:%S"),
            stop = %stats.stop.map(|t| t.format("%H:%M:%S").to_string()).unwrap_or_default(),
            served = stats.served_count,
            served_per_second = format_args!("{:.2}", stats.served_per_second()),
            refused = stats.refused_count,
            refused_per_second = format_args!("{:.2}", stats.refused_per_second()),
            average_active_ms = stats.average_active_time().as_millis() as u64,
            average_active_count = format_args!("{:.2}", stats.average_active_count()),
            "statistics window closed"
        );
    }

    /// The most recently closed window, if any.
    #[must_use]
    pub fn complete_statistics(&self) -> Option<Statistics> {
        self.state.lock().complete.clone()
    }

    /// The window being accumulated right now.
    #[must_use]
    pub fn current_statistics(&self) -> Statistics {
        self.state.lock().current.clone()
    }
}
