//! Pool configuration types

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stats::Period;

/// Configuration for a connection pool.
///
/// Loading this from files or properties is the caller's business; the pool
/// only consumes the validated struct.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Name used in logs, events and the registry
    pub alias: String,
    /// Maximum number of connections, including ones being created
    pub maximum_connection_count: usize,
    /// Minimum number of connections kept open by the prototyper
    pub minimum_connection_count: usize,
    /// Maximum number of connections being created at the same time
    pub maximum_new_connections: usize,
    /// Connections older than this are expired by housekeeping
    pub maximum_connection_lifetime: Duration,
    /// Connections active for longer than this are forcibly expired
    pub maximum_active_time: Duration,
    /// Connections active for less than this count as evidence the pool is up
    pub recently_started_threshold: Duration,
    /// How long a refusal keeps the pool in the overloaded state
    pub overload_without_refusal_lifetime: Duration,
    /// Interval between housekeeping passes
    pub house_keeping_sleep_time: Duration,
    /// Statement run against idle connections during housekeeping
    pub house_keeping_test_query: Option<String>,
    /// Number of spare available connections the prototyper keeps ready
    pub prototype_count: usize,
    /// Grace period given to active connections on shutdown
    pub shutdown_delay: Duration,
    /// Statistics periods such as `"10s"`, `"1m"`, `"1h"` or `"1d"`
    pub statistics: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            alias: "pool".to_string(),
            maximum_connection_count: 15,
            minimum_connection_count: 5,
            maximum_new_connections: 10,
            maximum_connection_lifetime: Duration::from_secs(4 * 60 * 60),
            maximum_active_time: Duration::from_secs(5 * 60),
            recently_started_threshold: Duration::from_secs(1),
            overload_without_refusal_lifetime: Duration::from_secs(60),
            house_keeping_sleep_time: Duration::from_secs(30),
            house_keeping_test_query: None,
            prototype_count: 0,
            shutdown_delay: Duration::ZERO,
            statistics: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Create a default configuration under the given alias.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.alias.is_empty() {
            return Err(Error::configuration("alias must not be empty"));
        }
        if self.maximum_connection_count == 0 {
            return Err(Error::configuration(
                "maximum_connection_count must be greater than 0",
            ));
        }
        if self.minimum_connection_count > self.maximum_connection_count {
            return Err(Error::configuration(format!(
                "minimum_connection_count ({}) must not exceed maximum_connection_count ({})",
                self.minimum_connection_count, self.maximum_connection_count
            )));
        }
        if self.maximum_new_connections == 0 {
            return Err(Error::configuration(
                "maximum_new_connections must be greater than 0",
            ));
        }
        if self.house_keeping_sleep_time.is_zero() {
            return Err(Error::configuration(
                "house_keeping_sleep_time must be greater than zero",
            ));
        }
        self.statistics_periods().map(|_| ())
    }

    /// Parse the configured statistics tokens.
    pub fn statistics_periods(&self) -> Result<Vec<Period>> {
        self.statistics.iter().map(|token| token.parse()).collect()
    }

    /// The test query, if one is set and non-empty.
    #[must_use]
    pub fn test_query(&self) -> Option<&str> {
        self.house_keeping_test_query
            .as_deref()
            .filter(|sql| !sql.trim().is_empty())
    }
}
