//! Error types for pool operations
use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error carried as the source of collaborator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Comprehensive error type for connection pool operations
#[derive(Error, Debug)]
pub enum Error {
    /// The pool is at its maximum connection count and none are available.
    ///
    /// Callers should back off and retry later; the pool never retries on
    /// their behalf.
    #[error(
        "Pool '{alias}' is at maximum connection count ({connection_count}/{maximum}) and none are available [stats: {stats}]"
    )]
    Exhausted {
        /// The pool alias
        alias: String,
        /// Connections that exist or are being created
        connection_count: usize,
        /// Configured maximum connection count
        maximum: usize,
        /// Compact statistics line at the time of refusal
        stats: String,
    },

    /// Too many connections are being created right now.
    #[error("Pool '{alias}' is already making {in_flight} connections (ceiling {ceiling})")]
    Overloaded {
        /// The pool alias
        alias: String,
        /// Creations currently in flight
        in_flight: usize,
        /// Configured `maximum_new_connections`
        ceiling: usize,
    },

    /// The backing resource refused or failed to connect.
    #[error("Pool '{alias}' failed to create a connection: {reason}")]
    Creation {
        /// The pool alias
        alias: String,
        /// The failure reason
        reason: String,
        /// The underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// A connection failed its health probe.
    #[error("Connection #{id} in pool '{alias}' failed validation: {reason}")]
    Validation {
        /// The pool alias
        alias: String,
        /// The connection id
        id: u64,
        /// The validation failure reason
        reason: String,
    },

    /// Physically closing a connection failed.
    #[error("Connection #{id} in pool '{alias}' failed to close: {reason}")]
    Close {
        /// The pool alias
        alias: String,
        /// The connection id
        id: u64,
        /// The close failure reason
        reason: String,
    },

    /// Pool configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// The pool has been shut down.
    #[error("Pool '{alias}' has been shut down")]
    ShutDown {
        /// The pool alias
        alias: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a creation error wrapping a collaborator failure.
    pub fn creation<E>(alias: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = source.into();
        Self::Creation {
            alias: alias.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a validation error
    pub fn validation(alias: impl Into<String>, id: u64, reason: impl Into<String>) -> Self {
        Self::Validation {
            alias: alias.into(),
            id,
            reason: reason.into(),
        }
    }

    /// Create a close error
    pub fn close(alias: impl Into<String>, id: u64, reason: impl Into<String>) -> Self {
        Self::Close {
            alias: alias.into(),
            id,
            reason: reason.into(),
        }
    }

    /// Whether this error belongs to the capacity family (pool full or busy
    /// creating).
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Overloaded { .. })
    }

    /// Check if this error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exhausted { .. } | Self::Overloaded { .. } => true,
            Self::Creation { .. } => true,
            _ => false,
        }
    }

    /// Get the pool alias associated with this error (if any)
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => None,
            Self::Exhausted { alias, .. }
            | Self::Overloaded { alias, .. }
            | Self::Creation { alias, .. }
            | Self::Validation { alias, .. }
            | Self::Close { alias, .. }
            | Self::ShutDown { alias } => Some(alias),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_family_is_retryable() {
        let exhausted = Error::Exhausted {
            alias: "db".into(),
            connection_count: 2,
            maximum: 2,
            stats: "2 (02/02)".into(),
        };
        assert!(exhausted.is_capacity());
        assert!(exhausted.is_retryable());

        let overloaded = Error::Overloaded {
            alias: "db".into(),
            in_flight: 11,
            ceiling: 10,
        };
        assert!(overloaded.is_capacity());

        assert!(!Error::configuration("bad").is_retryable());
        assert!(!Error::ShutDown { alias: "db".into() }.is_capacity());
    }

    #[test]
    fn creation_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::creation("db", io);
        assert_eq!(err.alias(), Some("db"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn exhausted_message_carries_stats() {
        let err = Error::Exhausted {
            alias: "db".into(),
            connection_count: 2,
            maximum: 2,
            stats: "5 (02/02) -1".into(),
        };
        assert!(err.to_string().ends_with("[stats: 5 (02/02) -1]"));
    }
}
