//! Error type for pool operations.

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by a pool or thread pool.
#[derive(Error, Debug)]
pub enum Error {
    /// An option passed to a pool constructor was invalid.
    #[error("invalid pool configuration: {message}")]
    Configuration {
        /// Description of the violated constraint.
        message: String,
    },

    /// The user-supplied factory failed to produce an object.
    #[error("factory failed to create pooled object")]
    Factory {
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// `try_acquire` found the pool saturated.
    #[error("pool exhausted: {current_size}/{max_size} entries in use")]
    PoolExhausted {
        /// Entries currently resident in the pool.
        current_size: usize,
        /// Configured hard cap.
        max_size: usize,
    },

    /// A caller-supplied deadline on `acquire` elapsed.
    #[error("acquire timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: std::time::Duration,
    },

    /// An operation was attempted after the pool was closed.
    #[error("pool is closed")]
    Closed,

    /// `release` was called with an entry that does not belong to this pool.
    #[error("misuse: {reason}")]
    Misuse {
        /// What went wrong.
        reason: String,
    },
}

impl Error {
    /// Build a [`Error::Configuration`] from any displayable message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Build a [`Error::Factory`] wrapping an arbitrary error.
    pub fn factory<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Factory {
            source: Box::new(source),
        }
    }

    /// Build a [`Error::Misuse`] from any displayable reason.
    pub fn misuse(reason: impl Into<String>) -> Self {
        Self::Misuse {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call might succeed without any other change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Timeout { .. })
    }
}
