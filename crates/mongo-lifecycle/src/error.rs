//! Error types.
//!
//! Errors are split into two tiers. [`Severity::Fatal`] faults mean the
//! component cannot continue in its current activation and the host is
//! expected to abort start-up. [`Severity::Recoverable`] errors are returned to
//! the host, which decides whether to retry, degrade or abort.

use std::time::Duration;

use thiserror::Error;

use crate::driver::BoxError;

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How the host should treat an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The component remains usable; the caller may retry later.
    Recoverable,
    /// The component cannot proceed; the host should escalate.
    Fatal,
}

/// Errors produced by the connection manager and the metrics bridge.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver could not create a session for the configured URI.
    #[error("dial mongodb [{uri}] error: {source}")]
    Dial {
        /// Redacted connection URI.
        uri: String,
        /// Driver error.
        #[source]
        source: BoxError,
    },

    /// Establishing the network connection failed.
    #[error("connect to mongodb [{uri}] error: {source}")]
    Connect {
        /// Redacted connection URI.
        uri: String,
        /// Driver error.
        #[source]
        source: BoxError,
    },

    /// The liveness probe against the primary failed.
    #[error("ping to mongodb [{uri}] error: {source}")]
    Ping {
        /// Redacted connection URI.
        uri: String,
        /// Driver error.
        #[source]
        source: BoxError,
    },

    /// Closing the network connection failed.
    #[error("disconnect from mongodb [{uri}] error: {source}")]
    Disconnect {
        /// Redacted connection URI.
        uri: String,
        /// Driver error.
        #[source]
        source: BoxError,
    },

    /// A network operation exceeded its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The caller cancelled the operation.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was cancelled.
        operation: &'static str,
    },

    /// The operation needs a session but none exists.
    #[error("no active session")]
    NotConnected,

    /// The metrics bridge could not be built or registered.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Config(_) | Self::Dial { .. } | Self::Metrics(_) => Severity::Fatal,
            Self::Connect { .. }
            | Self::Ping { .. }
            | Self::Disconnect { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. }
            | Self::NotConnected => Severity::Recoverable,
        }
    }

    /// Whether the host should abort the current activation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Whether this error came from a deadline rather than the remote side.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
