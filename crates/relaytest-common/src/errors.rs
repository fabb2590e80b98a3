//! Error types for the relaytest harness.

use crate::types::TestResult;
use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TesterError>;

/// Main error type for tester operations.
///
/// Most variants are recovered per-task and recorded as a [`TestResult`]
/// on the result record; the batch keeps going. Only configuration and
/// filesystem errors raised before a batch starts are fatal.
#[derive(Debug, Error)]
pub enum TesterError {
    /// The port range has no ports at all (empty or inverted range).
    #[error("Port range [{start}, {end}) is exhausted")]
    PortExhausted { start: u16, end: u16 },

    /// The core's local inbound never accepted a connection.
    #[error("Port conflict for {tag} on 127.0.0.1:{port}: {reason}")]
    PortConflict { tag: String, port: u16, reason: String },

    /// The core binary could not be spawned, or died before readiness.
    #[error("Launch failed for {tag}: {reason}")]
    LaunchFailed { tag: String, reason: String },

    /// The candidate record is missing fields the core config needs.
    #[error("Invalid candidate {tag}: {reason}")]
    InvalidCandidate { tag: String, reason: String },

    /// The operation was interrupted by batch cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration (bad env value, bad probe URL, bad range).
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TesterError {
    pub fn port_conflict(
        tag: impl Into<String>,
        port: u16,
        reason: impl Into<String>,
    ) -> Self {
        Self::PortConflict {
            tag: tag.into(),
            port,
            reason: reason.into(),
        }
    }

    pub fn launch_failed(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailed {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_candidate(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCandidate {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// How this error is recorded when it terminates a single test task.
    ///
    /// An exhausted port range is recorded as `port_conflict`, matching the
    /// "failed to acquire port" outcome the result consumers expect.
    pub fn test_result(&self) -> TestResult {
        match self {
            Self::PortExhausted { .. } | Self::PortConflict { .. } => TestResult::PortConflict,
            Self::LaunchFailed { .. } | Self::InvalidCandidate { .. } => TestResult::LaunchFailed,
            Self::Cancelled => TestResult::Cancelled,
            _ => TestResult::Failure,
        }
    }
}
