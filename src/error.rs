//! Crate-level error types.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Engine Layer (`crate::error`)
//!
//! - [`Error`]: configuration, batch-capacity, and partition-processing errors
//! - Carries an `is_transient()` classification that the partition pumps use
//!   to decide between "log and continue" and "stop and relinquish"
//!
//! ## Store Layer ([`StoreError`])
//!
//! - Failures raised by [`CheckpointStore`](crate::processor::CheckpointStore)
//!   implementations. These are never fatal to the engine: a failed
//!   load-balancer tick is reported through the error handler and retried from
//!   scratch on the next tick.
//!
//! # Fail-Fast vs Best-Effort
//!
//! - **Construction**: missing store, missing handler, or conflicting
//!   single/batch handler configuration fail synchronously with
//!   [`Error::Config`], never at runtime.
//! - **Tick path**: best-effort; store errors surface through the processor
//!   error handler with partition scope (or the
//!   [`PARTITION_ID_NONE`](crate::processor::PARTITION_ID_NONE) sentinel) and
//!   the next tick retries.
//! - **Pump path**: handler errors stop the owning pump unless classified
//!   transient; the lease is relinquished by ceasing renewal, never by an
//!   explicit release write.

use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Result alias for checkpoint-store operations.
pub type StoreResult<T> = result::Result<T, StoreError>;

/// Engine, configuration, and batch errors.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Configuration error detected at build time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint store failure, possibly transient.
    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    /// Consumption source failure for one partition.
    #[error("Partition source error: {0}")]
    Source(String),

    /// A single event exceeds the batch size limit and can never fit,
    /// regardless of how empty the batch is.
    #[error("Event of {size} bytes exceeds the maximum batch size of {max_size} bytes")]
    PayloadTooLarge { size: usize, max_size: usize },

    /// Event handler returned an error for one partition.
    #[error("Event handler error: {0}")]
    Handler(String),

    /// The engine is not in a state that allows the requested operation.
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// An error in the network or filesystem.
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
}

impl Error {
    /// Whether a pump may keep running after surfacing this error.
    ///
    /// Transient errors are reported and consumption continues; everything
    /// else stops the pump, which relinquishes its partition by ceasing
    /// lease renewal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(e) => e.is_transient(),
            Error::Config(_)
            | Error::Source(_)
            | Error::PayloadTooLarge { .. }
            | Error::Handler(_)
            | Error::InvalidState(_)
            | Error::Io(_) => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

/// Failures raised by checkpoint store implementations.
///
/// Stores signal lost optimistic-concurrency races by *omitting* records from
/// a `claim_ownership` result, not by raising an error; these variants cover
/// genuine failures only.
#[derive(Debug, Clone, ThisError)]
pub enum StoreError {
    /// The store could not be reached; safe to retry on the next tick.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the request and a retry will not help.
    #[error("Store rejected request: {0}")]
    Rejected(String),

    /// A stored record could not be decoded.
    #[error("Corrupt store record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient errors are retried on the next load-balancer tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Rejected("forbidden".into()).is_transient());
        assert!(!StoreError::Corrupt("bad json".into()).is_transient());
    }

    #[test]
    fn test_error_classification_follows_store() {
        let transient = Error::Store(StoreError::Unavailable("timeout".into()));
        assert!(transient.is_transient());

        let permanent = Error::Store(StoreError::Rejected("forbidden".into()));
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_payload_too_large_is_permanent() {
        let err = Error::PayloadTooLarge {
            size: 2 * 1024 * 1024,
            max_size: 1024,
        };
        assert!(!err.is_transient());
        let display = format!("{err}");
        assert!(display.contains("2097152"));
        assert!(display.contains("1024"));
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("checkpoint store is required".into());
        assert!(format!("{err}").contains("checkpoint store is required"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(err, Error::Io(io::ErrorKind::ConnectionRefused)));
    }
}
