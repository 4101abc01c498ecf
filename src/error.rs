//! Custom error types for the turntable engine.
//!
//! `TableError` is the single error type crossing the crate's public API.
//! Variants are grouped by how the caller should react:
//!
//! - **Local validation** (`InvalidAcceleration`): rejected before any I/O.
//! - **Admission** (`CommandInProgress`, `RotationInProgress`): fail fast,
//!   retry after backoff.
//! - **Protocol timeout** (`CommandNotStarted`, `NoAccelerationValue`): the
//!   operation is dead, the transport is assumed still usable.
//! - **Protocol violation** (`CommandRejected`, `MissingEndToken`): the
//!   device answered, but not the way the protocol requires.
//! - **Transport** (`Transport`): the serial channel itself faulted; the
//!   channel needs a `reinit` before further use.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, TableError>;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("acceleration must be between 1 and 10, got {0}")]
    InvalidAcceleration(i32),

    #[error("another command is already in progress, rejected {operation}")]
    CommandInProgress { operation: &'static str },

    #[error("a previous rotation is still running")]
    RotationInProgress,

    #[error("command was not started: no OK/ERR received within {timeout:?}")]
    CommandNotStarted { timeout: Duration },

    #[error("failed to init command: table replied ERR")]
    CommandRejected,

    #[error("no acceleration value was received")]
    NoAccelerationValue,

    #[error("rotating command must end with END token")]
    MissingEndToken,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TableError::InvalidAcceleration(42);
        assert_eq!(err.to_string(), "acceleration must be between 1 and 10, got 42");

        let err = TableError::CommandInProgress { operation: "stop" };
        assert!(err.to_string().contains("stop"));
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err = TableError::from(TransportError::NotConnected);
        assert_eq!(err.to_string(), TransportError::NotConnected.to_string());
    }
}
