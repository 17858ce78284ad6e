//! Custom error types for the pulsed-ODMR core.
//!
//! This module defines the primary error type, `OdmrError`. Using the `thiserror`
//! crate, it provides one variant per failure kind the acquisition core can
//! produce, plus the ambient I/O, configuration and serialization failures.
//!
//! ## Error Kinds
//!
//! - **`InvalidRequest`**: user-supplied parameters that cannot be satisfied even after
//!   clamping (empty sweep, π below the hardware floor, waveform exceeding memory).
//! - **`HardwareUnavailable`**: a collaborator returned a failure on a required call.
//! - **`ProtocolViolation`**: a collaborator returned data of the wrong shape.
//! - **`Timeout`**: the counter did not fill in time, or teardown did not finish.
//! - **`Busy`**: a request was issued in a state that does not accept it.
//! - **`Fatal`**: the single-retry recovery path failed a second time, or teardown failed.
//!
//! Capability traits in [`crate::hardware::capabilities`] return `anyhow::Result`;
//! the coordinator translates those into `HardwareUnavailable` at the boundary.

use crate::experiment::state::RunState;
use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type OdmrResult<T> = std::result::Result<T, OdmrError>;

/// Error taxonomy of the acquisition core.
#[derive(Error, Debug)]
pub enum OdmrError {
    /// Parameters cannot be satisfied even after clamping.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A collaborator failed a required call.
    #[error("Hardware unavailable during {operation}: {message}")]
    HardwareUnavailable {
        /// Name of the failing collaborator call
        operation: String,
        /// Driver-provided reason
        message: String,
    },

    /// A collaborator returned data of the wrong shape.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// An operation did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The request is not accepted in the current run state.
    #[error("Busy: cannot {request} while {state}")]
    Busy {
        /// State the request was refused in
        state: RunState,
        /// Short name of the refused request
        request: String,
    },

    /// Unrecoverable failure; instruments have been torn down.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The acquisition task is gone.
    #[error("Acquisition task is not running")]
    ChannelClosed,
}

/// Payload-free classification of [`OdmrError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    HardwareUnavailable,
    ProtocolViolation,
    Timeout,
    Busy,
    Fatal,
    Config,
    Io,
    Storage,
    ChannelClosed,
}

impl OdmrError {
    /// Builds a `HardwareUnavailable` from a driver error.
    pub fn hardware(operation: &str, err: &anyhow::Error) -> Self {
        OdmrError::HardwareUnavailable {
            operation: operation.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Builds a `Busy` refusal.
    pub fn busy(state: RunState, request: &str) -> Self {
        OdmrError::Busy {
            state,
            request: request.to_string(),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OdmrError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            OdmrError::HardwareUnavailable { .. } => ErrorKind::HardwareUnavailable,
            OdmrError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            OdmrError::Timeout(_) => ErrorKind::Timeout,
            OdmrError::Busy { .. } => ErrorKind::Busy,
            OdmrError::Fatal(_) => ErrorKind::Fatal,
            OdmrError::Config(_) | OdmrError::Configuration(_) => ErrorKind::Config,
            OdmrError::Io(_) => ErrorKind::Io,
            OdmrError::Serialization(_) | OdmrError::Storage(_) => ErrorKind::Storage,
            OdmrError::ChannelClosed => ErrorKind::ChannelClosed,
        }
    }

    /// Stale counter data and short buffers end the run with a stop, not an error state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::ProtocolViolation
        )
    }
}

impl From<figment::Error> for OdmrError {
    fn from(value: figment::Error) -> Self {
        OdmrError::Config(Box::new(value))
    }
}
