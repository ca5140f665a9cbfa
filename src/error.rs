//! Custom error types for the application.
//!
//! This module defines the primary error type, `AutofocusError`, for the whole crate.
//! Using the `thiserror` crate, it gives the control loop one consistent way to
//! report failures, from bad scan parameters and stage faults to configuration
//! problems.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameters`**: caller error, rejected before any hardware action.
//! - **`MotionFailed`**: the stage adapter reported a failed or timed-out move.
//! - **`SampleUnavailable`**: a brightness reading was missing. Non-fatal during a
//!   sweep (the position is recorded as a gap), surfaced only by direct reads.
//! - **`NoSamples`**: focus selection attempted on an empty session.
//! - **`AlreadyActive`**: a second scan or monitor start while one is running.
//! - **`InvalidState`**: a command that the controller cannot accept in its
//!   current state (for example `apply_best_focus` with no session).
//! - **`ControllerClosed`**: the controller task has shut down.
//! - **`Config`** / **`ConfigValidation`**: configuration load and semantic errors.
//!
//! Errors are not `Clone`, so events broadcast to several subscribers carry a
//! [`ScanFailure`] summary instead.

use crate::hardware::SampleError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AutofocusError>;

#[derive(Error, Debug)]
pub enum AutofocusError {
    #[error("Invalid scan parameters: {0}")]
    InvalidParameters(String),

    #[error("Stage motion failed: {0}")]
    MotionFailed(String),

    #[error("Brightness sample unavailable: {0}")]
    SampleUnavailable(#[from] SampleError),

    #[error("No samples recorded in session")]
    NoSamples,

    #[error("Controller already active ({0})")]
    AlreadyActive(String),

    #[error("Command '{command}' not accepted while {state}")]
    InvalidState {
        /// Rejected command name
        command: String,
        /// Controller state at the time of rejection
        state: String,
    },

    #[error("Scan controller has shut down")]
    ControllerClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),
}

impl AutofocusError {
    /// Wrap an adapter error from a stage move.
    pub fn motion(context: &str, err: anyhow::Error) -> Self {
        AutofocusError::MotionFailed(format!("{context}: {err:#}"))
    }

    /// Short, stable name of the error kind.
    pub fn kind(&self) -> FailureKind {
        match self {
            AutofocusError::InvalidParameters(_) => FailureKind::InvalidParameters,
            AutofocusError::MotionFailed(_) => FailureKind::MotionFailed,
            AutofocusError::SampleUnavailable(_) => FailureKind::SampleUnavailable,
            AutofocusError::NoSamples => FailureKind::NoSamples,
            AutofocusError::AlreadyActive(_) => FailureKind::AlreadyActive,
            AutofocusError::InvalidState { .. } => FailureKind::InvalidState,
            AutofocusError::ControllerClosed => FailureKind::ControllerClosed,
            AutofocusError::Config(_) | AutofocusError::ConfigValidation(_) => {
                FailureKind::Configuration
            }
        }
    }
}

impl From<figment::Error> for AutofocusError {
    fn from(value: figment::Error) -> Self {
        AutofocusError::Config(Box::new(value))
    }
}

/// Error category carried by [`ScanFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// See [`AutofocusError::InvalidParameters`]
    InvalidParameters,
    /// See [`AutofocusError::MotionFailed`]
    MotionFailed,
    /// See [`AutofocusError::SampleUnavailable`]
    SampleUnavailable,
    /// See [`AutofocusError::NoSamples`]
    NoSamples,
    /// See [`AutofocusError::AlreadyActive`]
    AlreadyActive,
    /// See [`AutofocusError::InvalidState`]
    InvalidState,
    /// See [`AutofocusError::ControllerClosed`]
    ControllerClosed,
    /// Configuration load or validation failure
    Configuration,
}

/// Cloneable summary of a terminal failure, used in status events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    /// Error category
    pub kind: FailureKind,
    /// Human-readable message
    pub message: String,
}

impl From<&AutofocusError> for ScanFailure {
    fn from(value: &AutofocusError) -> Self {
        ScanFailure {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl std::fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
