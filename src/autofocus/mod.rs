//! Autofocus control loop.
//!
//! - [`monitor`]: live, best-effort brightness polling
//! - [`engine`]: stepwise Z sweep recording brightness per position
//! - [`selector`]: brightest-sample selection and the move to best focus
//! - [`controller`]: the state machine that sequences the three
//! - [`types`]: parameters, sessions and results shared between them

pub mod controller;
pub mod engine;
pub mod monitor;
pub mod selector;
pub mod types;

pub use controller::{
    ControllerConfig, ControllerHandle, ControllerState, ScanController, StatusEvent,
};
pub use engine::{AbortHandle, StepOutcome, ZScanEngine};
pub use monitor::BrightnessMonitor;
pub use selector::FocusSelector;
pub use types::{
    FocusResult, ScanParameters, ScanProgress, ScanSample, ScanSession, ScanSnapshot,
    SessionStatus, SkippedStep,
};
