//! Hardware Abstraction
//!
//! Capability traits for the focus stage and the acquisition system, plus
//! simulated implementations for tests and the demo binary.

pub mod capabilities;
pub mod mock;

pub use capabilities::{BrightnessSource, MetricKind, SampleError, StageMotion};
