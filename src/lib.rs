//! # Rust Autofocus
//!
//! Automated focus control for a microscope: a Z stage is swept through a
//! range while a scalar brightness metric is read from the live acquisition
//! system at each step, and the stage is then moved to the brightest position.
//!
//! ## Crate Structure
//!
//! - **`autofocus`**: the control loop. `BrightnessMonitor` (live polling),
//!   `ZScanEngine` (the sweep), `FocusSelector` (best focus) and the
//!   `ScanController` actor that sequences them.
//! - **`hardware`**: the `StageMotion` and `BrightnessSource` capability traits
//!   the loop is written against, plus mock implementations.
//! - **`config`**: Figment-based configuration (TOML file + environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `AutofocusError` enum shared by every module.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_autofocus::autofocus::{ControllerConfig, ScanController, ScanParameters};
//! use rust_autofocus::hardware::mock::{FocusProfile, MockBrightnessSource, MockStage};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let stage = Arc::new(MockStage::new());
//! let camera = Arc::new(MockBrightnessSource::new(
//!     stage.clone(),
//!     FocusProfile::Linear { focus_z: 12.0, peak: 100.0, slope: 1.0 },
//! ));
//!
//! let (controller, _task) = ScanController::spawn(stage, camera, ControllerConfig::default());
//! controller.start_scan(ScanParameters::new(0.0, 20.0, 5.0)).await?;
//! # Ok(())
//! # }
//! ```

pub mod autofocus;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
