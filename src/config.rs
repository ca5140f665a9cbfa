//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (every field has one)
//! 2. `config/autofocus.toml` or a file passed on the command line
//! 3. Environment variables prefixed with `RUST_AUTOFOCUS_`, nested keys
//!    separated by `__`
//!
//! # Example
//! ```no_run
//! use rust_autofocus::config::AutofocusConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AutofocusConfig::load()?;
//! config.validate()?;
//! println!("Polling every {:?}", config.monitor.poll_interval);
//! # Ok(())
//! # }
//! ```
//!
//! `RUST_AUTOFOCUS_SCAN__STEP_SIZE=0.5` overrides `scan.step_size`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::autofocus::ScanParameters;
use crate::error::{AppResult, AutofocusError};
use crate::hardware::mock::{FocusProfile, MockBrightnessSource, MockStage};
use crate::hardware::MetricKind;
use crate::logging::OutputFormat;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config/autofocus.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RUST_AUTOFOCUS_";

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MIN_STAGE_SPEED: f64 = 1e-3;
const MAX_STAGE_SPEED: f64 = 1e6;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutofocusConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Live monitor settings
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Default sweep parameters
    #[serde(default)]
    pub scan: ScanConfig,
    /// Simulated hardware used by the CLI
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: OutputFormat,
}

/// Live monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between polls, e.g. "250ms"
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Image channel to poll
    #[serde(default = "default_channel")]
    pub channel: u32,
    /// Metric to poll
    #[serde(default)]
    pub metric: MetricKind,
}

/// Default sweep parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Z increment in µm
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Settle time after each move, e.g. "100ms"
    #[serde(default, with = "humantime_serde")]
    pub pause_time: Duration,
    /// Sweep start in µm
    #[serde(default = "default_min_z")]
    pub min_z: f64,
    /// Sweep end in µm
    #[serde(default = "default_max_z")]
    pub max_z: f64,
    /// Metric recorded at each step
    #[serde(default)]
    pub metric: MetricKind,
    /// Image channel sampled at each step
    #[serde(default = "default_channel")]
    pub channel: u32,
}

/// Simulated microscope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Stage speed in µm/s; 0 moves instantly
    #[serde(default = "default_stage_speed")]
    pub stage_speed_um_per_s: f64,
    /// Stage position at startup
    #[serde(default)]
    pub start_z: f64,
    /// Plane of best focus
    #[serde(default = "default_focus_z")]
    pub focus_z: f64,
    /// Brightness at best focus
    #[serde(default = "default_peak_brightness")]
    pub peak_brightness: f64,
    /// Width (sigma) of the focus peak in µm
    #[serde(default = "default_focus_width")]
    pub focus_width: f64,
    /// Uniform noise amplitude added to each read
    #[serde(default)]
    pub sample_noise: f64,
    /// Fraction of reads that return no data
    #[serde(default)]
    pub dropout_rate: f64,
    /// RNG seed for noise and drop-outs
    #[serde(default = "default_seed")]
    pub seed: u64,
}

// Default value functions
fn default_name() -> String {
    "Rust Autofocus".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_channel() -> u32 {
    1
}

fn default_step_size() -> f64 {
    1.0
}

fn default_min_z() -> f64 {
    -25.0
}

fn default_max_z() -> f64 {
    25.0
}

fn default_stage_speed() -> f64 {
    500.0
}

fn default_focus_z() -> f64 {
    3.0
}

fn default_peak_brightness() -> f64 {
    1000.0
}

fn default_focus_width() -> f64 {
    6.0
}

fn default_seed() -> u64 {
    7
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            channel: default_channel(),
            metric: MetricKind::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            step_size: default_step_size(),
            pause_time: Duration::ZERO,
            min_z: default_min_z(),
            max_z: default_max_z(),
            metric: MetricKind::default(),
            channel: default_channel(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            stage_speed_um_per_s: default_stage_speed(),
            start_z: 0.0,
            focus_z: default_focus_z(),
            peak_brightness: default_peak_brightness(),
            focus_width: default_focus_width(),
            sample_noise: 0.0,
            dropout_rate: 0.0,
            seed: default_seed(),
        }
    }
}

impl ScanConfig {
    /// Sweep parameters described by this section
    pub fn to_parameters(&self) -> ScanParameters {
        ScanParameters::new(self.min_z, self.max_z, self.step_size)
            .with_pause_time(self.pause_time.as_secs_f64())
            .with_metric(self.metric)
            .with_channel(self.channel)
    }
}

impl SimulationConfig {
    /// Build a simulated stage and acquisition system sharing one Z position
    pub fn build_rig(&self) -> (Arc<MockStage>, Arc<MockBrightnessSource>) {
        let mut stage = MockStage::with_position(self.start_z);
        if self.stage_speed_um_per_s > 0.0 {
            stage = stage.with_speed(self.stage_speed_um_per_s);
        }
        let stage = Arc::new(stage);

        let mut source = MockBrightnessSource::new(
            stage.clone(),
            FocusProfile::Gaussian {
                focus_z: self.focus_z,
                peak: self.peak_brightness,
                sigma: self.focus_width,
                floor: self.peak_brightness * 0.1,
            },
        );
        if self.sample_noise > 0.0 {
            source = source.with_noise(self.sample_noise, self.seed);
        }
        if self.dropout_rate > 0.0 {
            source = source.with_dropout_rate(self.dropout_rate);
        }

        (stage, Arc::new(source))
    }
}

impl AutofocusConfig {
    /// Load configuration from `config/autofocus.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The layered provider stack, exposed for callers that merge more sources
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AutofocusError::ConfigValidation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let poll = self.monitor.poll_interval;
        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&poll) {
            return Err(AutofocusError::ConfigValidation(format!(
                "Invalid monitor.poll_interval {:?}. Must be between {:?} and {:?}",
                poll, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL
            )));
        }

        if self.monitor.channel == 0 {
            return Err(AutofocusError::ConfigValidation(
                "monitor.channel must be a positive integer".to_string(),
            ));
        }

        self.scan
            .to_parameters()
            .validate()
            .map_err(|e| AutofocusError::ConfigValidation(format!("[scan] {e}")))?;

        let sim = &self.simulation;
        if !(0.0..=1.0).contains(&sim.dropout_rate) {
            return Err(AutofocusError::ConfigValidation(format!(
                "Invalid simulation.dropout_rate {}. Must be 0.0-1.0",
                sim.dropout_rate
            )));
        }
        let speed = sim.stage_speed_um_per_s;
        if speed != 0.0 && !(MIN_STAGE_SPEED..=MAX_STAGE_SPEED).contains(&speed) {
            return Err(AutofocusError::ConfigValidation(format!(
                "Invalid simulation.stage_speed_um_per_s {}. Must be 0 (instant) or {}-{}",
                speed, MIN_STAGE_SPEED, MAX_STAGE_SPEED
            )));
        }
        if sim.focus_width <= 0.0 || sim.sample_noise < 0.0 {
            return Err(AutofocusError::ConfigValidation(
                "simulation.focus_width must be positive and sample_noise must not be negative"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
