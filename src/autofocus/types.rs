//! Scan data model: parameters, samples, sessions and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{AppResult, AutofocusError};
use crate::hardware::MetricKind;

// Tolerance for deciding whether `max_z` is an exact multiple of the step.
const STEP_EPSILON: f64 = 1e-9;

/// Longest sweep accepted, in positions.
pub const MAX_SCAN_STEPS: usize = 1_000_000;

/// Immutable description of one sweep.
///
/// Built once per scan request and validated before any motion. A new scan
/// gets new parameters; there are no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    step_size: f64,
    pause_time: f64,
    min_z: f64,
    max_z: f64,
    metric: MetricKind,
    channel: u32,
}

impl ScanParameters {
    /// Sweep `[min_z, max_z]` in `step_size` µm increments, no pause, mean of channel 1
    pub fn new(min_z: f64, max_z: f64, step_size: f64) -> Self {
        Self {
            step_size,
            pause_time: 0.0,
            min_z,
            max_z,
            metric: MetricKind::Mean,
            channel: 1,
        }
    }

    /// Settle time between arriving at a step and sampling, in seconds
    pub fn with_pause_time(mut self, seconds: f64) -> Self {
        self.pause_time = seconds;
        self
    }

    /// Brightness reduction to request
    pub fn with_metric(mut self, metric: MetricKind) -> Self {
        self.metric = metric;
        self
    }

    /// Image channel to sample (1-based)
    pub fn with_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// Step size in µm
    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Settle time in seconds
    pub fn pause_time(&self) -> f64 {
        self.pause_time
    }

    /// Settle time as a `Duration` (zero if invalid)
    pub fn pause_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.pause_time).unwrap_or(Duration::ZERO)
    }

    /// Lower bound of the sweep
    pub fn min_z(&self) -> f64 {
        self.min_z
    }

    /// Upper bound of the sweep
    pub fn max_z(&self) -> f64 {
        self.max_z
    }

    /// Requested metric
    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    /// Requested channel
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Reject parameters that must never reach the stage.
    pub fn validate(&self) -> AppResult<()> {
        let finite = [self.step_size, self.pause_time, self.min_z, self.max_z]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(AutofocusError::InvalidParameters(
                "all scan values must be finite".into(),
            ));
        }
        if self.max_z <= self.min_z {
            return Err(AutofocusError::InvalidParameters(format!(
                "max_z ({}) must be greater than min_z ({})",
                self.max_z, self.min_z
            )));
        }
        if self.step_size <= 0.0 {
            return Err(AutofocusError::InvalidParameters(format!(
                "step_size ({}) must be positive",
                self.step_size
            )));
        }
        if self.pause_time < 0.0 {
            return Err(AutofocusError::InvalidParameters(format!(
                "pause_time ({}) must not be negative",
                self.pause_time
            )));
        }
        if self.channel == 0 {
            return Err(AutofocusError::InvalidParameters(
                "channel must be a positive integer".into(),
            ));
        }
        if self.step_count().is_none() {
            return Err(AutofocusError::InvalidParameters(format!(
                "range [{}, {}] with step_size {} exceeds {} positions",
                self.min_z, self.max_z, self.step_size, MAX_SCAN_STEPS
            )));
        }
        Ok(())
    }

    /// Number of positions the sweep visits.
    ///
    /// The last step is the final one not exceeding `max_z`; `max_z` itself is
    /// only visited when the span is a multiple of the step. Saturates at [`MAX_SCAN_STEPS`] for parameters that fail validation.
    pub fn total_steps(&self) -> usize {
        self.step_count().unwrap_or(MAX_SCAN_STEPS)
    }

    // `None` when the span is non-finite or longer than `MAX_SCAN_STEPS`.
    fn step_count(&self) -> Option<usize> {
        let span = ((self.max_z - self.min_z) / self.step_size + STEP_EPSILON).floor();
        if !span.is_finite() || span >= MAX_SCAN_STEPS as f64 {
            return None;
        }
        let span = span.max(0.0);
        (span as usize).checked_add(1)
    }

    /// Z of step `index`, or `None` past the end of the sweep
    pub fn position_at(&self, index: usize) -> Option<f64> {
        if index >= self.total_steps() {
            return None;
        }
        let z = self.min_z + self.step_size * index as f64;
        Some(z.min(self.max_z))
    }

    /// All sweep positions in order
    pub fn positions(&self) -> Vec<f64> {
        (0..self.total_steps())
            .filter_map(|i| self.position_at(i))
            .collect()
    }
}

/// One recorded (position, brightness, timestamp) triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    /// Stage Z at which the sample was taken
    pub position: f64,
    /// Brightness metric value
    pub brightness: f64,
    /// Time since the session started
    #[serde(with = "humantime_serde")]
    pub timestamp: Duration,
}

/// A sweep position whose brightness read failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedStep {
    /// Stage Z of the gap
    pub position: f64,
    /// Why no sample was recorded
    pub reason: String,
}

/// Lifecycle of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, no motion yet
    Pending,
    /// Sweep in progress
    Running,
    /// Sweep passed `max_z`
    Completed,
    /// Stopped early on request
    Aborted,
    /// Stopped early on a stage failure
    Failed,
}

impl SessionStatus {
    /// Whether the sweep has ended, for any reason
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Aborted => write!(f, "aborted"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Mutable state of one sweep.
///
/// Samples are append-only and ordered by time. Only the scan engine mutates a
/// session; everyone else gets a clone or a [`ScanSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ScanSession {
    id: Uuid,
    parameters: ScanParameters,
    samples: Vec<ScanSample>,
    skipped: Vec<SkippedStep>,
    status: SessionStatus,
    current_target_z: Option<f64>,
    start_z: f64,
    started_at: DateTime<Utc>,
    #[serde(skip)]
    next_index: usize,
    #[serde(skip)]
    clock: Instant,
}

impl ScanSession {
    /// New pending session for `parameters`, with the stage at `start_z`
    pub fn new(parameters: ScanParameters, start_z: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            parameters,
            samples: Vec::new(),
            skipped: Vec::new(),
            status: SessionStatus::Pending,
            current_target_z: None,
            start_z,
            started_at: Utc::now(),
            next_index: 0,
            clock: Instant::now(),
        }
    }

    /// Rebuild a completed session from a recorded `(z, brightness)` series.
    ///
    /// Timestamps are synthesised one microsecond apart to keep them ordered.
    pub fn from_series(parameters: ScanParameters, series: &[(f64, f64)]) -> Self {
        let start_z = series.first().map(|(z, _)| *z).unwrap_or(parameters.min_z);
        let mut session = Self::new(parameters, start_z);
        session.samples = series
            .iter()
            .enumerate()
            .map(|(i, &(position, brightness))| ScanSample {
                position,
                brightness,
                timestamp: Duration::from_micros(i as u64 + 1),
            })
            .collect();
        session.next_index = series.len();
        session.status = SessionStatus::Completed;
        session
    }

    /// Unique session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Parameters the session was created with
    pub fn parameters(&self) -> &ScanParameters {
        &self.parameters
    }

    /// Recorded samples in scan order
    pub fn samples(&self) -> &[ScanSample] {
        &self.samples
    }

    /// Positions whose read failed
    pub fn skipped(&self) -> &[SkippedStep] {
        &self.skipped
    }

    /// Current lifecycle status
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Last Z commanded to the stage
    pub fn current_target_z(&self) -> Option<f64> {
        self.current_target_z
    }

    /// Stage Z before the sweep began
    pub fn start_z(&self) -> f64 {
        self.start_z
    }

    /// Wall-clock start time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Index of the next step to execute
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Recorded positions
    pub fn positions(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.position).collect()
    }

    /// Recorded brightness values
    pub fn brightness(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.brightness).collect()
    }

    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    pub(crate) fn set_target(&mut self, z: f64) {
        self.current_target_z = Some(z);
    }

    pub(crate) fn advance(&mut self) {
        self.next_index += 1;
    }

    pub(crate) fn record(&mut self, position: f64, brightness: f64) -> ScanSample {
        let sample = ScanSample {
            position,
            brightness,
            timestamp: self.clock.elapsed(),
        };
        self.samples.push(sample);
        sample
    }

    pub(crate) fn record_gap(&mut self, position: f64, reason: String) {
        self.skipped.push(SkippedStep { position, reason });
    }
}

/// Best focus derived from a session. Never updated in place.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusResult {
    /// Session the result was computed from
    pub session_id: Uuid,
    /// Z of the brightest sample
    pub best_z: f64,
    /// Brightness at `best_z`
    pub best_brightness: f64,
    /// Number of samples considered
    pub sample_count: usize,
}

/// Position within a sweep, for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// 1-based index of the step just executed
    pub step: usize,
    /// Steps in the full sweep
    pub total_steps: usize,
}

/// Read-only view of a session for live plotting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSnapshot {
    /// Session id
    pub session_id: Uuid,
    /// Session status
    pub status: SessionStatus,
    /// Sampled positions
    pub positions: Vec<f64>,
    /// Brightness at each sampled position
    pub brightness: Vec<f64>,
    /// Positions recorded as gaps
    pub skipped: Vec<f64>,
    /// Last commanded Z
    pub current_target_z: Option<f64>,
    /// Stage Z before the sweep
    pub start_z: f64,
    /// Best focus, once selected
    pub focus: Option<FocusResult>,
}

impl ScanSnapshot {
    /// Capture `session` together with its focus result, if any
    pub fn capture(session: &ScanSession, focus: Option<FocusResult>) -> Self {
        Self {
            session_id: session.id(),
            status: session.status(),
            positions: session.positions(),
            brightness: session.brightness(),
            skipped: session.skipped().iter().map(|s| s.position).collect(),
            current_target_z: session.current_target_z(),
            start_z: session.start_z(),
            focus,
        }
    }
}
