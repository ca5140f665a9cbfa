//! Mock Hardware Implementations
//!
//! Provides simulated hardware for running the autofocus loop without a
//! microscope. All mock devices use async-safe operations (tokio::time::sleep,
//! not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockStage` - Simulated Z drive with optional speed, travel limits and
//!   failure injection
//! - `MockBrightnessSource` - Brightness that peaks at a chosen focus plane,
//!   read from the stage's current position
//!
//! # Performance Characteristics
//!
//! - MockStage: instantaneous by default, or `distance / speed` with `with_speed`
//! - MockBrightnessSource: no delay

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::hardware::capabilities::{BrightnessSource, MetricKind, SampleError, StageMotion};

// =============================================================================
// MockStage - Simulated Z Drive
// =============================================================================

/// Mock focus drive
///
/// Simulates a Z stage with:
/// - Optional motion speed in µm/sec (instant when unset)
/// - Optional hard-stop travel limits
/// - Failure injection after N successful moves
/// - A log of every commanded target
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new().with_limits(-50.0, 50.0);
/// stage.move_abs(10.0).await?;
/// assert_eq!(stage.position().await?, 10.0);
/// ```
pub struct MockStage {
    position: Arc<RwLock<f64>>,
    speed_um_per_sec: Option<f64>,
    limits: Option<(f64, f64)>,
    fail_after: Option<usize>,
    moves: AtomicUsize,
    targets: Mutex<Vec<f64>>,
}

impl MockStage {
    /// Create new mock stage at Z = 0 µm
    pub fn new() -> Self {
        Self::with_position(0.0)
    }

    /// Create new mock stage at the given Z
    pub fn with_position(initial_position: f64) -> Self {
        Self {
            position: Arc::new(RwLock::new(initial_position)),
            speed_um_per_sec: None,
            limits: None,
            fail_after: None,
            moves: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
        }
    }

    /// Simulate travel time at `speed_um_per_sec`
    pub fn with_speed(mut self, speed_um_per_sec: f64) -> Self {
        self.speed_um_per_sec = Some(speed_um_per_sec);
        self
    }

    /// Reject targets outside `[min, max]`
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    /// Fail every move after the first `count` successful ones
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Every target passed to `move_abs`, in order, including rejected ones
    pub fn commanded_targets(&self) -> Vec<f64> {
        self.targets
            .lock()
            .map(|targets| targets.clone())
            .unwrap_or_default()
    }

    /// Number of completed moves
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    fn record_target(&self, target: f64) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.push(target);
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageMotion for MockStage {
    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        self.record_target(target);

        if let Some(limit) = self.fail_after {
            if self.moves.load(Ordering::SeqCst) >= limit {
                return Err(anyhow!("MockStage: injected failure moving to {:.3}µm", target));
            }
        }

        if let Some((min, max)) = self.limits {
            if target < min || target > max {
                return Err(anyhow!(
                    "MockStage: {:.3}µm exceeds limits [{:.3}, {:.3}]µm",
                    target,
                    min,
                    max
                ));
            }
        }

        let current = *self.position.read().await;
        if let Some(speed) = self.speed_um_per_sec {
            let travel = (target - current).abs() / speed;
            let delay = Duration::try_from_secs_f64(travel).map_err(|e| {
                anyhow!(
                    "MockStage: cannot travel {:.3}µm at {}µm/s: {}",
                    (target - current).abs(),
                    speed,
                    e
                )
            })?;
            tracing::trace!(from = current, to = target, ?delay, "MockStage moving");
            sleep(delay).await;
        }

        *self.position.write().await = target;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockBrightnessSource - Simulated Acquisition System
// =============================================================================

/// Brightness as a function of stage Z
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FocusProfile {
    /// `peak - slope * |z - focus_z|`
    Linear {
        /// Plane of best focus
        focus_z: f64,
        /// Brightness at `focus_z`
        peak: f64,
        /// Brightness lost per µm of defocus
        slope: f64,
    },
    /// `floor + (peak - floor) * exp(-(z - focus_z)² / 2σ²)`
    Gaussian {
        /// Plane of best focus
        focus_z: f64,
        /// Brightness at `focus_z`
        peak: f64,
        /// Width of the focus peak in µm
        sigma: f64,
        /// Brightness far from focus
        floor: f64,
    },
}

impl FocusProfile {
    /// Noise-free brightness at `z`
    pub fn brightness_at(&self, z: f64) -> f64 {
        match *self {
            FocusProfile::Linear {
                focus_z,
                peak,
                slope,
            } => peak - slope * (z - focus_z).abs(),
            FocusProfile::Gaussian {
                focus_z,
                peak,
                sigma,
                floor,
            } => {
                let d = z - focus_z;
                floor + (peak - floor) * (-(d * d) / (2.0 * sigma * sigma)).exp()
            }
        }
    }
}

// Relative gain per metric; order-preserving so the brightest Z is unchanged.
fn metric_gain(metric: MetricKind) -> f64 {
    match metric {
        MetricKind::Mean | MetricKind::Median => 1.0,
        MetricKind::Percentile95 => 1.1,
        MetricKind::Max => 1.25,
    }
}

/// Mock acquisition system
///
/// Reads the stage position on every call and returns the profile's
/// brightness there. Supports:
/// - Uniform noise (seeded, reproducible)
/// - Drop-outs at chosen call indices or at a random rate (`NoData`)
/// - Switching acquisition off (`AcquisitionInactive`)
pub struct MockBrightnessSource {
    stage: Arc<dyn StageMotion>,
    profile: FocusProfile,
    noise: f64,
    dropout_rate: f64,
    dropout_calls: HashSet<usize>,
    rng: Mutex<StdRng>,
    active: AtomicBool,
    calls: AtomicUsize,
}

impl MockBrightnessSource {
    /// Create a source that follows `stage` through `profile`
    pub fn new(stage: Arc<dyn StageMotion>, profile: FocusProfile) -> Self {
        Self {
            stage,
            profile,
            noise: 0.0,
            dropout_rate: 0.0,
            dropout_calls: HashSet::new(),
            rng: Mutex::new(StdRng::seed_from_u64(0x5EED)),
            active: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    /// Add uniform noise in `[-amplitude, amplitude]`
    pub fn with_noise(mut self, amplitude: f64, seed: u64) -> Self {
        self.noise = amplitude.abs();
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Return `NoData` on the given zero-based call indices
    pub fn with_dropouts(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.dropout_calls.extend(calls);
        self
    }

    /// Return `NoData` on a random fraction of calls
    pub fn with_dropout_rate(mut self, rate: f64) -> Self {
        self.dropout_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Turn acquisition on or off
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Number of `sample` calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrightnessSource for MockBrightnessSource {
    async fn sample(&self, channel: u32, metric: MetricKind) -> Result<f64, SampleError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.active.load(Ordering::SeqCst) {
            return Err(SampleError::AcquisitionInactive);
        }
        if channel == 0 {
            return Err(SampleError::Port(format!("no such channel {channel}")));
        }
        if self.dropout_calls.contains(&call) {
            return Err(SampleError::NoData);
        }

        let z = self
            .stage
            .position()
            .await
            .map_err(|e| SampleError::Port(format!("stage position unavailable: {e}")))?;

        let (dropped, jitter) = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| SampleError::Port("rng poisoned".into()))?;
            let dropped = self.dropout_rate > 0.0 && rng.gen_bool(self.dropout_rate);
            let jitter = if self.noise > 0.0 {
                rng.gen_range(-self.noise..=self.noise)
            } else {
                0.0
            };
            (dropped, jitter)
        };
        if dropped {
            return Err(SampleError::NoData);
        }

        Ok(self.profile.brightness_at(z) * metric_gain(metric) + jitter)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
