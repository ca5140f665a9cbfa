//! Hardware Capabilities
//!
//! The autofocus loop only touches hardware through two narrow capability
//! traits:
//!
//! - A focus stage implements [`StageMotion`]
//! - The live acquisition system implements [`BrightnessSource`]
//!
//! Anything behind these traits (vendor SDKs, object-model lookups, timeouts)
//! is adapter policy. The control loop sees only success or an error.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Focuses on ONE thing
//!
//! Motion uses `anyhow::Result` like the other device traits. Brightness reads
//! return [`SampleError`] because the loop must tell "no frame yet" apart from
//! a broken port.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn focus_probe<S, B>(stage: &S, camera: &B) -> anyhow::Result<f64>
//! where
//!     S: StageMotion,
//!     B: BrightnessSource,
//! {
//!     stage.move_abs(12.0).await?;
//!     Ok(camera.sample(1, MetricKind::Mean).await?)
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar reduction applied to an image's pixel intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Mean pixel intensity
    #[default]
    Mean,
    /// Median pixel intensity
    Median,
    /// Maximum pixel intensity
    Max,
    /// 95th percentile of pixel intensity
    Percentile95,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Mean => write!(f, "mean"),
            MetricKind::Median => write!(f, "median"),
            MetricKind::Max => write!(f, "max"),
            MetricKind::Percentile95 => write!(f, "percentile95"),
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(MetricKind::Mean),
            "median" => Ok(MetricKind::Median),
            "max" => Ok(MetricKind::Max),
            "percentile95" | "p95" => Ok(MetricKind::Percentile95),
            _ => Err(format!(
                "Invalid metric '{}'. Must be one of: mean, median, max, percentile95",
                s
            )),
        }
    }
}

/// Why a brightness read produced no value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// Acquisition is running but no frame is available yet
    #[error("no data available yet")]
    NoData,
    /// The acquisition system is not acquiring
    #[error("acquisition not active")]
    AcquisitionInactive,
    /// Adapter or transport failure
    #[error("port error: {0}")]
    Port(String),
    /// The port returned NaN or an infinite value
    #[error("non-finite brightness reading")]
    NonFinite,
}

impl SampleError {
    /// Pass finite readings through, reject NaN and infinities.
    pub fn check_finite(value: f64) -> Result<f64, SampleError> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(SampleError::NonFinite)
        }
    }
}

/// Capability: Z Motion
///
/// A single-axis focus drive.
///
/// # Contract
/// - Positions are in micrometres
/// - `move_abs` resolves only after motion has completed (or failed)
/// - Timeouts are the adapter's business and surface as `Err`
///
/// # Thread Safety
/// - All methods take `&self`; use interior mutability for state
#[async_trait]
pub trait StageMotion: Send + Sync {
    /// Current Z position
    async fn position(&self) -> Result<f64>;

    /// Move to an absolute Z and wait for completion
    ///
    /// # Returns
    /// - Ok(()) once the stage has arrived
    /// - Err if out of range, disconnected, or timed out
    async fn move_abs(&self, z: f64) -> Result<()>;

    /// Move relative to the current position
    ///
    /// # Default Implementation
    /// Reads the position and issues an absolute move.
    async fn move_rel(&self, dz: f64) -> Result<()> {
        let current = self.position().await?;
        self.move_abs(current + dz).await
    }
}

/// Capability: Brightness Readout
///
/// Pulls one scalar brightness value from the live acquisition system.
///
/// # Contract
/// - One call performs one read; no caching on the caller's side
/// - `channel` is 1-based
#[async_trait]
pub trait BrightnessSource: Send + Sync {
    /// Read the brightness of `channel` reduced with `metric`
    async fn sample(&self, channel: u32, metric: MetricKind) -> Result<f64, SampleError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlainStage {
        position: std::sync::Mutex<f64>,
    }

    #[async_trait]
    impl StageMotion for PlainStage {
        async fn position(&self) -> Result<f64> {
            Ok(*self.position.lock().unwrap())
        }

        async fn move_abs(&self, z: f64) -> Result<()> {
            *self.position.lock().unwrap() = z;
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_relative_move_uses_absolute() {
        let stage = PlainStage {
            position: std::sync::Mutex::new(3.0),
        };

        stage.move_rel(2.5).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 5.5);

        stage.move_rel(-6.0).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), -0.5);
    }

    #[test]
    fn metric_kind_parses_case_insensitively() {
        assert_eq!("Mean".parse::<MetricKind>(), Ok(MetricKind::Mean));
        assert_eq!("MEDIAN".parse::<MetricKind>(), Ok(MetricKind::Median));
        assert_eq!("p95".parse::<MetricKind>(), Ok(MetricKind::Percentile95));
        assert!("brightest".parse::<MetricKind>().is_err());
    }

    #[test]
    fn metric_kind_serializes_snake_case() {
        let json = serde_json::to_string(&MetricKind::Percentile95).unwrap();
        assert_eq!(json, "\"percentile95\"");
    }
}
