//! Best-focus selection.

use std::sync::Arc;
use tracing::{info, warn};

use super::types::{FocusResult, ScanSession};
use crate::error::{AppResult, AutofocusError};
use crate::hardware::StageMotion;

/// Picks the brightest recorded position and moves the stage there.
pub struct FocusSelector {
    stage: Arc<dyn StageMotion>,
}

impl FocusSelector {
    /// Create a selector driving `stage`
    pub fn new(stage: Arc<dyn StageMotion>) -> Self {
        Self { stage }
    }

    /// Brightest sample of `session`.
    ///
    /// Ties go to the earliest sample in scan order. The result is always one
    /// of the recorded positions, never an interpolation. Non-finite readings
    /// are never chosen.
    pub fn select(session: &ScanSession) -> AppResult<FocusResult> {
        let samples = session.samples();
        let mut finite = samples.iter().filter(|s| s.brightness.is_finite());
        let mut best = finite.next().ok_or(AutofocusError::NoSamples)?;
        for sample in finite {
            if sample.brightness > best.brightness {
                best = sample;
            }
        }

        Ok(FocusResult {
            session_id: session.id(),
            best_z: best.position,
            best_brightness: best.brightness,
            sample_count: samples.len(),
        })
    }

    /// Move the stage to `result.best_z`.
    ///
    /// A failed move is reported as-is; there is no retry and no attempt to
    /// restore an earlier position.
    pub async fn apply_best(&self, result: &FocusResult) -> AppResult<()> {
        match self.stage.move_abs(result.best_z).await {
            Ok(()) => {
                info!(
                    session_id = %result.session_id,
                    z = result.best_z,
                    brightness = result.best_brightness,
                    "Moved to best focus"
                );
                Ok(())
            }
            Err(e) => {
                let err =
                    AutofocusError::motion(&format!("move to best focus {:.3}", result.best_z), e);
                warn!(session_id = %result.session_id, error = %err, "Best focus move failed");
                Err(err)
            }
        }
    }
}
