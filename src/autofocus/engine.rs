//! Z sweep execution.
//!
//! [`ZScanEngine`] walks the stage from `min_z` to `max_z` one step at a time:
//!
//! ```text
//! for each target in min_z, min_z + step, ... (<= max_z)
//!     move_abs(target)   -- wait for completion
//!     sleep(pause_time)  -- let the image settle
//!     sample(channel, metric)
//!     record sample, or record a gap on a failed read
//! ```
//!
//! Steps are never pipelined: a sample is only requested after the move that
//! precedes it has resolved. A failed read is a gap, not a failure. A failed
//! move ends the sweep.
//!
//! The engine is step-driven so an owner (the scan controller) can look at its
//! command queue between steps. [`ZScanEngine::run`] drives a whole sweep for
//! callers that only need an abort flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::types::{ScanParameters, ScanProgress, ScanSample, ScanSession, SessionStatus};
use crate::error::{AppResult, AutofocusError};
use crate::hardware::{BrightnessSource, SampleError, StageMotion};

/// Result of a single engine step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Moved, settled and recorded a sample
    Sampled {
        /// The new sample
        sample: ScanSample,
        /// Position within the sweep
        progress: ScanProgress,
    },
    /// Moved and settled, but the read failed; recorded as a gap
    Skipped {
        /// Z of the gap
        position: f64,
        /// Why the read failed
        reason: SampleError,
        /// Position within the sweep
        progress: ScanProgress,
    },
    /// Nothing left to do; the session is terminal
    Finished,
}

/// Shared abort flag, checked before every step.
///
/// Requesting an abort never interrupts a move or read in flight; the sweep
/// stops before the next one starts.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Create a cleared flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweep to stop at the next checkpoint
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort has been requested
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes Z sweeps against injected hardware.
pub struct ZScanEngine {
    stage: Arc<dyn StageMotion>,
    source: Arc<dyn BrightnessSource>,
}

impl ZScanEngine {
    /// Create an engine for the given stage and acquisition system
    pub fn new(stage: Arc<dyn StageMotion>, source: Arc<dyn BrightnessSource>) -> Self {
        Self { stage, source }
    }

    /// Validate `parameters` and open a running session.
    ///
    /// Records the stage position as the session's start position. No motion
    /// happens here; invalid parameters never reach the stage.
    pub async fn begin(&self, parameters: ScanParameters) -> AppResult<ScanSession> {
        parameters.validate()?;

        let start_z = self
            .stage
            .position()
            .await
            .map_err(|e| AutofocusError::motion("read start position", e))?;

        let mut session = ScanSession::new(parameters, start_z);
        session.set_status(SessionStatus::Running);
        info!(
            session_id = %session.id(),
            start_z,
            min_z = session.parameters().min_z(),
            max_z = session.parameters().max_z(),
            step = session.parameters().step_size(),
            steps = session.parameters().total_steps(),
            "Z sweep started"
        );
        Ok(session)
    }

    /// Execute the next step of `session`.
    ///
    /// Marks the session `Completed` after its last step and `Failed` if the
    /// move fails. On a motion failure the error is returned and no sample is
    /// requested for that step.
    pub async fn step(&self, session: &mut ScanSession) -> AppResult<StepOutcome> {
        if session.status().is_terminal() {
            return Ok(StepOutcome::Finished);
        }

        let params = session.parameters().clone();
        let index = session.next_index();
        let Some(target) = params.position_at(index) else {
            session.set_status(SessionStatus::Completed);
            return Ok(StepOutcome::Finished);
        };
        let progress = ScanProgress {
            step: index + 1,
            total_steps: params.total_steps(),
        };

        session.set_target(target);
        if let Err(e) = self.stage.move_abs(target).await {
            session.set_status(SessionStatus::Failed);
            let err = AutofocusError::motion(&format!("move to {target:.3}"), e);
            warn!(session_id = %session.id(), z = target, error = %err, "Z sweep aborted by stage failure");
            return Err(err);
        }

        let pause = params.pause_duration();
        if !pause.is_zero() {
            sleep(pause).await;
        }

        let read = self
            .source
            .sample(params.channel(), params.metric())
            .await
            .and_then(SampleError::check_finite);
        session.advance();
        if session.next_index() >= params.total_steps() {
            session.set_status(SessionStatus::Completed);
        }

        match read {
            Ok(brightness) => {
                let sample = session.record(target, brightness);
                debug!(
                    session_id = %session.id(),
                    z = target,
                    brightness,
                    step = progress.step,
                    of = progress.total_steps,
                    "Sample recorded"
                );
                Ok(StepOutcome::Sampled { sample, progress })
            }
            Err(reason) => {
                warn!(session_id = %session.id(), z = target, error = %reason, "Sample unavailable, skipping position");
                session.record_gap(target, reason.to_string());
                Ok(StepOutcome::Skipped {
                    position: target,
                    reason,
                    progress,
                })
            }
        }
    }

    /// Mark `session` aborted unless it has already ended.
    pub fn abort(&self, session: &mut ScanSession) {
        if !session.status().is_terminal() {
            info!(
                session_id = %session.id(),
                samples = session.samples().len(),
                "Z sweep aborted"
            );
            session.set_status(SessionStatus::Aborted);
        }
    }

    /// Run a whole sweep, checking `abort` before every step.
    pub async fn run(
        &self,
        parameters: ScanParameters,
        abort: &AbortHandle,
    ) -> AppResult<ScanSession> {
        let mut session = self.begin(parameters).await?;
        loop {
            if abort.is_requested() {
                self.abort(&mut session);
                break;
            }
            if self.step(&mut session).await? == StepOutcome::Finished
                || session.status().is_terminal()
            {
                break;
            }
        }
        info!(
            session_id = %session.id(),
            status = %session.status(),
            samples = session.samples().len(),
            gaps = session.skipped().len(),
            "Z sweep ended"
        );
        Ok(session)
    }
}
