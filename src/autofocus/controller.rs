//! ScanController - State machine sequencing monitor, sweep and selection.
//!
//! The controller runs as a single actor task. It owns the monitor, the engine,
//! the one active session and the last focus result; nothing else can touch
//! them. Callers talk to it through a cloneable [`ControllerHandle`] that sends
//! commands over an mpsc channel and awaits a oneshot reply, and they observe it
//! through a broadcast stream of [`StatusEvent`]s.
//!
//! # State Machine
//!
//! ```text
//!            start_monitor            start_scan
//! ┌──────┐ ───────────────▶ ┌────────────┐ ──────────▶ ┌──────────┐
//! │ Idle │                  │ Monitoring │             │ Scanning │
//! └──────┘ ◀─────────────── └────────────┘             └────┬─────┘
//!   ▲  ▲       stop_monitor        │ abort          abort │ │ sweep done
//!   │  │                           ▼                      │ ▼
//!   │  │                     ┌──────────┐ ◀───────────────┘ ┌───────────┐
//!   │  └──── stopped ─────── │ Aborting │                   │ Selecting │
//!   │                        └──────────┘                   └─────┬─────┘
//!   └──────────────────────── success or failure ─────────────────┘
//! ```
//!
//! `start_scan` is also accepted from `Idle`, and `apply_best_focus` runs
//! `Idle → Selecting → Idle` on a preserved (possibly aborted) session.
//!
//! # Scheduling
//!
//! One command is processed at a time. While scanning, the actor runs exactly
//! one engine step, then applies whatever commands queued up during that step,
//! then checks the abort flag before the next step. An abort therefore always
//! lets the in-flight move and read finish. While monitoring, the actor waits
//! on either the next command or the next poll slot; the poll read itself is
//! never raced against commands.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::{AbortHandle, StepOutcome, ZScanEngine};
use super::monitor::BrightnessMonitor;
use super::selector::FocusSelector;
use super::types::{
    FocusResult, ScanParameters, ScanProgress, ScanSample, ScanSession, ScanSnapshot,
    SessionStatus,
};
use crate::error::{AppResult, AutofocusError, ScanFailure};
use crate::hardware::{BrightnessSource, MetricKind, StageMotion};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No activity
    Idle,
    /// Live brightness polling
    Monitoring,
    /// Z sweep in progress
    Scanning,
    /// Choosing and applying best focus
    Selecting,
    /// Stopping at the next safe checkpoint
    Aborting,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Monitoring => write!(f, "monitoring"),
            ControllerState::Scanning => write!(f, "scanning"),
            ControllerState::Selecting => write!(f, "selecting"),
            ControllerState::Aborting => write!(f, "aborting"),
        }
    }
}

/// Notifications published by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusEvent {
    /// A state transition happened
    StatusChanged {
        /// Previous state
        from: ControllerState,
        /// New state
        to: ControllerState,
    },
    /// A sweep step recorded a sample
    SampleRecorded {
        /// The sample
        sample: ScanSample,
        /// Position within the sweep
        progress: ScanProgress,
    },
    /// A sweep step's read failed; the position is a gap
    SampleSkipped {
        /// Z of the gap
        position: f64,
        /// Read failure
        reason: String,
        /// Position within the sweep
        progress: ScanProgress,
    },
    /// The sweep ended, with its focus result or the reason it has none
    ScanComplete(Result<FocusResult, ScanFailure>),
    /// Outcome of a move to best focus
    FocusApplied(Result<FocusResult, ScanFailure>),
    /// Fresh live-monitor reading
    MonitorReading(f64),
    /// A command was refused or failed before changing state
    CommandRejected {
        /// Command name
        command: &'static str,
        /// Why
        failure: ScanFailure,
    },
}

/// Commands accepted by the controller actor.
///
/// Each variant carries a oneshot sender for the reply. Use the
/// [`ControllerHandle`] methods rather than building these by hand.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Begin (or retarget) live monitoring
    StartMonitor {
        /// Image channel
        channel: u32,
        /// Metric to poll
        metric: MetricKind,
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    /// End live monitoring
    StopMonitor {
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    /// Start a new sweep; replies with the session id
    StartScan {
        /// Sweep parameters
        parameters: ScanParameters,
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<Uuid>>,
    },
    /// Stop monitoring or sweeping at the next checkpoint
    Abort {
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    /// Move to the best focus of the preserved session
    ApplyBestFocus {
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<FocusResult>>,
    },
    /// Drop the preserved session and its result
    ClearSession {
        /// Reply channel
        respond_to: oneshot::Sender<AppResult<()>>,
    },
    /// Query the current state
    State {
        /// Reply channel
        respond_to: oneshot::Sender<ControllerState>,
    },
    /// Query a read-only view of the session
    Snapshot {
        /// Reply channel
        respond_to: oneshot::Sender<Option<ScanSnapshot>>,
    },
    /// Query the monitor's last good reading
    LatestBrightness {
        /// Reply channel
        respond_to: oneshot::Sender<Option<f64>>,
    },
    /// Stop the actor
    Shutdown {
        /// Reply channel
        respond_to: oneshot::Sender<()>,
    },
}

impl ControllerCommand {
    fn name(&self) -> &'static str {
        match self {
            ControllerCommand::StartMonitor { .. } => "start_monitor",
            ControllerCommand::StopMonitor { .. } => "stop_monitor",
            ControllerCommand::StartScan { .. } => "start_scan",
            ControllerCommand::Abort { .. } => "abort",
            ControllerCommand::ApplyBestFocus { .. } => "apply_best_focus",
            ControllerCommand::ClearSession { .. } => "clear_session",
            ControllerCommand::State { .. } => "state",
            ControllerCommand::Snapshot { .. } => "snapshot",
            ControllerCommand::LatestBrightness { .. } => "latest_brightness",
            ControllerCommand::Shutdown { .. } => "shutdown",
        }
    }
}

/// Tunables for the controller actor.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Live monitor cadence
    pub poll_interval: Duration,
    /// Command queue depth
    pub command_capacity: usize,
    /// Event buffer per subscriber
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            command_capacity: 32,
            event_capacity: 256,
        }
    }
}

/// Cloneable front end to a running [`ScanController`].
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControllerCommand>,
    events: broadcast::Sender<StatusEvent>,
}

impl ControllerHandle {
    /// Subscribe to status events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| AutofocusError::ControllerClosed)?;
        rx.await.map_err(|_| AutofocusError::ControllerClosed)
    }

    /// Start live monitoring, or switch channel/metric if already monitoring
    pub async fn start_monitor(&self, channel: u32, metric: MetricKind) -> AppResult<()> {
        self.request(|respond_to| ControllerCommand::StartMonitor {
            channel,
            metric,
            respond_to,
        })
        .await?
    }

    /// Stop live monitoring
    pub async fn stop_monitor(&self) -> AppResult<()> {
        self.request(|respond_to| ControllerCommand::StopMonitor { respond_to })
            .await?
    }

    /// Start a sweep; returns the new session id
    pub async fn start_scan(&self, parameters: ScanParameters) -> AppResult<Uuid> {
        self.request(|respond_to| ControllerCommand::StartScan {
            parameters,
            respond_to,
        })
        .await?
    }

    /// Request an abort at the next checkpoint
    pub async fn abort(&self) -> AppResult<()> {
        self.request(|respond_to| ControllerCommand::Abort { respond_to })
            .await?
    }

    /// Select and move to best focus of the preserved session
    pub async fn apply_best_focus(&self) -> AppResult<FocusResult> {
        self.request(|respond_to| ControllerCommand::ApplyBestFocus { respond_to })
            .await?
    }

    /// Forget the preserved session
    pub async fn clear_session(&self) -> AppResult<()> {
        self.request(|respond_to| ControllerCommand::ClearSession { respond_to })
            .await?
    }

    /// Current controller state
    pub async fn state(&self) -> AppResult<ControllerState> {
        self.request(|respond_to| ControllerCommand::State { respond_to })
            .await
    }

    /// Read-only view of the current or preserved session
    pub async fn snapshot(&self) -> AppResult<Option<ScanSnapshot>> {
        self.request(|respond_to| ControllerCommand::Snapshot { respond_to })
            .await
    }

    /// Last good live-monitor reading
    pub async fn latest_brightness(&self) -> AppResult<Option<f64>> {
        self.request(|respond_to| ControllerCommand::LatestBrightness { respond_to })
            .await
    }

    /// Stop the controller task; an active sweep is aborted first
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|respond_to| ControllerCommand::Shutdown { respond_to })
            .await
    }
}

/// The autofocus state machine.
pub struct ScanController {
    state: ControllerState,
    commands: mpsc::Receiver<ControllerCommand>,
    events: broadcast::Sender<StatusEvent>,
    monitor: BrightnessMonitor,
    engine: ZScanEngine,
    selector: FocusSelector,
    session: Option<ScanSession>,
    focus: Option<FocusResult>,
    abort: AbortHandle,
}

impl ScanController {
    /// Build a controller around the given hardware and return its handle.
    ///
    /// The controller does nothing until [`ScanController::run`] is awaited;
    /// [`ScanController::spawn`] does both.
    pub fn new(
        stage: Arc<dyn StageMotion>,
        source: Arc<dyn BrightnessSource>,
        config: ControllerConfig,
    ) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let controller = Self {
            state: ControllerState::Idle,
            commands: command_rx,
            events: event_tx.clone(),
            monitor: BrightnessMonitor::new(source.clone(), config.poll_interval),
            engine: ZScanEngine::new(stage.clone(), source),
            selector: FocusSelector::new(stage),
            session: None,
            focus: None,
            abort: AbortHandle::new(),
        };
        let handle = ControllerHandle {
            commands: command_tx,
            events: event_tx,
        };
        (controller, handle)
    }

    /// Build a controller and run it on a tokio task.
    pub fn spawn(
        stage: Arc<dyn StageMotion>,
        source: Arc<dyn BrightnessSource>,
        config: ControllerConfig,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(stage, source, config);
        let task = tokio::spawn(controller.run());
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("Scan controller started");
        loop {
            let keep_running = match self.state {
                ControllerState::Scanning => self.scan_checkpoint().await,
                ControllerState::Aborting => {
                    self.finish_abort();
                    true
                }
                ControllerState::Monitoring => {
                    tokio::select! {
                        command = self.commands.recv() => match command {
                            Some(command) => self.handle(command).await,
                            None => false,
                        },
                        _ = self.monitor.due() => {
                            if let Some(value) = self.monitor.poll_once().await {
                                self.emit(StatusEvent::MonitorReading(value));
                            }
                            true
                        }
                    }
                }
                ControllerState::Idle | ControllerState::Selecting => {
                    match self.commands.recv().await {
                        Some(command) => self.handle(command).await,
                        None => false,
                    }
                }
            };
            if !keep_running {
                break;
            }
        }
        self.monitor.stop();
        if let Some(session) = self.session.as_mut() {
            self.engine.abort(session);
        }
        info!("Scan controller stopped");
    }

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&mut self, to: ControllerState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, "Controller state changed");
        self.emit(StatusEvent::StatusChanged { from, to });
    }

    fn reject<T>(&self, command: &'static str, err: AutofocusError) -> AppResult<T> {
        warn!(command, state = %self.state, error = %err, "Command rejected");
        self.emit(StatusEvent::CommandRejected {
            command,
            failure: ScanFailure::from(&err),
        });
        Err(err)
    }

    fn invalid_state(&self, command: &'static str) -> AutofocusError {
        AutofocusError::InvalidState {
            command: command.to_string(),
            state: self.state.to_string(),
        }
    }

    /// Apply one command. Returns `false` when the actor should stop.
    async fn handle(&mut self, command: ControllerCommand) -> bool {
        let name = command.name();
        debug!(command = name, state = %self.state, "Handling command");

        match command {
            ControllerCommand::StartMonitor {
                channel,
                metric,
                respond_to,
            } => {
                let result = self.start_monitor(name, channel, metric);
                let _ = respond_to.send(result);
            }
            ControllerCommand::StopMonitor { respond_to } => {
                let result = match self.state {
                    ControllerState::Monitoring => {
                        self.monitor.stop();
                        self.transition(ControllerState::Idle);
                        Ok(())
                    }
                    ControllerState::Idle => Ok(()),
                    _ => self.reject(name, self.invalid_state(name)),
                };
                let _ = respond_to.send(result);
            }
            ControllerCommand::StartScan {
                parameters,
                respond_to,
            } => {
                let result = self.start_scan(name, parameters).await;
                let _ = respond_to.send(result);
            }
            ControllerCommand::Abort { respond_to } => {
                let result = match self.state {
                    ControllerState::Monitoring | ControllerState::Scanning => {
                        info!(state = %self.state, "Abort requested");
                        self.abort.request();
                        self.transition(ControllerState::Aborting);
                        Ok(())
                    }
                    _ => self.reject(name, self.invalid_state(name)),
                };
                let _ = respond_to.send(result);
            }
            ControllerCommand::ApplyBestFocus { respond_to } => {
                let result = if self.state == ControllerState::Idle && self.session.is_some() {
                    self.select_and_apply(false).await
                } else {
                    self.reject(name, self.invalid_state(name))
                };
                let _ = respond_to.send(result);
            }
            ControllerCommand::ClearSession { respond_to } => {
                let result = match self.state {
                    ControllerState::Idle | ControllerState::Monitoring => {
                        if let Some(session) = self.session.take() {
                            info!(session_id = %session.id(), "Session cleared");
                        }
                        self.focus = None;
                        Ok(())
                    }
                    _ => self.reject(name, self.invalid_state(name)),
                };
                let _ = respond_to.send(result);
            }
            ControllerCommand::State { respond_to } => {
                let _ = respond_to.send(self.state);
            }
            ControllerCommand::Snapshot { respond_to } => {
                let snapshot = self
                    .session
                    .as_ref()
                    .map(|s| ScanSnapshot::capture(s, self.focus));
                let _ = respond_to.send(snapshot);
            }
            ControllerCommand::LatestBrightness { respond_to } => {
                let _ = respond_to.send(self.monitor.latest());
            }
            ControllerCommand::Shutdown { respond_to } => {
                info!(state = %self.state, "Shutdown requested");
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    fn start_monitor(
        &mut self,
        name: &'static str,
        channel: u32,
        metric: MetricKind,
    ) -> AppResult<()> {
        match self.state {
            ControllerState::Idle | ControllerState::Monitoring => {
                if channel == 0 {
                    return self.reject(
                        name,
                        AutofocusError::InvalidParameters(
                            "channel must be a positive integer".into(),
                        ),
                    );
                }
                self.monitor.start(channel, metric);
                self.transition(ControllerState::Monitoring);
                Ok(())
            }
            ControllerState::Scanning | ControllerState::Selecting => {
                self.reject(name, AutofocusError::AlreadyActive(self.state.to_string()))
            }
            ControllerState::Aborting => self.reject(name, self.invalid_state(name)),
        }
    }

    async fn start_scan(
        &mut self,
        name: &'static str,
        parameters: ScanParameters,
    ) -> AppResult<Uuid> {
        match self.state {
            ControllerState::Idle | ControllerState::Monitoring => {}
            ControllerState::Scanning | ControllerState::Selecting => {
                return self.reject(name, AutofocusError::AlreadyActive(self.state.to_string()));
            }
            ControllerState::Aborting => return self.reject(name, self.invalid_state(name)),
        }

        if let Err(err) = parameters.validate() {
            return self.reject(name, err);
        }

        // Two readers on the acquisition system would race; pause live polling.
        if self.monitor.is_running() {
            self.monitor.stop();
        }

        match self.engine.begin(parameters).await {
            Ok(session) => {
                let id = session.id();
                self.session = Some(session);
                self.focus = None;
                self.abort = AbortHandle::new();
                self.transition(ControllerState::Scanning);
                Ok(id)
            }
            Err(err) => {
                self.transition(ControllerState::Idle);
                self.reject(name, err)
            }
        }
    }

    /// One scheduling slot while scanning: queued commands, abort check, one step.
    async fn scan_checkpoint(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => {
                    if !self.handle(command).await {
                        return false;
                    }
                    // Anything queued behind a transition waits for it to finish
                    if self.state != ControllerState::Scanning {
                        return true;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if self.abort.is_requested() {
            self.transition(ControllerState::Aborting);
            return true;
        }

        self.run_step().await;
        true
    }

    async fn run_step(&mut self) {
        let Some(mut session) = self.session.take() else {
            error!("Scanning without a session");
            self.transition(ControllerState::Idle);
            return;
        };

        let outcome = self.engine.step(&mut session).await;
        let status = session.status();
        self.session = Some(session);

        match outcome {
            Ok(StepOutcome::Sampled { sample, progress }) => {
                self.emit(StatusEvent::SampleRecorded { sample, progress });
            }
            Ok(StepOutcome::Skipped {
                position,
                reason,
                progress,
            }) => {
                self.emit(StatusEvent::SampleSkipped {
                    position,
                    reason: reason.to_string(),
                    progress,
                });
            }
            Ok(StepOutcome::Finished) => {}
            Err(err) => {
                error!(error = %err, "Z sweep failed");
                self.emit(StatusEvent::ScanComplete(Err(ScanFailure::from(&err))));
                self.transition(ControllerState::Idle);
                return;
            }
        }

        if status == SessionStatus::Completed {
            let _ = self.select_and_apply(true).await;
        }
    }

    /// Selecting: pick best focus, move there, return to Idle.
    ///
    /// `after_scan` publishes the selection as the sweep's completion event.
    async fn select_and_apply(&mut self, after_scan: bool) -> AppResult<FocusResult> {
        self.transition(ControllerState::Selecting);

        let selected = match (self.focus, self.session.as_ref()) {
            (Some(focus), Some(session)) if focus.session_id == session.id() => Ok(focus),
            (_, Some(session)) => FocusSelector::select(session),
            (_, None) => Err(AutofocusError::NoSamples),
        };

        let result = match selected {
            Ok(focus) => {
                self.focus = Some(focus);
                if after_scan {
                    info!(
                        best_z = focus.best_z,
                        brightness = focus.best_brightness,
                        samples = focus.sample_count,
                        "Best focus selected"
                    );
                    self.emit(StatusEvent::ScanComplete(Ok(focus)));
                }
                let applied = self.selector.apply_best(&focus).await.map(|()| focus);
                self.emit(StatusEvent::FocusApplied(
                    applied.as_ref().copied().map_err(ScanFailure::from),
                ));
                applied
            }
            Err(err) => {
                warn!(error = %err, "Best focus selection failed");
                let failure = ScanFailure::from(&err);
                if after_scan {
                    self.emit(StatusEvent::ScanComplete(Err(failure)));
                } else {
                    self.emit(StatusEvent::FocusApplied(Err(failure)));
                }
                Err(err)
            }
        };

        self.transition(ControllerState::Idle);
        result
    }

    fn finish_abort(&mut self) {
        self.monitor.stop();
        if let Some(session) = self.session.as_mut() {
            self.engine.abort(session);
        }
        self.transition(ControllerState::Idle);
    }
}
