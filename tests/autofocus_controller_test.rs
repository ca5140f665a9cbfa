//! Integration tests for the scan controller
//!
//! Drives the controller through its public handle against mock hardware and
//! checks the observable sequencing: state transitions, recorded samples, the
//! final stage position and the status events.

use rust_autofocus::autofocus::{
    ControllerConfig, ControllerHandle, ControllerState, ScanController, ScanParameters,
    SessionStatus, StatusEvent,
};
use rust_autofocus::error::{AutofocusError, FailureKind};
use rust_autofocus::hardware::mock::{FocusProfile, MockBrightnessSource, MockStage};
use rust_autofocus::hardware::{MetricKind, StageMotion};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const LINEAR_FOCUS_AT_12: FocusProfile = FocusProfile::Linear {
    focus_z: 12.0,
    peak: 100.0,
    slope: 1.0,
};

struct Rig {
    stage: Arc<MockStage>,
    source: Arc<MockBrightnessSource>,
    controller: ControllerHandle,
    events: Receiver<StatusEvent>,
    task: JoinHandle<()>,
}

fn rig_with(stage: MockStage) -> Rig {
    let stage = Arc::new(stage);
    let source = Arc::new(MockBrightnessSource::new(stage.clone(), LINEAR_FOCUS_AT_12));
    let config = ControllerConfig {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let (controller, task) = ScanController::spawn(stage.clone(), source.clone(), config);
    let events = controller.subscribe();
    Rig {
        stage,
        source,
        controller,
        events,
        task,
    }
}

async fn next_event(events: &mut Receiver<StatusEvent>) -> StatusEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a status event")
        .expect("status channel closed")
}

/// Collect events up to and including the next transition into Idle.
async fn events_until_idle(events: &mut Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = matches!(
            event,
            StatusEvent::StatusChanged {
                to: ControllerState::Idle,
                ..
            }
        );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn transitions(events: &[StatusEvent]) -> Vec<(ControllerState, ControllerState)> {
    events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::StatusChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

async fn shutdown(rig: Rig) {
    assert_ok!(rig.controller.shutdown().await);
    rig.task.await.unwrap();
}

#[tokio::test]
async fn test_scan_selects_and_applies_best_focus() {
    let mut rig = rig_with(MockStage::with_position(-2.0));

    let id = assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 20.0, 5.0))
            .await
    );
    let events = events_until_idle(&mut rig.events).await;

    assert_eq!(
        transitions(&events),
        vec![
            (ControllerState::Idle, ControllerState::Scanning),
            (ControllerState::Scanning, ControllerState::Selecting),
            (ControllerState::Selecting, ControllerState::Idle),
        ]
    );

    let recorded: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::SampleRecorded { sample, .. } => Some(sample.position),
            _ => None,
        })
        .collect();
    assert_eq!(recorded, vec![0.0, 5.0, 10.0, 15.0, 20.0]);

    let completion = events
        .iter()
        .find_map(|e| match e {
            StatusEvent::ScanComplete(result) => Some(result.clone()),
            _ => None,
        })
        .expect("no completion event");
    let focus = completion.unwrap();
    assert_eq!(focus.session_id, id);
    assert_eq!(focus.best_z, 10.0);
    assert_eq!(focus.best_brightness, 98.0);
    assert!(events
        .iter()
        .any(|e| *e == StatusEvent::FocusApplied(Ok(focus))));

    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.session_id, id);
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.start_z, -2.0);
    assert_eq!(snapshot.brightness, vec![88.0, 93.0, 98.0, 97.0, 92.0]);
    assert_eq!(snapshot.focus, Some(focus));

    assert_eq!(rig.stage.position().await.unwrap(), 10.0);
    assert_eq!(
        rig.stage.commanded_targets(),
        vec![0.0, 5.0, 10.0, 15.0, 20.0, 10.0]
    );

    shutdown(rig).await;
}

#[tokio::test]
async fn test_abort_mid_scan_keeps_partial_session() {
    // 10 ms per 1 µm step
    let mut rig = rig_with(MockStage::new().with_speed(100.0));
    let params = ScanParameters::new(0.0, 50.0, 1.0);
    let all_positions = params.positions();

    assert_ok!(rig.controller.start_scan(params).await);

    let mut recorded = 0;
    while recorded < 3 {
        if let StatusEvent::SampleRecorded { .. } = next_event(&mut rig.events).await {
            recorded += 1;
        }
    }
    assert_ok!(rig.controller.abort().await);
    let events = events_until_idle(&mut rig.events).await;

    let states = transitions(&events);
    assert_eq!(
        states,
        vec![
            (ControllerState::Scanning, ControllerState::Aborting),
            (ControllerState::Aborting, ControllerState::Idle),
        ]
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, StatusEvent::ScanComplete(_))));

    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    let n = snapshot.positions.len();
    assert_eq!(snapshot.status, SessionStatus::Aborted);
    assert!(n >= 3 && n < all_positions.len(), "recorded {n} samples");
    assert_eq!(snapshot.positions, all_positions[..n].to_vec());
    assert!(snapshot.focus.is_none());

    // The in-flight move completed and nothing was commanded after it
    let targets = rig.stage.commanded_targets();
    assert_eq!(targets, snapshot.positions);
    assert_eq!(
        rig.stage.position().await.unwrap(),
        *snapshot.positions.last().unwrap()
    );
    assert_eq!(
        rig.controller.state().await.unwrap(),
        ControllerState::Idle
    );

    shutdown(rig).await;
}

#[tokio::test]
async fn test_apply_best_focus_after_abort() {
    let mut rig = rig_with(MockStage::new().with_speed(100.0));

    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 50.0, 1.0))
            .await
    );
    loop {
        if let StatusEvent::SampleRecorded { .. } = next_event(&mut rig.events).await {
            break;
        }
    }
    assert_ok!(rig.controller.abort().await);
    events_until_idle(&mut rig.events).await;

    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    // Brightness rises towards z = 12, so the last recorded sample is the best
    let expected_best = *snapshot.positions.last().unwrap();

    let focus = assert_ok!(rig.controller.apply_best_focus().await);
    assert_eq!(focus.best_z, expected_best);
    assert_eq!(focus.sample_count, snapshot.positions.len());
    assert_eq!(rig.stage.position().await.unwrap(), expected_best);

    let events = events_until_idle(&mut rig.events).await;
    assert_eq!(
        transitions(&events),
        vec![
            (ControllerState::Idle, ControllerState::Selecting),
            (ControllerState::Selecting, ControllerState::Idle),
        ]
    );
    assert!(events
        .iter()
        .any(|e| *e == StatusEvent::FocusApplied(Ok(focus))));

    shutdown(rig).await;
}

#[tokio::test]
async fn test_second_start_is_rejected_while_scanning() {
    let mut rig = rig_with(MockStage::new().with_speed(200.0));
    let params = ScanParameters::new(0.0, 10.0, 1.0);

    let first = assert_ok!(rig.controller.start_scan(params.clone()).await);
    let err = assert_err!(rig.controller.start_scan(params.clone()).await);
    assert!(matches!(err, AutofocusError::AlreadyActive(_)));

    let err = assert_err!(rig.controller.start_monitor(1, MetricKind::Mean).await);
    assert!(matches!(err, AutofocusError::AlreadyActive(_)));

    let events = events_until_idle(&mut rig.events).await;
    let rejected: Vec<&'static str> = events
        .iter()
        .filter_map(|e| match e {
            StatusEvent::CommandRejected { command, failure } => {
                assert_eq!(failure.kind, FailureKind::AlreadyActive);
                Some(*command)
            }
            _ => None,
        })
        .collect();
    assert_eq!(rejected, vec!["start_scan", "start_monitor"]);

    // The first sweep ran to completion untouched
    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.session_id, first);
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.positions, params.positions());

    shutdown(rig).await;
}

#[tokio::test]
async fn test_scan_pauses_monitor() {
    let mut rig = rig_with(MockStage::new());

    assert_ok!(rig.controller.start_monitor(1, MetricKind::Mean).await);
    loop {
        if let StatusEvent::MonitorReading(_) = next_event(&mut rig.events).await {
            break;
        }
    }

    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 20.0, 5.0).with_pause_time(0.01))
            .await
    );
    // The first step is still settling, and the monitor is already stopped
    let calls_at_start = rig.source.call_count();

    // Skip readings already queued before the scan started
    loop {
        if let StatusEvent::StatusChanged { to, .. } = next_event(&mut rig.events).await {
            assert_eq!(to, ControllerState::Scanning);
            break;
        }
    }
    let events = events_until_idle(&mut rig.events).await;

    assert!(!events
        .iter()
        .any(|e| matches!(e, StatusEvent::MonitorReading(_))));
    // One read per step, nothing from the monitor
    assert_eq!(rig.source.call_count() - calls_at_start, 5);
    assert_eq!(
        rig.controller.state().await.unwrap(),
        ControllerState::Idle
    );

    shutdown(rig).await;
}

#[tokio::test]
async fn test_monitor_start_is_idempotent_and_abortable() {
    let mut rig = rig_with(MockStage::with_position(12.0));

    assert_ok!(rig.controller.start_monitor(1, MetricKind::Mean).await);
    assert_ok!(rig.controller.start_monitor(1, MetricKind::Max).await);

    let mut events = Vec::new();
    let reading = loop {
        let event = next_event(&mut rig.events).await;
        events.push(event.clone());
        if let StatusEvent::MonitorReading(value) = event {
            break value;
        }
    };
    assert!(reading == 100.0 || reading == 125.0);

    assert_ok!(rig.controller.abort().await);
    events.extend(events_until_idle(&mut rig.events).await);

    // One Idle -> Monitoring transition despite two starts
    assert_eq!(
        transitions(&events),
        vec![
            (ControllerState::Idle, ControllerState::Monitoring),
            (ControllerState::Monitoring, ControllerState::Aborting),
            (ControllerState::Aborting, ControllerState::Idle),
        ]
    );

    shutdown(rig).await;
}

#[tokio::test]
async fn test_monitor_failure_keeps_last_reading() {
    let mut rig = rig_with(MockStage::with_position(2.0));

    assert_ok!(rig.controller.start_monitor(1, MetricKind::Mean).await);
    loop {
        if let StatusEvent::MonitorReading(_) = next_event(&mut rig.events).await {
            break;
        }
    }

    rig.source.set_active(false);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(
        rig.controller.latest_brightness().await.unwrap(),
        Some(90.0)
    );
    assert_eq!(
        rig.controller.state().await.unwrap(),
        ControllerState::Monitoring
    );

    shutdown(rig).await;
}

#[tokio::test]
async fn test_motion_failure_returns_to_idle() {
    let mut rig = rig_with(MockStage::new().fail_after(2));

    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 20.0, 5.0))
            .await
    );
    let events = events_until_idle(&mut rig.events).await;

    let failure = events
        .iter()
        .find_map(|e| match e {
            StatusEvent::ScanComplete(Err(failure)) => Some(failure.clone()),
            _ => None,
        })
        .expect("no failure event");
    assert_eq!(failure.kind, FailureKind::MotionFailed);
    assert_eq!(
        transitions(&events).last(),
        Some(&(ControllerState::Scanning, ControllerState::Idle))
    );

    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.status, SessionStatus::Failed);
    assert_eq!(snapshot.positions, vec![0.0, 5.0]);
    // No move to best focus after a failed sweep
    assert_eq!(rig.stage.commanded_targets(), vec![0.0, 5.0, 10.0]);

    shutdown(rig).await;
}

#[tokio::test]
async fn test_sweep_without_samples_reports_no_samples() {
    let mut rig = rig_with(MockStage::new());
    rig.source.set_active(false);

    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 4.0, 2.0))
            .await
    );
    let events = events_until_idle(&mut rig.events).await;

    let skipped = events
        .iter()
        .filter(|e| matches!(e, StatusEvent::SampleSkipped { .. }))
        .count();
    assert_eq!(skipped, 3);
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::ScanComplete(Err(f)) if f.kind == FailureKind::NoSamples
    )));

    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.skipped, vec![0.0, 2.0, 4.0]);
    assert!(snapshot.positions.is_empty());

    let err = assert_err!(rig.controller.apply_best_focus().await);
    assert!(matches!(err, AutofocusError::NoSamples));
    assert_eq!(rig.stage.commanded_targets(), vec![0.0, 2.0, 4.0]);

    shutdown(rig).await;
}

#[tokio::test]
async fn test_best_focus_move_failure_returns_to_idle() {
    // Five sweep moves succeed, the move to best focus is the sixth
    let mut rig = rig_with(MockStage::new().fail_after(5));

    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 20.0, 5.0))
            .await
    );
    let events = events_until_idle(&mut rig.events).await;

    let focus = events
        .iter()
        .find_map(|e| match e {
            StatusEvent::ScanComplete(Ok(focus)) => Some(*focus),
            _ => None,
        })
        .expect("sweep did not complete");
    assert_eq!(focus.best_z, 10.0);

    let failure = events
        .iter()
        .find_map(|e| match e {
            StatusEvent::FocusApplied(Err(failure)) => Some(failure.clone()),
            _ => None,
        })
        .expect("no failed apply event");
    assert_eq!(failure.kind, FailureKind::MotionFailed);
    assert_eq!(
        transitions(&events),
        vec![
            (ControllerState::Idle, ControllerState::Scanning),
            (ControllerState::Scanning, ControllerState::Selecting),
            (ControllerState::Selecting, ControllerState::Idle),
        ]
    );

    // Stage stays at the end of the sweep; the failed move is not retried
    assert_eq!(rig.stage.position().await.unwrap(), 20.0);
    assert_eq!(
        rig.stage.commanded_targets(),
        vec![0.0, 5.0, 10.0, 15.0, 20.0, 10.0]
    );
    let snapshot = rig.controller.snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.status, SessionStatus::Completed);
    assert_eq!(snapshot.focus, Some(focus));

    shutdown(rig).await;
}

#[tokio::test]
async fn test_oversized_sweep_is_rejected_and_controller_survives() {
    let mut rig = rig_with(MockStage::new());

    for params in [
        ScanParameters::new(0.0, 1e300, 1e-300),
        ScanParameters::new(-1e308, 1e308, 1.0),
    ] {
        let err = assert_err!(rig.controller.start_scan(params).await);
        assert!(matches!(err, AutofocusError::InvalidParameters(_)));
    }

    assert_eq!(
        rig.controller.state().await.unwrap(),
        ControllerState::Idle
    );
    assert!(rig.stage.commanded_targets().is_empty());
    assert_ok!(
        rig.controller
            .start_scan(ScanParameters::new(0.0, 4.0, 2.0))
            .await
    );
    let events = events_until_idle(&mut rig.events).await;
    assert!(events
        .iter()
        .any(|e| matches!(e, StatusEvent::ScanComplete(Ok(_)))));

    shutdown(rig).await;
}
