//! ---
//! iocman_section: "01-core-functionality"
//! iocman_subsection: "module"
//! iocman_type: "source"
//! iocman_scope: "code"
//! iocman_description: "Fleet supervision, reconciliation and heartbeat sweep."
//! iocman_version: "v0.0.0-prealpha"
//! iocman_owner: "tbd"
//! ---
mod support;

use std::time::Duration;

use iocman_bus::{AlarmSeverity, PointValue};
use iocman_control::{DaemonFault, ProcessState};
use iocman_core::{
    Command, EngineError, RegistryError, TransitionFault, TransitionOutcome, WorkerControlState,
};
use support::{Harness, Op};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn run_brings_worker_up_on_both_sides() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness.engine.publish_all().await;

    let outcome = harness
        .engine
        .submit("magnet1", Command::Run)
        .expect("known worker")
        .outcome()
        .await
        .expect("engine running");

    assert_eq!(outcome, TransitionOutcome::Completed(WorkerControlState::Running));
    assert_eq!(harness.engine.state("magnet1").unwrap(), WorkerControlState::Running);
    assert_eq!(harness.control.process("magnet1"), Some(ProcessState::Running));

    let control = harness.point("magnet1_control").expect("control point");
    assert_eq!(control.value, PointValue::Int(1));
    assert_eq!(control.severity, AlarmSeverity::NoAlarm);
    let state = harness.point("magnet1_state").expect("state point");
    assert_eq!(state.value, PointValue::Text("Running".into()));
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn run_on_running_worker_is_absorbed() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness.control.set_process("magnet1", ProcessState::Running);

    let outcome = harness
        .engine
        .submit("magnet1", Command::Run)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome, TransitionOutcome::Completed(WorkerControlState::Running));
    assert_eq!(harness.control.transitions_for("magnet1"), vec![Op::Start]);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let harness = Harness::new(&[("magnet1", true)]);

    for _ in 0..2 {
        let outcome = harness
            .engine
            .submit("magnet1", Command::Stop)
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Completed(WorkerControlState::Stopped));
    }
    assert_eq!(harness.engine.state("magnet1").unwrap(), WorkerControlState::Stopped);
    assert_eq!(harness.control.transitions_for("magnet1"), vec![Op::Stop, Op::Stop]);
    let control = harness.point("magnet1_control").unwrap();
    assert_eq!(control.value, PointValue::Int(0));
    assert_eq!(control.severity, AlarmSeverity::Minor);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reset_stops_settles_then_starts() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness.control.set_process("magnet1", ProcessState::Running);

    let began = Instant::now();
    let outcome = harness
        .engine
        .submit("magnet1", Command::Reset)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome, TransitionOutcome::Completed(WorkerControlState::Running));
    assert!(began.elapsed() >= Duration::from_secs(1));
    assert_eq!(
        harness.control.transitions_for("magnet1"),
        vec![Op::Stop, Op::Start]
    );
    assert_eq!(harness.control.process("magnet1"), Some(ProcessState::Running));
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reset_aborts_when_stop_fails() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness.control.set_process("magnet1", ProcessState::Running);
    let fault = DaemonFault::Unknown {
        code: 2,
        message: "FAILED".into(),
    };
    harness.control.fail_next(Op::Stop, "magnet1", fault.clone());

    let outcome = harness
        .engine
        .submit("magnet1", Command::Reset)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TransitionOutcome::Failed(TransitionFault::ResetAborted(fault))
    );
    assert_eq!(harness.control.transitions_for("magnet1"), vec![Op::Stop]);
    assert_eq!(
        harness.engine.state("magnet1").unwrap(),
        WorkerControlState::ErrorStopping
    );
    let control = harness.point("magnet1_control").unwrap();
    assert_eq!(control.value, PointValue::Int(1));
    assert_eq!(control.severity, AlarmSeverity::Major);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_daemon_is_retried() {
    let harness = Harness::new(&[("magnet1", true)]);
    for _ in 0..2 {
        harness.control.fail_next(
            Op::Start,
            "magnet1",
            DaemonFault::Unreachable("connection refused".into()),
        );
    }

    let outcome = harness
        .engine
        .submit("magnet1", Command::Run)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome, TransitionOutcome::Completed(WorkerControlState::Running));
    assert_eq!(
        harness.control.transitions_for("magnet1"),
        vec![Op::Start, Op::Start, Op::Start]
    );
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_error_state() {
    let harness = Harness::new(&[("magnet1", true)]);
    let fault = DaemonFault::Unreachable("connection refused".into());
    for _ in 0..3 {
        harness.control.fail_next(Op::Start, "magnet1", fault.clone());
    }

    let outcome = harness
        .engine
        .submit("magnet1", Command::Run)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TransitionOutcome::Failed(TransitionFault::StartFailed(fault))
    );
    assert_eq!(
        harness.engine.state("magnet1").unwrap(),
        WorkerControlState::ErrorStarting
    );
    let state = harness.point("magnet1_state").unwrap();
    assert_eq!(state.value, PointValue::Text("ErrorStarting".into()));
    assert_eq!(state.severity, AlarmSeverity::Major);
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn newest_queued_command_wins() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness
        .control
        .delay(Op::Start, "magnet1", Duration::from_secs(5));

    let first = harness.engine.submit("magnet1", Command::Run).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!harness.engine.is_idle("magnet1").unwrap());

    let second = harness.engine.submit("magnet1", Command::Stop).unwrap();
    let third = harness.engine.submit("magnet1", Command::Reset).unwrap();

    assert_eq!(second.outcome().await.unwrap(), TransitionOutcome::Superseded);
    assert_eq!(
        first.outcome().await.unwrap(),
        TransitionOutcome::Completed(WorkerControlState::Running)
    );
    assert_eq!(
        third.outcome().await.unwrap(),
        TransitionOutcome::Completed(WorkerControlState::Running)
    );
    assert_eq!(
        harness.control.transitions_for("magnet1"),
        vec![Op::Start, Op::Stop, Op::Start]
    );
    assert!(harness.engine.is_idle("magnet1").unwrap());
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn workers_transition_independently() {
    let harness = Harness::new(&[("slow", true), ("fast", true)]);
    harness
        .control
        .delay(Op::Start, "slow", Duration::from_secs(30));

    let slow = harness.engine.submit("slow", Command::Run).unwrap();
    let began = Instant::now();
    let fast = harness
        .engine
        .submit("fast", Command::Run)
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(fast, TransitionOutcome::Completed(WorkerControlState::Running));
    assert!(began.elapsed() < Duration::from_secs(30));
    assert_eq!(
        harness.engine.state("slow").unwrap(),
        WorkerControlState::Starting
    );
    assert_eq!(
        slow.outcome().await.unwrap(),
        TransitionOutcome::Completed(WorkerControlState::Running)
    );
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_worker_is_rejected() {
    let harness = Harness::new(&[("magnet1", true)]);
    let err = harness.engine.submit("ghost", Command::Run).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Registry(RegistryError::NotFound(ref name)) if name == "ghost"
    ));
    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_ticket_resolves_on_shutdown() {
    let harness = Harness::new(&[("magnet1", true)]);
    harness
        .control
        .delay(Op::Start, "magnet1", Duration::from_secs(60));
    let ticket = harness.engine.submit("magnet1", Command::Run).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    harness.shutdown().await;
    assert!(matches!(ticket.outcome().await, Err(EngineError::ShutDown)));
}
