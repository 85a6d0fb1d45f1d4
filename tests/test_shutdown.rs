mod common;

use std::time::Duration;

use tokio::time::timeout;
use worker_supervisor::{Phase, Signal, SupervisorBuilder};

use common::{pid, FakeLifecycle, Harness};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_quit_drains_without_respawn_then_stops() {
    let harness = Harness::start(2);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGQUIT);
    let snapshot = harness.snapshot().await;
    assert!(snapshot.shutting_down);
    assert_eq!(
        harness.lifecycle.signals(),
        vec![(pid(1000), Signal::SIGQUIT), (pid(1001), Signal::SIGQUIT)]
    );

    harness.exit(1000);
    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.slots(), vec![1]);
    assert!(harness.lifecycle.spawned_slots().is_empty());

    harness.exit(1001);
    let Harness { handle, .. } = harness;
    timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_term_kills_all_workers_then_stops() {
    let harness = Harness::start(3);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGTERM);
    harness.exit(1002);
    harness.exit(1000);
    harness.exit(1001);

    let Harness { handle, lifecycle, .. } = harness;
    timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(
        lifecycle.signals(),
        vec![
            (pid(1000), Signal::SIGTERM),
            (pid(1001), Signal::SIGTERM),
            (pid(1002), Signal::SIGTERM),
        ]
    );
    assert!(lifecycle.spawned_slots().is_empty());
}

#[tokio::test]
async fn test_int_behaves_like_term() {
    let harness = Harness::start(1);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGINT);
    harness.exit(1000);

    let Harness { handle, lifecycle, .. } = harness;
    timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(lifecycle.signals(), vec![(pid(1000), Signal::SIGINT)]);
}

#[tokio::test]
async fn test_term_with_no_workers_stops_immediately() {
    let harness = Harness::start(0);
    harness.signal(Signal::SIGTERM);

    let Harness { handle, lifecycle, .. } = harness;
    timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert!(lifecycle.calls().is_empty());
}

#[tokio::test]
async fn test_repeated_shutdown_signal_is_resent_without_new_transition() {
    let harness = Harness::start(2);
    harness.snapshot().await;

    harness.signal(Signal::SIGTERM);
    let first = harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGTERM);
    let second = harness.snapshot().await;

    assert_eq!(first, second);
    assert_eq!(
        harness.lifecycle.signals(),
        vec![(pid(1000), Signal::SIGTERM), (pid(1001), Signal::SIGTERM)]
    );
}

#[tokio::test]
async fn test_scaling_is_ignored_while_draining() {
    let harness = Harness::start(2);
    harness.snapshot().await;
    harness.signal(Signal::SIGQUIT);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGTTIN);
    harness.signal(Signal::SIGTTOU);

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.target_workers, 2);
    assert!(harness.lifecycle.calls().is_empty());
}

#[tokio::test]
async fn test_pause_signals_are_forwarded_while_draining() {
    let harness = Harness::start(2);
    harness.snapshot().await;
    harness.signal(Signal::SIGQUIT);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGUSR2);
    harness.signal(Signal::SIGCONT);
    harness.snapshot().await;

    assert_eq!(
        harness.lifecycle.signals(),
        vec![
            (pid(1000), Signal::SIGUSR2),
            (pid(1001), Signal::SIGUSR2),
            (pid(1000), Signal::SIGCONT),
            (pid(1001), Signal::SIGCONT),
        ]
    );
}

#[tokio::test]
async fn test_shutdown_overrides_pending_shrink() {
    let harness = Harness::start(3);
    harness.snapshot().await;

    // Slot 2 is already draining when TERM arrives; it is still signaled.
    harness.signal(Signal::SIGTTOU);
    harness.snapshot().await;
    harness.lifecycle.clear();

    harness.signal(Signal::SIGTERM);
    harness.snapshot().await;
    assert_eq!(harness.lifecycle.signals().len(), 3);

    for raw_pid in [1000, 1001, 1002] {
        harness.exit(raw_pid);
    }
    let Harness { handle, .. } = harness;
    timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

#[test]
fn test_phase_transitions() {
    let mut lifecycle = FakeLifecycle::new();
    let mut supervisor = SupervisorBuilder::new()
        .with_target_workers(1)
        .with_master_pid(pid(1))
        .build();
    supervisor.start(&mut lifecycle).unwrap();
    assert_eq!(supervisor.phase(), Phase::Running);

    let phase = supervisor
        .handle_event(worker_supervisor::Event::Signal(Signal::SIGQUIT), &mut lifecycle)
        .unwrap();
    assert_eq!(phase, Phase::Draining);

    let phase = supervisor
        .handle_event(
            worker_supervisor::Event::WorkerExited(pid(1000), worker_supervisor::ExitStatus::Exited(0)),
            &mut lifecycle,
        )
        .unwrap();
    assert_eq!(phase, Phase::Stopped);
}
