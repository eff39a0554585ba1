mod common;

use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use common::{is_reaped, worker_config, Fixture, POLL};
use isobench::{Request, Response, Worker, WorkerError, WorkerState};

#[test]
fn test_handshake_before_any_task() {
    let mut worker = Worker::new(worker_config(), None);
    worker.initialize().unwrap();
    assert_eq!(worker.state(), WorkerState::Ready);
    assert_eq!(worker.spawn_count(), 1);
    assert!(worker.pid().is_some());

    // Idempotent while Ready.
    worker.initialize().unwrap();
    assert_eq!(worker.spawn_count(), 1);

    worker.send(&Request::Ping).unwrap();
    assert_eq!(worker.receive().unwrap(), Response::Pong);
}

#[test]
fn test_add_returns_finite_latency() {
    let fixture = Fixture::new();
    let mut worker = Worker::new(worker_config(), None);
    let latency = worker.benchmark(&fixture.task("add")).unwrap();
    assert!(latency.is_finite());
    assert!(latency > 0.0);
    // Requests on one worker are answered in order.
    let second = worker.benchmark(&fixture.task("mul")).unwrap();
    assert!(second.is_finite());
    assert_eq!(worker.spawn_count(), 1);
}

#[test]
fn test_external_kill_detected_within_poll_interval() {
    let fixture = Fixture::new();
    let mut worker = Worker::new(worker_config(), None);
    worker.initialize().unwrap();
    let pid = worker.pid().unwrap();

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        Instant::now()
    });

    let result = worker.benchmark(&fixture.sleep_task(10_000));
    let detected = Instant::now();
    let killed_at = killer.join().unwrap();

    assert!(matches!(result, Err(WorkerError::Died { .. })));
    assert!(detected.duration_since(killed_at) < POLL + Duration::from_secs(1));
    assert_eq!(worker.state(), WorkerState::Dead);
    assert!(worker.pid().is_none());
    assert!(is_reaped(pid));

    // The next send respawns.
    worker.send(&Request::Ping).unwrap();
    assert_eq!(worker.receive().unwrap(), Response::Pong);
    assert_eq!(worker.spawn_count(), 2);
    assert_eq!(worker.state(), WorkerState::Ready);
}

#[test]
fn test_crashing_kernels_surface_as_death() {
    let fixture = Fixture::new();
    let mut worker = Worker::new(worker_config(), None);
    for entry_point in ["kill", "segfault", "abort", "exit", "fail"] {
        let result = worker.benchmark(&fixture.task(entry_point));
        assert!(
            matches!(result, Err(WorkerError::Died { .. })),
            "{entry_point}: {result:?}"
        );
    }
    assert_eq!(worker.spawn_count(), 5);
}

#[test]
fn test_terminate_reaps_child() {
    let mut worker = Worker::new(worker_config(), Some(0));
    worker.initialize().unwrap();
    let pid = worker.pid().unwrap();

    worker.terminate();
    assert_eq!(worker.state(), WorkerState::Unstarted);
    assert!(worker.pid().is_none());
    assert!(is_reaped(pid));

    worker.initialize().unwrap();
    assert_ne!(worker.pid(), Some(pid));
    assert_eq!(worker.spawn_count(), 2);
}

#[test]
fn test_dropping_worker_kills_child() {
    let mut worker = Worker::new(worker_config(), None);
    worker.initialize().unwrap();
    let pid = worker.pid().unwrap();
    drop(worker);
    assert!(is_reaped(pid));
}
