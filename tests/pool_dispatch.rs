mod common;

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use common::{is_reaped, worker_config, Fixture, POLL};
use isobench::{PoolConfig, PoolError, WorkerPool, FAILED_LATENCY};

fn single_worker_pool() -> WorkerPool {
    let config = PoolConfig::new(common::worker_bin()).with_worker(worker_config());
    let pool = WorkerPool::new(config);
    pool.initialize().unwrap();
    pool
}

fn two_worker_pool() -> WorkerPool {
    let config = PoolConfig::new(common::worker_bin())
        .with_worker(worker_config())
        .with_multi_device(2);
    let pool = WorkerPool::new(config);
    pool.initialize().unwrap();
    pool
}

/// Highest number of kernels inside their sleep at once, replayed from the
/// entry and exit marks the sleep kernel appends to `trace`.
fn max_concurrency(trace: &Path) -> usize {
    let mut running = 0usize;
    let mut peak = 0usize;
    for mark in fs::read_to_string(trace).unwrap().lines() {
        match mark {
            "+" => running += 1,
            "-" => running -= 1,
            other => panic!("unexpected trace line {:?}", other),
        }
        peak = peak.max(running);
    }
    assert_eq!(running, 0);
    peak
}

#[test]
fn test_dispatch_one_add() {
    let fixture = Fixture::new();
    let pool = single_worker_pool();
    assert_eq!(pool.size(), 1);

    let latency = pool.dispatch_one(&fixture.task("add")).unwrap();
    assert!(latency.is_finite() && latency > 0.0);
    assert_eq!(pool.stats().dispatched, 1);
    assert_eq!(pool.stats().failed, 0);
}

#[test]
fn test_crash_is_isolated_to_its_task() {
    let fixture = Fixture::new();
    let pool = single_worker_pool();
    let tasks = vec![fixture.task("add"), fixture.task("kill"), fixture.task("add")];

    let latencies = pool.dispatch_many(&tasks).unwrap();
    assert_eq!(latencies.len(), 3);
    assert!(latencies[0].is_finite());
    assert_eq!(latencies[1], FAILED_LATENCY);
    assert!(latencies[2].is_finite());

    let stats = pool.stats();
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.failed, 1);

    // Still usable afterwards.
    assert!(pool.dispatch_one(&fixture.task("sub")).unwrap().is_finite());
}

#[test]
fn test_missing_entry_point_is_infinite_not_a_hang() {
    let fixture = Fixture::new();
    let pool = single_worker_pool();
    let start = Instant::now();
    let latency = pool.dispatch_one(&fixture.task("no_such_kernel")).unwrap();
    assert_eq!(latency, FAILED_LATENCY);
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[test]
fn test_results_follow_task_order() {
    let fixture = Fixture::new();
    let pool = two_worker_pool();
    // Slow first, fast second: completion order differs from task order.
    let tasks = vec![
        fixture.sleep_task(150),
        fixture.task("segfault"),
        fixture.task("copy"),
        fixture.sleep_task(1),
    ];
    let latencies = pool.dispatch_many(&tasks).unwrap();
    assert!(latencies[0] >= 150.0);
    assert_eq!(latencies[1], FAILED_LATENCY);
    assert!(latencies[2].is_finite());
    assert!(latencies[3].is_finite() && latencies[3] < 150.0);
}

#[test]
fn test_in_flight_bounded_by_worker_count() {
    let fixture = Fixture::new();
    let trace = tempfile::NamedTempFile::new().unwrap();
    let traced = || {
        fixture
            .sleep_task(50)
            .with_extra_arg("trace", trace.path().to_str().unwrap())
    };
    let pool = two_worker_pool();
    assert_eq!(pool.size(), 2);

    // Batch dispatch: four tasks fanned across two workers.
    let tasks: Vec<_> = (0..4).map(|_| traced()).collect();
    let start = Instant::now();
    let latencies = pool.dispatch_many(&tasks).unwrap();
    assert!(latencies.iter().all(|l| *l >= 50.0));
    // Each task sleeps three times; two rounds on two workers.
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(max_concurrency(trace.path()), 2);

    // More caller threads than workers, each dispatching on its own.
    fs::write(trace.path(), "").unwrap();
    thread::scope(|s| {
        for _ in 0..5 {
            s.spawn(|| {
                let task = traced();
                assert!(pool.dispatch_one(&task).unwrap().is_finite());
            });
        }
    });
    assert!(max_concurrency(trace.path()) <= 2);

    let stats = pool.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dispatched, 9);
}

#[test]
fn test_killed_mid_task_reports_within_poll_interval() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let fixture = Fixture::new();
    let pool = single_worker_pool();
    let pid = pool.worker_pids()[0];

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        Instant::now()
    });
    let latency = pool.dispatch_one(&fixture.sleep_task(10_000)).unwrap();
    let killed_at = killer.join().unwrap();

    assert_eq!(latency, FAILED_LATENCY);
    assert!(killed_at.elapsed() < POLL + Duration::from_secs(1));
    assert!(pool.dispatch_one(&fixture.task("add")).unwrap().is_finite());
}

#[test]
fn test_terminate_then_initialize_uses_fresh_children() {
    let fixture = Fixture::new();
    let pool = two_worker_pool();
    let mut old = pool.worker_pids();
    old.sort_unstable();
    assert_eq!(old.len(), 2);

    pool.terminate();
    assert!(!pool.is_initialized());
    assert!(old.iter().all(|pid| is_reaped(*pid)));

    pool.initialize().unwrap();
    let new = pool.worker_pids();
    assert_eq!(new.len(), 2);
    assert!(new.iter().all(|pid| !old.contains(pid)));
    assert_eq!(pool.stats().dispatched, 0);
    assert!(pool.dispatch_one(&fixture.task("add")).unwrap().is_finite());
}

#[test]
fn test_dispatch_after_terminate_fails() {
    let fixture = Fixture::new();
    let pool = single_worker_pool();
    let old = pool.worker_pids();
    pool.terminate();

    assert!(matches!(
        pool.dispatch_one(&fixture.task("add")),
        Err(PoolError::NotInitialized)
    ));
    assert!(matches!(
        pool.dispatch_many(&[fixture.task("add")]),
        Err(PoolError::NotInitialized)
    ));
    // Nothing was respawned behind the caller's back.
    assert!(!pool.is_initialized());
    assert!(pool.worker_pids().is_empty());
    assert!(old.iter().all(|pid| is_reaped(*pid)));
}
