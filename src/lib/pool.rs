//! # Worker Pool
//!
//! A `WorkerPool` keeps one `Worker` per target device and fans benchmark
//! tasks across them. Dispatch runs on a rayon thread pool sized to the
//! worker count, so no more tasks are in flight than there are workers.
//!
//! A task whose worker dies (or misbehaves) is reported as
//! [`FAILED_LATENCY`] with a warning; the failure never escapes as an error
//! and never affects other tasks. The dead worker respawns on its next use.
//!
//! ## Teardown
//!
//! `terminate()` stops new dispatch calls from entering, waits for the
//! calls already running to finish, then stops and joins every worker. Pools
//! that are still alive when the process exits are torn down by a hook
//! registered once per process with `atexit`; that path does not wait for
//! in-flight work.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::{Duration, Instant};

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PoolConfig};
use crate::task::BenchmarkTask;
use crate::worker::{Worker, WorkerError};

/// Latency reported for a task that could not be measured.
pub const FAILED_LATENCY: f64 = f64::INFINITY;

/// Bound on how long the exit hook waits for a pool's locks.
const EXIT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker for device {device:?} failed to start: {source}")]
    Worker {
        device: Option<u32>,
        #[source]
        source: WorkerError,
    },
    #[error("failed to build dispatch threads: {0}")]
    Executor(#[from] rayon::ThreadPoolBuildError),
    #[error("pool is not initialized")]
    NotInitialized,
}

/// Counters for the current generation of workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct Slots {
    idle: VecDeque<Worker>,
    /// Dispatch calls currently running against this generation.
    calls: usize,
    closed: bool,
}

/// One initialized generation of workers.
struct ActivePool {
    slots: Mutex<Slots>,
    changed: Condvar,
    size: usize,
    executor: rayon::ThreadPool,
    counters: Counters,
}

struct PoolShared {
    config: PoolConfig,
    active: Mutex<Option<Arc<ActivePool>>>,
}

/// A pool of crash-isolated benchmark workers.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

static EXIT_HOOK: Once = Once::new();
static LIVE_POOLS: Lazy<Mutex<Vec<Weak<PoolShared>>>> = Lazy::new(|| Mutex::new(Vec::new()));

impl WorkerPool {
    /// Create an uninitialized pool. Nothing is spawned until `initialize`.
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            config,
            active: Mutex::new(None),
        });
        let mut live = LIVE_POOLS.lock();
        live.retain(|pool| pool.strong_count() > 0);
        live.push(Arc::downgrade(&shared));
        Self { shared }
    }

    pub fn from_env() -> Result<Self, PoolError> {
        Ok(Self::new(PoolConfig::from_env()?))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Spawn one worker per target device and wait for every handshake.
    /// Idempotent.
    pub fn initialize(&self) -> Result<(), PoolError> {
        self.active().map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Number of workers in the current generation, 0 when uninitialized.
    pub fn size(&self) -> usize {
        self.shared.active.lock().as_ref().map_or(0, |active| active.size)
    }

    /// Benchmark one task on the next idle worker. Fails with
    /// `NotInitialized` before `initialize` or after `terminate`.
    pub fn dispatch_one(&self, task: &BenchmarkTask) -> Result<f64, PoolError> {
        let call = self.enter()?;
        Ok(call.pool.run(task))
    }

    /// Benchmark every task, returning latencies in task order.
    pub fn dispatch_many(&self, tasks: &[BenchmarkTask]) -> Result<Vec<f64>, PoolError> {
        let call = self.enter()?;
        let pool = &call.pool;
        debug!(
            "[POOL:DISPATCH] {} task(s) across {} worker(s)",
            tasks.len(),
            pool.size
        );
        Ok(pool
            .executor
            .install(|| tasks.par_iter().map(|task| pool.run(task)).collect()))
    }

    /// Drain in-flight work, then stop and join every worker. A later
    /// `initialize` starts a fresh generation.
    pub fn terminate(&self) {
        let active = self.shared.active.lock().take();
        if let Some(active) = active {
            active.shutdown(true);
        }
    }

    pub fn stats(&self) -> PoolStats {
        match self.shared.active.lock().as_ref() {
            Some(active) => active.stats(),
            None => PoolStats::default(),
        }
    }

    /// PIDs of the workers that are idle right now.
    pub fn worker_pids(&self) -> Vec<u32> {
        let Some(active) = self.current() else {
            return Vec::new();
        };
        let pids = active.slots.lock().idle.iter().filter_map(Worker::pid).collect();
        pids
    }

    fn current(&self) -> Option<Arc<ActivePool>> {
        self.shared.active.lock().clone()
    }

    fn active(&self) -> Result<Arc<ActivePool>, PoolError> {
        let mut active = self.shared.active.lock();
        if let Some(pool) = active.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ActivePool::start(&self.shared.config)?);
        *active = Some(Arc::clone(&pool));
        EXIT_HOOK.call_once(register_exit_hook);
        Ok(pool)
    }

    /// Register a dispatch call against the current generation. A
    /// generation that closed between lookup and entry counts as terminated.
    fn enter(&self) -> Result<Call, PoolError> {
        self.current()
            .and_then(Call::enter)
            .ok_or(PoolError::NotInitialized)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl ActivePool {
    fn start(config: &PoolConfig) -> Result<Self, PoolError> {
        let devices = config.target_devices()?;
        let size = devices.len();
        info!(
            "[POOL:INIT] Starting {} worker(s) on devices {:?}",
            size, devices
        );
        let start = Instant::now();

        let executor = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("isobench-dispatch-{}", i))
            .build()?;

        // Children boot in parallel; every handshake must succeed.
        let workers: Vec<Worker> = executor.install(|| {
            devices
                .par_iter()
                .map(|&device| {
                    let mut worker = Worker::new(config.worker.clone(), device);
                    worker
                        .initialize()
                        .map(|()| worker)
                        .map_err(|source| PoolError::Worker { device, source })
                })
                .collect::<Result<_, _>>()
        })?;

        info!(
            "[POOL:INIT] {} worker(s) ready in {:.2} ms",
            size,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Self {
            slots: Mutex::new(Slots {
                idle: workers.into(),
                calls: 0,
                closed: false,
            }),
            changed: Condvar::new(),
            size,
            executor,
            counters: Counters::default(),
        })
    }

    fn acquire(&self) -> Lease<'_> {
        let mut slots = self.slots.lock();
        loop {
            if let Some(worker) = slots.idle.pop_front() {
                return Lease {
                    pool: self,
                    worker: Some(worker),
                };
            }
            self.changed.wait(&mut slots);
        }
    }

    fn run(&self, task: &BenchmarkTask) -> f64 {
        let mut lease = self.acquire();

        let counters = &self.counters;
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = lease.worker().benchmark(task);
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(latency) => {
                debug!("[POOL:RESULT] {} -> {:.4} ms", task, latency);
                latency
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("[POOL:FAIL] Failed to benchmark {}: {}", task, e);
                // A worker that answered out of protocol cannot be trusted
                // with the next task.
                if !matches!(e, WorkerError::Died { .. }) {
                    lease.worker().kill();
                }
                FAILED_LATENCY
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            workers: self.size,
            dispatched: c.dispatched.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Close the generation and stop its workers. With `drain`, first wait
    /// for running dispatch calls to return their workers.
    fn shutdown(&self, drain: bool) {
        let slots = if drain {
            Some(self.slots.lock())
        } else {
            self.slots.try_lock_for(EXIT_LOCK_TIMEOUT)
        };
        let Some(mut slots) = slots else {
            warn!("[POOL:STOP] Pool busy at exit, leaving workers to their pipes");
            return;
        };
        slots.closed = true;
        if drain {
            while slots.calls > 0 {
                self.changed.wait(&mut slots);
            }
        }
        let mut workers: Vec<Worker> = slots.idle.drain(..).collect();
        drop(slots);

        info!("[POOL:STOP] Stopping {} worker(s)", workers.len());
        // Stop everyone first so the children exit concurrently.
        for worker in workers.iter_mut() {
            worker.request_stop();
        }
        for worker in workers.iter_mut() {
            worker.join();
        }
        info!("[POOL:STOP] Pool terminated");
    }
}

/// Exclusive use of one worker; returns it to the idle set when dropped.
struct Lease<'a> {
    pool: &'a ActivePool,
    worker: Option<Worker>,
}

impl Lease<'_> {
    fn worker(&mut self) -> &mut Worker {
        self.worker.as_mut().expect("worker is only taken on drop")
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.slots.lock().idle.push_back(worker);
            self.pool.changed.notify_all();
        }
    }
}

/// Registration of one running dispatch call.
struct Call {
    pool: Arc<ActivePool>,
}

impl Call {
    fn enter(pool: Arc<ActivePool>) -> Option<Self> {
        {
            let mut slots = pool.slots.lock();
            if slots.closed {
                return None;
            }
            slots.calls += 1;
        }
        Some(Self { pool })
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.pool.slots.lock().calls -= 1;
        self.pool.changed.notify_all();
    }
}

fn register_exit_hook() {
    // SAFETY: the callback is a plain extern "C" fn with no captured state.
    if unsafe { libc::atexit(terminate_live_pools) } != 0 {
        warn!("[POOL:INIT] Failed to register exit hook; workers exit when their pipes close");
    }
}

extern "C" fn terminate_live_pools() {
    // Unwinding out of an atexit callback is undefined behavior.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        let pools: Vec<Arc<PoolShared>> = match LIVE_POOLS.try_lock_for(EXIT_LOCK_TIMEOUT) {
            Some(mut live) => live.drain(..).filter_map(|pool| pool.upgrade()).collect(),
            None => return,
        };
        for pool in pools {
            let active = pool
                .active
                .try_lock_for(EXIT_LOCK_TIMEOUT)
                .and_then(|mut active| active.take());
            if let Some(active) = active {
                active.shutdown(false);
            }
        }
    }));
}

static TUNING_POOL: OnceCell<WorkerPool> = OnceCell::new();

/// The process-wide pool, configured from the environment on first use.
pub fn tuning_pool() -> Result<&'static WorkerPool, PoolError> {
    TUNING_POOL.get_or_try_init(WorkerPool::from_env)
}

/// Benchmark every task in a subprocess, pairing each with its latency in
/// milliseconds. Tasks that could not be measured get [`FAILED_LATENCY`].
pub fn benchmark_many(
    tasks: &[BenchmarkTask],
) -> Result<Vec<(&BenchmarkTask, f64)>, PoolError> {
    let pool = tuning_pool()?;
    pool.initialize()?;
    let latencies = pool.dispatch_many(tasks)?;
    Ok(tasks.iter().zip(latencies).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::model::{DType, Device, TensorSpec};

    #[test]
    fn test_uninitialized_pool() {
        let pool = WorkerPool::new(PoolConfig::new("/nonexistent/isobench-worker"));
        assert!(!pool.is_initialized());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(pool.worker_pids().is_empty());
        // No-op without workers.
        pool.terminate();
    }

    #[test]
    fn test_dispatch_requires_initialize() {
        let pool = WorkerPool::new(PoolConfig::new("/nonexistent/isobench-worker"));
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![4]);
        let task = BenchmarkTask::new("k", "/tmp/k.json", "copy", spec.clone(), spec);

        assert!(matches!(
            pool.dispatch_one(&task),
            Err(PoolError::NotInitialized)
        ));
        assert!(matches!(
            pool.dispatch_many(std::slice::from_ref(&task)),
            Err(PoolError::NotInitialized)
        ));
        assert!(!pool.is_initialized());
    }

    #[test]
    fn test_spawn_failure_propagates() {
        let pool = WorkerPool::new(PoolConfig::new("/nonexistent/isobench-worker"));
        match pool.initialize() {
            Err(PoolError::Worker { device, source }) => {
                assert_eq!(device, None);
                assert!(matches!(source, WorkerError::Spawn { .. }));
            }
            other => panic!("expected a worker error, got {:?}", other.map(|_| ())),
        }
        assert!(!pool.is_initialized());
    }

    #[test]
    fn test_bad_device_list_propagates() {
        let config = PoolConfig::new("isobench-worker")
            .with_multi_device(2)
            .with_visible_devices("5");
        let pool = WorkerPool::new(config);
        assert!(matches!(pool.initialize(), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_handshake_failure_on_one_device_fails_pool() {
        let worker = WorkerConfig::new("cat").with_poll_interval(Duration::from_millis(20));
        let config = PoolConfig::new("cat").with_worker(worker).with_multi_device(2);
        let pool = WorkerPool::new(config);
        assert!(matches!(
            pool.initialize(),
            Err(PoolError::Worker { source: WorkerError::Protocol(_), .. })
        ));
    }

    #[test]
    fn test_failed_latency_is_infinite() {
        assert!(FAILED_LATENCY.is_infinite());
        assert!(FAILED_LATENCY > 0.0);
    }
}
