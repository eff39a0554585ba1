#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tempfile::TempDir;

use isobench::loader::{manifest_path, ModuleManifest};
use isobench::{BenchmarkTask, DType, Device, HostKernel, TensorSpec, WorkerConfig};

pub const POLL: Duration = Duration::from_millis(100);
pub const CACHE_KEY: &str = "fixture-key";

pub fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_isobench-worker"))
}

/// Worker settings with a short poll interval and a minimal timer budget,
/// so each benchmark launches its kernel three times.
pub fn worker_config() -> WorkerConfig {
    WorkerConfig::new(worker_bin())
        .with_arg("--timer-warmup-ms")
        .with_arg("1")
        .with_arg("--timer-rep-ms")
        .with_arg("1")
        .with_poll_interval(POLL)
        .with_handshake_timeout(Duration::from_secs(30))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// A manifest module on disk exposing one entry point per builtin kernel.
pub struct Fixture {
    _dir: TempDir,
    path: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest_path(dir.path(), "fixture");
        let manifest = HostKernel::ALL
            .into_iter()
            .fold(ModuleManifest::new(CACHE_KEY), |m, kernel| {
                m.with_entry_point(kernel.name(), kernel)
            });
        manifest.write_to(&path).unwrap();
        Self { _dir: dir, path }
    }

    pub fn task(&self, entry_point: &str) -> BenchmarkTask {
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![64, 64]);
        BenchmarkTask::new(
            CACHE_KEY,
            &self.path,
            entry_point,
            vec![spec.clone(), spec.clone()],
            spec,
        )
    }

    pub fn sleep_task(&self, ms: u64) -> BenchmarkTask {
        self.task("sleep").with_extra_arg("ms", ms)
    }
}

/// True once `pid` no longer names any process.
pub fn is_reaped(pid: u32) -> bool {
    matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}
