#![allow(missing_docs)]
//! # isobench: Crash-Isolated Kernel Benchmarking
//!
//! This crate measures the latency of compiled compute kernels in separate
//! worker processes, so a kernel that crashes, hangs or corrupts memory only
//! takes down its own worker. The parent keeps one worker per device, fans
//! tasks across them and reports `+inf` for any task that could not be
//! measured.
//!
//! ## Core Modules
//!
//! - `model`: `TensorSpec`, a serializable tensor layout captured from IR nodes.
//! - `tensor`: Host tensors and the `TensorAllocator` that synthesizes them.
//! - `kernel`: Kernel, module and loader traits plus builtin host kernels.
//! - `loader`: Manifest and shared-library module loaders with a code cache.
//! - `timing`: The benchmark timer and device synchronization.
//! - `task`: `BenchmarkTask`, the unit of work sent to a worker.
//! - `ipc`: Length-prefixed JSON framing over the worker's pipes.
//! - `worker`: One child process and its lifecycle.
//! - `child`: The request loop run inside the worker binary.
//! - `pool`: `WorkerPool`, dispatch and the process-wide `benchmark_many`.
//! - `config`: Environment-driven pool configuration.

pub mod child;
pub mod config;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod model;
pub mod pool;
pub mod runtime;
pub mod task;
pub mod tensor;
pub mod timing;
pub mod worker;

pub use config::{ConfigError, PoolConfig, WorkerConfig};
pub use ipc::{ProtocolError, Request, Response};
pub use kernel::{HostKernel, Kernel, KernelError, KernelLoader, KernelModule};
pub use model::{DType, Device, TensorSpec, TensorSpecs};
pub use pool::{benchmark_many, tuning_pool, PoolError, PoolStats, WorkerPool, FAILED_LATENCY};
pub use runtime::Runtime;
pub use task::BenchmarkTask;
pub use tensor::{Tensor, TensorAllocator};
pub use worker::{Worker, WorkerError, WorkerState};

// Re-export common types
pub use anyhow::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
