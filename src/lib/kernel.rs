//! # Kernel Interfaces and Host Kernels
//!
//! The benchmark worker never knows how a kernel was compiled. It goes through
//! three narrow traits:
//!
//! - `KernelLoader`: turns a `(cache key, path)` pair into a `KernelModule`.
//! - `KernelModule`: resolves an entry-point name to a `Kernel`.
//! - `Kernel`: launches once with positional inputs, outputs, extra arguments
//!   and launch parameters.
//!
//! `HostKernel` is the set of builtin CPU kernels used by the host runtime.
//! Besides simple strided elementwise ops it carries diagnostic kernels that
//! sleep, fail or kill their own process, which is how crash isolation is
//! exercised end to end.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{DType, Device};
use crate::tensor::{with_element, Element, Tensor};

/// Errors raised while loading, resolving or running a kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("failed to load module {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("module {path:?} was built for cache key '{found}', expected '{expected}'")]
    StaleModule {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("module '{module}' has no entry point '{name}'")]
    MissingEntryPoint { module: String, name: String },
    #[error("unknown builtin kernel '{0}'")]
    UnknownBuiltin(String),
    #[error("kernel '{kernel}' expects {expected} {what}, got {got}")]
    Arity {
        kernel: String,
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DtypeMismatch { expected: DType, found: DType },
    #[error("dtype {0} is not supported by this kernel")]
    UnsupportedDtype(DType),
    #[error("device {0} is not supported by this runtime")]
    UnsupportedDevice(Device),
    #[error("tensor allocation failed: {0}")]
    Allocation(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("kernel '{kernel}' failed with status {status}")]
    Launch { kernel: String, status: i32 },
    #[error("device error: {0}")]
    Device(String),
}

/// Launch geometry and compile-time precision parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Vec<u32>,
    pub num_stages: u32,
    pub num_warps: u32,
}

impl LaunchConfig {
    /// Grid padded to three dimensions
    pub fn grid3(&self) -> [u32; 3] {
        let mut grid = [1; 3];
        for (slot, dim) in grid.iter_mut().zip(&self.grid) {
            *slot = *dim;
        }
        grid
    }
}

/// Arguments for a single kernel launch.
pub struct LaunchArgs<'a> {
    pub inputs: &'a [Tensor],
    pub outputs: &'a mut [Tensor],
    pub extra: &'a BTreeMap<String, Value>,
    pub config: &'a LaunchConfig,
}

impl LaunchArgs<'_> {
    fn extra_u64(&self, key: &str) -> Result<Option<u64>, KernelError> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                KernelError::InvalidArgument(format!("'{}' must be an unsigned integer", key))
            }),
        }
    }

    fn extra_str(&self, key: &str) -> Result<Option<&str>, KernelError> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                KernelError::InvalidArgument(format!("'{}' must be a string", key))
            }),
        }
    }

    fn extra_f64(&self, key: &str) -> Result<Option<f64>, KernelError> {
        match self.extra.get(key) {
            None => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                KernelError::InvalidArgument(format!("'{}' must be a number", key))
            }),
        }
    }
}

/// A callable kernel entry point.
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;
    fn launch(&self, args: &mut LaunchArgs<'_>) -> Result<(), KernelError>;
}

/// A loaded module exposing named entry points.
pub trait KernelModule: Send + Sync {
    fn name(&self) -> &str;
    fn entry_point(&self, name: &str) -> Option<Arc<dyn Kernel>>;
}

/// Loads compiled modules by cache key and path. Must be deterministic and
/// safe to call from a freshly spawned process with no warm state.
pub trait KernelLoader: Send + Sync {
    fn load(&self, cache_key: &str, path: &Path) -> Result<Arc<dyn KernelModule>, KernelError>;
}

/// Builtin host kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKernel {
    /// `out = a + b`
    Add,
    /// `out = a - b`
    Sub,
    /// `out = a * b`
    Mul,
    /// `out = a`
    Copy,
    /// Every output element set to extra arg `value` (default 0)
    Fill,
    /// Sleeps for extra arg `ms` milliseconds. With extra arg `trace`, a
    /// `+` line is appended to that file on entry and a `-` line on exit.
    Sleep,
    /// Returns a launch error
    Fail,
    /// Aborts the process
    Abort,
    /// Sends SIGKILL to the process
    Kill,
    /// Sends SIGSEGV to the process
    Segfault,
    /// Exits the process with extra arg `code` (default 3)
    Exit,
}

impl HostKernel {
    pub const ALL: [HostKernel; 11] = [
        HostKernel::Add,
        HostKernel::Sub,
        HostKernel::Mul,
        HostKernel::Copy,
        HostKernel::Fill,
        HostKernel::Sleep,
        HostKernel::Fail,
        HostKernel::Abort,
        HostKernel::Kill,
        HostKernel::Segfault,
        HostKernel::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HostKernel::Add => "add",
            HostKernel::Sub => "sub",
            HostKernel::Mul => "mul",
            HostKernel::Copy => "copy",
            HostKernel::Fill => "fill",
            HostKernel::Sleep => "sleep",
            HostKernel::Fail => "fail",
            HostKernel::Abort => "abort",
            HostKernel::Kill => "kill",
            HostKernel::Segfault => "segfault",
            HostKernel::Exit => "exit",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, KernelError> {
        HostKernel::ALL
            .into_iter()
            .find(|kernel| kernel.name() == name)
            .ok_or_else(|| KernelError::UnknownBuiltin(name.to_string()))
    }
}

impl Kernel for HostKernel {
    fn name(&self) -> &str {
        HostKernel::name(*self)
    }

    fn launch(&self, args: &mut LaunchArgs<'_>) -> Result<(), KernelError> {
        match self {
            HostKernel::Add => binary(self.name(), args, |a, b| a + b),
            HostKernel::Sub => binary(self.name(), args, |a, b| a - b),
            HostKernel::Mul => binary(self.name(), args, |a, b| a * b),
            HostKernel::Copy => {
                expect_arity(self.name(), "inputs", 1, args.inputs.len())?;
                expect_arity(self.name(), "outputs", 1, args.outputs.len())?;
                map_into(&args.inputs[0], &mut args.outputs[0], |v| v)
            }
            HostKernel::Fill => {
                let value = args.extra_f64("value")?.unwrap_or(0.0);
                for out in args.outputs.iter_mut() {
                    let values = vec![value; out.numel()];
                    out.copy_from_f64(&values)?;
                }
                Ok(())
            }
            HostKernel::Sleep => {
                let ms = args.extra_u64("ms")?.unwrap_or(1);
                let trace = args.extra_str("trace")?;
                if let Some(path) = trace {
                    append_trace(path, "+")?;
                }
                thread::sleep(Duration::from_millis(ms));
                if let Some(path) = trace {
                    append_trace(path, "-")?;
                }
                Ok(())
            }
            HostKernel::Fail => Err(KernelError::Launch {
                kernel: self.name().to_string(),
                status: -1,
            }),
            HostKernel::Abort => std::process::abort(),
            HostKernel::Kill => raise_fatal(Signal::SIGKILL),
            HostKernel::Segfault => raise_fatal(Signal::SIGSEGV),
            HostKernel::Exit => {
                let code = args.extra_u64("code")?.unwrap_or(3);
                std::process::exit(code as i32)
            }
        }
    }
}

fn append_trace(path: &str, mark: &str) -> Result<(), KernelError> {
    // One short O_APPEND write per mark keeps lines whole across processes.
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| KernelError::InvalidArgument(format!("trace {}: {}", path, e)))?;
    writeln!(file, "{}", mark)
        .map_err(|e| KernelError::InvalidArgument(format!("trace {}: {}", path, e)))
}

fn raise_fatal(signal: Signal) -> Result<(), KernelError> {
    raise(signal).map_err(|e| KernelError::Device(format!("raise {}: {}", signal, e)))?;
    // SIGSEGV may be caught by an installed handler; never return normally.
    std::process::abort()
}

fn expect_arity(
    kernel: &str,
    what: &'static str,
    expected: usize,
    got: usize,
) -> Result<(), KernelError> {
    if expected != got {
        return Err(KernelError::Arity {
            kernel: kernel.to_string(),
            what,
            expected,
            got,
        });
    }
    Ok(())
}

fn binary(
    kernel: &str,
    args: &mut LaunchArgs<'_>,
    op: fn(f64, f64) -> f64,
) -> Result<(), KernelError> {
    expect_arity(kernel, "inputs", 2, args.inputs.len())?;
    expect_arity(kernel, "outputs", 1, args.outputs.len())?;
    let (a, b) = (&args.inputs[0], &args.inputs[1]);
    let out = &mut args.outputs[0];
    for operand in [a, b] {
        if operand.shape() != out.shape() {
            return Err(KernelError::ShapeMismatch(
                operand.shape().to_vec(),
                out.shape().to_vec(),
            ));
        }
        if operand.dtype() != out.dtype() {
            return Err(KernelError::DtypeMismatch {
                expected: out.dtype(),
                found: operand.dtype(),
            });
        }
    }
    let out_offsets: Vec<usize> = out.offsets().collect();
    with_element!(out.dtype(), T => {
        let lhs = a.data::<T>()?;
        let rhs = b.data::<T>()?;
        let dst = out.data_mut::<T>()?;
        for ((ia, ib), io) in a.offsets().zip(b.offsets()).zip(out_offsets) {
            dst[io] = T::from_f64(op(lhs[ia].to_f64(), rhs[ib].to_f64()));
        }
        Ok(())
    })
}

fn map_into(src: &Tensor, out: &mut Tensor, op: fn(f64) -> f64) -> Result<(), KernelError> {
    if src.shape() != out.shape() {
        return Err(KernelError::ShapeMismatch(
            src.shape().to_vec(),
            out.shape().to_vec(),
        ));
    }
    let values: Vec<f64> = src.to_f64_vec()?.into_iter().map(op).collect();
    out.copy_from_f64(&values)
}

/// A module whose entry points are builtin host kernels.
pub struct BuiltinModule {
    name: String,
    entry_points: BTreeMap<String, HostKernel>,
}

impl BuiltinModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_points: BTreeMap::new(),
        }
    }

    /// Expose `kernel` under `entry_point`
    pub fn with_entry_point(
        mut self,
        entry_point: impl Into<String>,
        kernel: HostKernel,
    ) -> Self {
        self.entry_points.insert(entry_point.into(), kernel);
        self
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }
}

impl KernelModule for BuiltinModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_point(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.entry_points
            .get(name)
            .map(|kernel| Arc::new(*kernel) as Arc<dyn Kernel>)
    }
}
