//! # Benchmark Tasks
//!
//! A `BenchmarkTask` is the unit of work sent to a worker process. It is built
//! once in the parent, serialized across the process boundary, and executed
//! with `benchmark()` inside the child. The payload is fully self-contained:
//! module location, entry point, launch parameters and the layouts of the
//! tensors to synthesize.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, enabled, Level};

use crate::kernel::{KernelError, LaunchArgs, LaunchConfig};
use crate::model::{TensorSpec, TensorSpecs};
use crate::runtime::Runtime;
use crate::tensor::Tensor;

/// Compile-time precision parameters passed with every launch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecisionParams {
    pub stage_count: u32,
    pub warp_count: u32,
}

impl Default for PrecisionParams {
    fn default() -> Self {
        Self {
            stage_count: 1,
            warp_count: 4,
        }
    }
}

/// A serializable request to benchmark one compiled kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkTask {
    module_cache_key: String,
    module_path: PathBuf,
    entry_point: String,
    #[serde(default)]
    launch_grid: Vec<u32>,
    #[serde(default)]
    extra_launch_args: BTreeMap<String, Value>,
    #[serde(default)]
    precision: PrecisionParams,
    inputs: TensorSpecs,
    outputs: TensorSpecs,
}

impl BenchmarkTask {
    /// Create a task with a 1-D grid of one block and default precision
    pub fn new(
        module_cache_key: impl Into<String>,
        module_path: impl Into<PathBuf>,
        entry_point: impl Into<String>,
        inputs: impl Into<TensorSpecs>,
        outputs: impl Into<TensorSpecs>,
    ) -> Self {
        Self {
            module_cache_key: module_cache_key.into(),
            module_path: module_path.into(),
            entry_point: entry_point.into(),
            launch_grid: vec![1],
            extra_launch_args: BTreeMap::new(),
            precision: PrecisionParams::default(),
            inputs: inputs.into(),
            outputs: outputs.into(),
        }
    }

    pub fn with_grid(mut self, grid: Vec<u32>) -> Self {
        self.launch_grid = grid;
        self
    }

    pub fn with_extra_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_launch_args.insert(name.into(), value.into());
        self
    }

    pub fn with_precision(mut self, stage_count: u32, warp_count: u32) -> Self {
        self.precision = PrecisionParams {
            stage_count,
            warp_count,
        };
        self
    }

    pub fn module_cache_key(&self) -> &str {
        &self.module_cache_key
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn launch_grid(&self) -> &[u32] {
        &self.launch_grid
    }

    pub fn extra_launch_args(&self) -> &BTreeMap<String, Value> {
        &self.extra_launch_args
    }

    pub fn precision(&self) -> PrecisionParams {
        self.precision
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        self.inputs.as_slice()
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        self.outputs.as_slice()
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            grid: self.launch_grid.clone(),
            num_stages: self.precision.stage_count,
            num_warps: self.precision.warp_count,
        }
    }

    /// Synthesize every input and output tensor from its spec
    pub fn materialize(
        &self,
        runtime: &Runtime,
    ) -> Result<(Vec<Tensor>, Vec<Tensor>), KernelError> {
        let build = |specs: &[TensorSpec]| {
            specs
                .iter()
                .map(|spec| spec.materialize(runtime.allocator()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok((build(self.inputs())?, build(self.outputs())?))
    }

    /// Measure the kernel's latency in milliseconds on freshly synthesized
    /// tensors.
    pub fn benchmark(&self, runtime: &Runtime) -> Result<f64, KernelError> {
        self.run(runtime, None)
    }

    /// Measure the kernel's latency on caller-supplied tensors.
    pub fn benchmark_with(
        &self,
        runtime: &Runtime,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
    ) -> Result<f64, KernelError> {
        self.run(runtime, Some((inputs, outputs)))
    }

    fn run(
        &self,
        runtime: &Runtime,
        tensors: Option<(Vec<Tensor>, Vec<Tensor>)>,
    ) -> Result<f64, KernelError> {
        let trace = enabled!(Level::DEBUG);
        let start = Instant::now();

        let module = runtime
            .loader()
            .load(&self.module_cache_key, &self.module_path)?;
        debug!(
            "benchmark module key: {}, path: {:?}",
            self.module_cache_key, self.module_path
        );
        let kernel = module
            .entry_point(&self.entry_point)
            .ok_or_else(|| KernelError::MissingEntryPoint {
                module: module.name().to_string(),
                name: self.entry_point.clone(),
            })?;
        let load_elapsed = start.elapsed();

        let start = Instant::now();
        let (inputs, mut outputs) = match tensors {
            Some(tensors) => tensors,
            None => self.materialize(runtime)?,
        };
        let create_elapsed = start.elapsed();

        let start = Instant::now();
        let config = self.launch_config();
        let mut launch = || {
            kernel.launch(&mut LaunchArgs {
                inputs: &inputs,
                outputs: &mut outputs,
                extra: &self.extra_launch_args,
                config: &config,
            })
        };
        let latency = runtime.timer().measure(&mut launch)?;
        // Surface asynchronous faults before reporting a number.
        runtime.device().synchronize()?;

        if trace {
            debug!(
                "InChildProcess {}: load {:?}, create tensors {:?}, bench {:?}",
                self.module_cache_key,
                load_elapsed,
                create_elapsed,
                start.elapsed()
            );
        }
        Ok(latency)
    }
}

impl fmt::Display for BenchmarkTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.entry_point, self.module_cache_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::kernel::HostKernel;
    use crate::loader::{manifest_path, ModuleManifest};
    use crate::model::{DType, Device};
    use crate::timing::BenchTimer;

    fn fast_runtime() -> Runtime {
        Runtime::host().with_timer(Arc::new(BenchTimer::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
        )))
    }

    fn add_task(path: &Path) -> BenchmarkTask {
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![16, 16]);
        BenchmarkTask::new(
            "add-key",
            path,
            "triton_add",
            vec![spec.clone(), spec.clone()],
            spec,
        )
        .with_grid(vec![16, 1, 1])
        .with_precision(2, 4)
    }

    fn write_module(dir: &Path) -> PathBuf {
        let path = manifest_path(dir, "add");
        ModuleManifest::new("add-key")
            .with_entry_point("triton_add", HostKernel::Add)
            .write_to(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_benchmark_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let task = add_task(&write_module(dir.path()));
        let latency = task.benchmark(&fast_runtime()).unwrap();
        assert!(latency.is_finite());
        assert!(latency > 0.0);
    }

    #[test]
    fn test_benchmark_with_precomputed_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let task = add_task(&write_module(dir.path()));
        let runtime = fast_runtime();
        let (inputs, outputs) = task.materialize(&runtime).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs.len(), 1);
        assert!(task.benchmark_with(&runtime, inputs, outputs).is_ok());
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_module(dir.path());
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![4]);
        let task = BenchmarkTask::new("add-key", path, "no_such_kernel", spec.clone(), spec);
        assert!(matches!(
            task.benchmark(&fast_runtime()),
            Err(KernelError::MissingEntryPoint { .. })
        ));
    }

    #[test]
    fn test_task_serde_and_display() {
        let task = add_task(Path::new("/tmp/add.json")).with_extra_arg("BLOCK", 128);
        let json = serde_json::to_string(&task).unwrap();
        let back: BenchmarkTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.inputs().len(), 2);
        assert_eq!(back.launch_config().num_stages, 2);
        assert_eq!(task.to_string(), "triton_add [add-key]");
    }
}
