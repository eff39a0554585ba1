//! # Module Loaders
//!
//! Loaders resolve a `(cache key, path)` pair to a `KernelModule` inside the
//! benchmark worker.
//!
//! - `ManifestLoader`: JSON manifest mapping entry points to builtin host
//!   kernels. The manifest records the cache key it was written for.
//! - `DylibLoader`: a shared library whose entry points are `extern "C"`
//!   symbols taking a `RawLaunch` descriptor.
//! - `CachedLoader`: memoizes modules by cache key.
//! - `DefaultLoader`: picks dylib or manifest from the file extension.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{c_char, c_void, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kernel::{
    BuiltinModule, HostKernel, Kernel, KernelError, KernelLoader, KernelModule, LaunchArgs,
};
use crate::model::DType;
use crate::tensor::Tensor;

/// On-disk description of a builtin-kernel module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub cache_key: String,
    pub entry_points: BTreeMap<String, HostKernel>,
}

impl ModuleManifest {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            entry_points: BTreeMap::new(),
        }
    }

    pub fn with_entry_point(mut self, name: impl Into<String>, kernel: HostKernel) -> Self {
        self.entry_points.insert(name.into(), kernel);
        self
    }

    /// Write the manifest as pretty JSON
    pub fn write_to(&self, path: &Path) -> Result<(), KernelError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| load_error(path, e))?;
        fs::write(path, json).map_err(|e| load_error(path, e))
    }
}

fn load_error(path: &Path, reason: impl ToString) -> KernelError {
    KernelError::Load {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Loads JSON manifests of builtin host kernels.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestLoader;

impl KernelLoader for ManifestLoader {
    fn load(&self, cache_key: &str, path: &Path) -> Result<Arc<dyn KernelModule>, KernelError> {
        let text = fs::read_to_string(path).map_err(|e| load_error(path, e))?;
        let manifest: ModuleManifest =
            serde_json::from_str(&text).map_err(|e| load_error(path, e))?;
        if manifest.cache_key != cache_key {
            return Err(KernelError::StaleModule {
                path: path.to_path_buf(),
                expected: cache_key.to_string(),
                found: manifest.cache_key,
            });
        }
        let module = manifest.entry_points.into_iter().fold(
            BuiltinModule::new(module_name(path)),
            |module, (name, kernel)| module.with_entry_point(name, kernel),
        );
        Ok(Arc::new(module))
    }
}

/// Tensor descriptor handed to shared-library kernels.
#[repr(C)]
#[derive(Debug)]
pub struct RawTensor {
    pub data: *mut c_void,
    pub dtype: u32,
    pub ndim: u32,
    pub shape: *const i64,
    pub strides: *const i64,
}

/// Launch descriptor handed to shared-library kernels. Inputs must be treated
/// as read-only.
#[repr(C)]
#[derive(Debug)]
pub struct RawLaunch {
    pub inputs: *const RawTensor,
    pub num_inputs: u32,
    pub outputs: *const RawTensor,
    pub num_outputs: u32,
    pub grid: [u32; 3],
    pub num_stages: u32,
    pub num_warps: u32,
    /// NUL-terminated JSON object of the extra launch arguments
    pub extra_json: *const c_char,
}

/// Signature of a shared-library entry point. Zero means success.
pub type RawKernelFn = unsafe extern "C" fn(launch: *const RawLaunch) -> i32;

/// Stable numeric code for a dtype in `RawTensor::dtype`
pub fn raw_dtype_code(dtype: DType) -> u32 {
    match dtype {
        DType::Bool => 0,
        DType::U8 => 1,
        DType::I8 => 2,
        DType::I32 => 3,
        DType::I64 => 4,
        DType::F16 => 5,
        DType::BF16 => 6,
        DType::F32 => 7,
        DType::F64 => 8,
        DType::F8E4M3Fn => 9,
    }
}

/// Loads kernels from shared libraries.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

struct DylibModule {
    name: String,
    library: Arc<Library>,
}

struct DylibKernel {
    name: String,
    func: RawKernelFn,
    // Keeps `func` mapped. `None` for functions linked into this binary.
    _library: Option<Arc<Library>>,
}

impl DylibKernel {
    fn new(name: impl Into<String>, func: RawKernelFn, library: Option<Arc<Library>>) -> Self {
        Self {
            name: name.into(),
            func,
            _library: library,
        }
    }
}

impl KernelLoader for DylibLoader {
    fn load(&self, _cache_key: &str, path: &Path) -> Result<Arc<dyn KernelModule>, KernelError> {
        // SAFETY: loading runs the library's initializers; modules are
        // produced by the kernel compiler and trusted to the same degree as
        // the kernels themselves.
        let library = unsafe { Library::new(path) }.map_err(|e| load_error(path, e))?;
        Ok(Arc::new(DylibModule {
            name: module_name(path),
            library: Arc::new(library),
        }))
    }
}

impl KernelModule for DylibModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn entry_point(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        // SAFETY: entry points are required to have the `RawKernelFn` ABI.
        let func = unsafe { self.library.get::<RawKernelFn>(name.as_bytes()) }.ok()?;
        Some(Arc::new(DylibKernel::new(name, *func, Some(self.library.clone()))))
    }
}

struct RawLayout {
    shape: Vec<i64>,
    strides: Vec<i64>,
}

impl RawLayout {
    fn of(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().iter().map(|&d| d as i64).collect(),
            strides: tensor.strides().iter().map(|&s| s as i64).collect(),
        }
    }

    fn describe(&self, tensor: &Tensor, data: *mut c_void) -> RawTensor {
        RawTensor {
            data,
            dtype: raw_dtype_code(tensor.dtype()),
            ndim: self.shape.len() as u32,
            shape: self.shape.as_ptr(),
            strides: self.strides.as_ptr(),
        }
    }
}

impl Kernel for DylibKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, args: &mut LaunchArgs<'_>) -> Result<(), KernelError> {
        let extra = serde_json::to_string(args.extra)
            .map_err(|e| KernelError::InvalidArgument(e.to_string()))?;
        let extra = CString::new(extra).map_err(|e| KernelError::InvalidArgument(e.to_string()))?;

        let input_layouts: Vec<RawLayout> = args.inputs.iter().map(RawLayout::of).collect();
        let output_layouts: Vec<RawLayout> = args.outputs.iter().map(RawLayout::of).collect();
        let inputs: Vec<RawTensor> = args
            .inputs
            .iter()
            .zip(&input_layouts)
            .map(|(t, layout)| layout.describe(t, t.bytes().as_ptr() as *mut c_void))
            .collect();
        let outputs: Vec<RawTensor> = args
            .outputs
            .iter_mut()
            .zip(&output_layouts)
            .map(|(t, layout)| {
                let data = t.bytes_mut().as_mut_ptr() as *mut c_void;
                layout.describe(t, data)
            })
            .collect();

        let launch = RawLaunch {
            inputs: inputs.as_ptr(),
            num_inputs: inputs.len() as u32,
            outputs: outputs.as_ptr(),
            num_outputs: outputs.len() as u32,
            grid: args.config.grid3(),
            num_stages: args.config.num_stages,
            num_warps: args.config.num_warps,
            extra_json: extra.as_ptr(),
        };
        // SAFETY: every pointer in `launch` outlives the call.
        let status = unsafe { (self.func)(&launch) };
        if status != 0 {
            return Err(KernelError::Launch {
                kernel: self.name.clone(),
                status,
            });
        }
        Ok(())
    }
}

/// Memoizes modules by cache key, so each module is loaded at most once per
/// process.
pub struct CachedLoader<L> {
    inner: L,
    modules: Mutex<HashMap<String, Arc<dyn KernelModule>>>,
}

impl<L: KernelLoader> CachedLoader<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached modules
    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<L: KernelLoader> KernelLoader for CachedLoader<L> {
    fn load(&self, cache_key: &str, path: &Path) -> Result<Arc<dyn KernelModule>, KernelError> {
        if let Some(module) = self.modules.lock().get(cache_key) {
            return Ok(module.clone());
        }
        debug!("Loading module {} from {:?}", cache_key, path);
        let module = self.inner.load(cache_key, path)?;
        self.modules
            .lock()
            .insert(cache_key.to_string(), module.clone());
        Ok(module)
    }
}

/// Shared libraries go through `DylibLoader`, anything else is read as a
/// manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoader;

impl DefaultLoader {
    pub fn is_shared_library(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("so" | "dylib" | "dll")
        )
    }
}

impl KernelLoader for DefaultLoader {
    fn load(&self, cache_key: &str, path: &Path) -> Result<Arc<dyn KernelModule>, KernelError> {
        if Self::is_shared_library(path) {
            DylibLoader.load(cache_key, path)
        } else {
            ManifestLoader.load(cache_key, path)
        }
    }
}

/// Path of `name` inside `dir`, for writing manifests next to compiled code
pub fn manifest_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}
