//! Execution context used by `BenchmarkTask::benchmark` inside a worker.

use std::sync::Arc;

use crate::kernel::KernelLoader;
use crate::loader::{CachedLoader, DefaultLoader};
use crate::tensor::{HostAllocator, TensorAllocator};
use crate::timing::{BenchTimer, DeviceSync, HostDevice, Timer};

/// The collaborators a benchmark needs: a module loader, a tensor allocator,
/// a timer and a device synchronization primitive.
#[derive(Clone)]
pub struct Runtime {
    loader: Arc<dyn KernelLoader>,
    allocator: Arc<dyn TensorAllocator>,
    timer: Arc<dyn Timer>,
    device: Arc<dyn DeviceSync>,
}

impl Runtime {
    pub fn new(
        loader: Arc<dyn KernelLoader>,
        allocator: Arc<dyn TensorAllocator>,
        timer: Arc<dyn Timer>,
        device: Arc<dyn DeviceSync>,
    ) -> Self {
        Self {
            loader,
            allocator,
            timer,
            device,
        }
    }

    /// Host runtime: cached default loader, host allocator, default timer
    pub fn host() -> Self {
        Self::new(
            Arc::new(CachedLoader::new(DefaultLoader)),
            Arc::new(HostAllocator),
            Arc::new(BenchTimer::default()),
            Arc::new(HostDevice),
        )
    }

    pub fn with_loader(mut self, loader: Arc<dyn KernelLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn TensorAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceSync>) -> Self {
        self.device = device;
        self
    }

    pub fn loader(&self) -> &dyn KernelLoader {
        self.loader.as_ref()
    }

    pub fn allocator(&self) -> &dyn TensorAllocator {
        self.allocator.as_ref()
    }

    pub fn timer(&self) -> &dyn Timer {
        self.timer.as_ref()
    }

    pub fn device(&self) -> &dyn DeviceSync {
        self.device.as_ref()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::host()
    }
}
