//! # Host Tensors
//!
//! Worker-side tensors synthesized from a `TensorSpec`. Only the layout
//! matters for timing, so storage is filled with random values and never read
//! back by the parent.
//!
//! Storage is a `Vec<u64>` so every element type is suitably aligned; typed
//! views are produced with `bytemuck` casts. A view always starts at storage
//! element 0 and the buffer extends past the strided extent by the spec's
//! padding.

use bytemuck::Pod;
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::kernel::KernelError;
use crate::model::{storage_extent, DType, Device, TensorSpec};

/// Element types the host kernels can operate on.
pub trait Element: Pod + Send + Sync {
    const DTYPE: DType;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn random<R: Rng>(rng: &mut R) -> Self;
}

macro_rules! float_element {
    ($ty:ty, $dtype:expr, $to:expr, $from:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn to_f64(self) -> f64 {
                $to(self)
            }

            fn from_f64(value: f64) -> Self {
                $from(value)
            }

            fn random<R: Rng>(rng: &mut R) -> Self {
                Self::from_f64(rng.gen_range(-1.0..1.0))
            }
        }
    };
}

macro_rules! int_element {
    ($ty:ty, $dtype:expr, $lo:expr, $hi:expr) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }

            fn random<R: Rng>(rng: &mut R) -> Self {
                rng.gen_range($lo..$hi)
            }
        }
    };
}

float_element!(f32, DType::F32, |v: f32| v as f64, |v: f64| v as f32);
float_element!(f64, DType::F64, |v: f64| v, |v: f64| v);
float_element!(f16, DType::F16, f16::to_f64, f16::from_f64);
float_element!(bf16, DType::BF16, bf16::to_f64, bf16::from_f64);
int_element!(u8, DType::U8, 0, 16);
int_element!(i8, DType::I8, -8, 8);
int_element!(i32, DType::I32, -8, 8);
int_element!(i64, DType::I64, -8, 8);

/// Runs `$body` with `$T` bound to the Rust element type of `$dtype`.
macro_rules! with_element {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            $crate::model::DType::F32 => {
                type $T = f32;
                $body
            }
            $crate::model::DType::F64 => {
                type $T = f64;
                $body
            }
            $crate::model::DType::F16 => {
                type $T = half::f16;
                $body
            }
            $crate::model::DType::BF16 => {
                type $T = half::bf16;
                $body
            }
            $crate::model::DType::U8 => {
                type $T = u8;
                $body
            }
            $crate::model::DType::I8 => {
                type $T = i8;
                $body
            }
            $crate::model::DType::I32 => {
                type $T = i32;
                $body
            }
            $crate::model::DType::I64 => {
                type $T = i64;
                $body
            }
            other => Err($crate::kernel::KernelError::UnsupportedDtype(other)),
        }
    };
}
pub(crate) use with_element;

/// A strided tensor living in host memory.
#[derive(Debug, Clone)]
pub struct Tensor {
    device: Device,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    /// Storage length in elements, padding included
    len: usize,
    storage: Vec<u64>,
}

impl Tensor {
    /// Zero-filled tensor with the given layout and `pad_elements` of slack
    pub fn zeros(
        device: Device,
        dtype: DType,
        shape: &[usize],
        strides: &[usize],
        pad_elements: usize,
    ) -> Self {
        let len = storage_extent(shape, strides) + pad_elements;
        let words = (len * dtype.itemsize()).div_ceil(8);
        Self {
            device,
            dtype,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            len,
            storage: vec![0; words],
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Storage length in elements, padding included
    pub fn storage_len(&self) -> usize {
        self.len
    }

    /// Raw storage bytes
    pub fn bytes(&self) -> &[u8] {
        let bytes: &[u8] = bytemuck::cast_slice(&self.storage);
        &bytes[..self.len * self.dtype.itemsize()]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.len * self.dtype.itemsize();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.storage);
        &mut bytes[..end]
    }

    /// Typed view of the whole storage
    pub fn data<T: Element>(&self) -> Result<&[T], KernelError> {
        self.check_dtype::<T>()?;
        Ok(bytemuck::cast_slice(self.bytes()))
    }

    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T], KernelError> {
        self.check_dtype::<T>()?;
        Ok(bytemuck::cast_slice_mut(self.bytes_mut()))
    }

    /// Storage offsets of every logical element, in row-major order
    pub fn offsets(&self) -> StridedOffsets<'_> {
        StridedOffsets::new(&self.shape, &self.strides)
    }

    /// Logical elements in row-major order, converted to `f64`
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, KernelError> {
        with_element!(self.dtype, T => {
            let data = self.data::<T>()?;
            Ok(self.offsets().map(|offset| data[offset].to_f64()).collect())
        })
    }

    /// Overwrite the logical elements in row-major order
    pub fn copy_from_f64(&mut self, values: &[f64]) -> Result<(), KernelError> {
        if values.len() != self.numel() {
            return Err(KernelError::InvalidArgument(format!(
                "expected {} values, got {}",
                self.numel(),
                values.len()
            )));
        }
        let offsets: Vec<usize> = self.offsets().collect();
        with_element!(self.dtype, T => {
            let data = self.data_mut::<T>()?;
            for (offset, value) in offsets.into_iter().zip(values) {
                data[offset] = T::from_f64(*value);
            }
            Ok(())
        })
    }

    pub(crate) fn fill_random<R: Rng>(&mut self, rng: &mut R) -> Result<(), KernelError> {
        match self.dtype {
            DType::Bool => {
                self.bytes_mut().iter_mut().for_each(|b| *b = rng.gen_range(0..2));
                Ok(())
            }
            // Stay clear of the e4m3fn NaN encodings (0x7f / 0xff).
            DType::F8E4M3Fn => {
                self.bytes_mut().iter_mut().for_each(|b| *b = rng.gen::<u8>() & 0xbe);
                Ok(())
            }
            dtype => with_element!(dtype, T => {
                self.data_mut::<T>()?.iter_mut().for_each(|v| *v = T::random(&mut *rng));
                Ok(())
            }),
        }
    }

    fn check_dtype<T: Element>(&self) -> Result<(), KernelError> {
        if T::DTYPE != self.dtype {
            return Err(KernelError::DtypeMismatch {
                expected: T::DTYPE,
                found: self.dtype,
            });
        }
        Ok(())
    }
}

/// Iterator over the storage offsets of a strided view.
pub struct StridedOffsets<'a> {
    shape: &'a [usize],
    strides: &'a [usize],
    index: Vec<usize>,
    offset: usize,
    remaining: usize,
}

impl<'a> StridedOffsets<'a> {
    pub fn new(shape: &'a [usize], strides: &'a [usize]) -> Self {
        Self {
            shape,
            strides,
            index: vec![0; shape.len()],
            offset: 0,
            remaining: shape.iter().product(),
        }
    }
}

impl Iterator for StridedOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.offset;
        self.remaining -= 1;
        // Odometer increment, innermost dimension first
        for dim in (0..self.shape.len()).rev() {
            self.index[dim] += 1;
            self.offset += self.strides[dim];
            if self.index[dim] < self.shape[dim] {
                break;
            }
            self.offset -= self.strides[dim] * self.index[dim];
            self.index[dim] = 0;
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Allocates tensors with arbitrary strides.
pub trait TensorAllocator: Send + Sync {
    fn allocate(
        &self,
        shape: &[usize],
        strides: &[usize],
        device: Device,
        dtype: DType,
        pad_bytes: usize,
    ) -> Result<Tensor, KernelError>;
}

/// Allocator for host memory, filling storage with random values.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl TensorAllocator for HostAllocator {
    fn allocate(
        &self,
        shape: &[usize],
        strides: &[usize],
        device: Device,
        dtype: DType,
        pad_bytes: usize,
    ) -> Result<Tensor, KernelError> {
        if device != Device::Cpu {
            return Err(KernelError::UnsupportedDevice(device));
        }
        if shape.len() != strides.len() {
            return Err(KernelError::Allocation(format!(
                "rank mismatch: shape {:?}, strides {:?}",
                shape, strides
            )));
        }
        let pad_elements = pad_bytes.div_ceil(dtype.itemsize());
        let mut tensor = Tensor::zeros(device, dtype, shape, strides, pad_elements);
        tensor.fill_random(&mut StdRng::from_entropy())?;
        Ok(tensor)
    }
}

impl TensorSpec {
    /// Synthesize a tensor with this layout. Contents are arbitrary.
    pub fn materialize(&self, allocator: &dyn TensorAllocator) -> Result<Tensor, KernelError> {
        allocator.allocate(
            self.shape(),
            self.strides(),
            self.device(),
            self.dtype(),
            self.byte_offset(),
        )
    }
}
