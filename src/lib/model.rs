//! # Tensor Layout Data Model
//!
//! This module defines the layout descriptions that travel from the parent
//! process to a benchmark worker. They carry no tensor data, only enough
//! metadata (device, dtype, shape, strides, byte offset) for the worker to
//! synthesize an equivalent tensor with the same memory layout.
//!
//! - `DType` / `Device`: element type and placement tags.
//! - `TensorSpec`: the immutable layout of one tensor.
//! - `TensorSpecs`: one spec or an ordered list of them.
//! - `LayoutNode` / `SizeHints`: the compiler-side view used to capture specs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or capturing tensor layouts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("shape has rank {shape} but strides have rank {strides}")]
    RankMismatch { shape: usize, strides: usize },
    #[error("layout node has no dtype")]
    MissingDtype,
    #[error("no size hint for symbol '{0}'")]
    UnresolvedSymbol(String),
    #[error("invalid device '{0}'")]
    InvalidDevice(String),
}

/// Element type of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "float8_e4m3fn")]
    F8E4M3Fn,
}

impl DType {
    /// Size of one element in bytes
    pub fn itemsize(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 | DType::F8E4M3Fn => 1,
            DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    /// Whether the dtype is a floating point type
    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            DType::F16 | DType::BF16 | DType::F32 | DType::F64 | DType::F8E4M3Fn
        )
    }

    /// Canonical name, matching the serialized form
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::U8 => "uint8",
            DType::I8 => "int8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::F8E4M3Fn => "float8_e4m3fn",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Placement of a tensor. Serialized as `"cpu"` or `"cuda:<index>"`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| SpecError::InvalidDevice(other.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Semantic description of a tensor's memory layout.
///
/// A spec is immutable once built; `new` and deserialization both reject a
/// shape and stride list of different rank. The byte offset is the amount of
/// extra storage that must exist past the strided extent so any base-pointer
/// offset used by the captured layout stays in bounds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTensorSpec")]
pub struct TensorSpec {
    device: Device,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    byte_offset: usize,
}

#[derive(Deserialize)]
struct RawTensorSpec {
    device: Device,
    dtype: DType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    #[serde(default)]
    byte_offset: usize,
}

impl TryFrom<RawTensorSpec> for TensorSpec {
    type Error = SpecError;

    fn try_from(raw: RawTensorSpec) -> Result<Self, Self::Error> {
        TensorSpec::new(raw.device, raw.dtype, raw.shape, raw.strides)
            .map(|spec| spec.with_byte_offset(raw.byte_offset))
    }
}

impl TensorSpec {
    /// Create a spec with explicit strides
    pub fn new(
        device: Device,
        dtype: DType,
        shape: Vec<usize>,
        strides: Vec<usize>,
    ) -> Result<Self, SpecError> {
        if shape.len() != strides.len() {
            return Err(SpecError::RankMismatch {
                shape: shape.len(),
                strides: strides.len(),
            });
        }
        Ok(Self {
            device,
            dtype,
            shape,
            strides,
            byte_offset: 0,
        })
    }

    /// Create a row-major (contiguous) spec
    pub fn contiguous(device: Device, dtype: DType, shape: Vec<usize>) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            device,
            dtype,
            shape,
            strides,
            byte_offset: 0,
        }
    }

    /// Set the trailing padding in bytes
    pub fn with_byte_offset(mut self, byte_offset: usize) -> Self {
        self.byte_offset = byte_offset;
        self
    }

    /// Capture the layout of a compiler IR node, resolving symbolic sizes.
    pub fn capture(node: &dyn LayoutNode, hints: &dyn SizeHints) -> Result<Self, SpecError> {
        let dtype = node.dtype().ok_or(SpecError::MissingDtype)?;
        let shape = resolve_all(&node.size(), hints)?;
        let strides = resolve_all(&node.stride(), hints)?;
        // Layout offsets are expressed in elements.
        let offset = hints.size_hint(&node.layout_offset())?;
        Ok(TensorSpec::new(node.device(), dtype, shape, strides)?
            .with_byte_offset(offset * dtype.itemsize()))
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

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Number of logical elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of storage elements spanned by the strided view, padding excluded
    pub fn storage_extent(&self) -> usize {
        storage_extent(&self.shape, &self.strides)
    }

    /// Number of extra elements needed to cover `byte_offset`
    pub fn padding_elements(&self) -> usize {
        self.byte_offset.div_ceil(self.dtype.itemsize())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:?}/{:?}@{}",
            self.dtype, self.shape, self.strides, self.device
        )
    }
}

/// Row-major strides for `shape`
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1].max(1);
    }
    strides
}

/// Elements spanned by a strided view: `1 + sum((size - 1) * stride)`, or 0
/// for an empty view.
pub fn storage_extent(shape: &[usize], strides: &[usize]) -> usize {
    if shape.iter().any(|&size| size == 0) {
        return 0;
    }
    1 + shape
        .iter()
        .zip(strides)
        .map(|(&size, &stride)| (size - 1) * stride)
        .sum::<usize>()
}

/// Either a single tensor spec or an ordered list of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorSpecs {
    One(TensorSpec),
    Many(Vec<TensorSpec>),
}

impl TensorSpecs {
    /// Capture a single node
    pub fn capture_one(node: &dyn LayoutNode, hints: &dyn SizeHints) -> Result<Self, SpecError> {
        TensorSpec::capture(node, hints).map(TensorSpecs::One)
    }

    /// Capture a list of nodes, preserving order
    pub fn capture_many(
        nodes: &[&dyn LayoutNode],
        hints: &dyn SizeHints,
    ) -> Result<Self, SpecError> {
        nodes
            .iter()
            .map(|node| TensorSpec::capture(*node, hints))
            .collect::<Result<Vec<_>, _>>()
            .map(TensorSpecs::Many)
    }

    /// The specs in positional order
    pub fn as_slice(&self) -> &[TensorSpec] {
        match self {
            TensorSpecs::One(spec) => std::slice::from_ref(spec),
            TensorSpecs::Many(specs) => specs,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<TensorSpec> for TensorSpecs {
    fn from(spec: TensorSpec) -> Self {
        TensorSpecs::One(spec)
    }
}

impl From<Vec<TensorSpec>> for TensorSpecs {
    fn from(specs: Vec<TensorSpec>) -> Self {
        TensorSpecs::Many(specs)
    }
}

/// A size, stride or offset as reported by the compiler, possibly symbolic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Symbolic(String),
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Static(value)
    }
}

impl From<&str> for Dim {
    fn from(symbol: &str) -> Self {
        Dim::Symbolic(symbol.to_string())
    }
}

/// Compiler-side view of a buffer or layout, inspected at capture time in the
/// parent process only.
pub trait LayoutNode {
    fn device(&self) -> Device;
    fn dtype(&self) -> Option<DType>;
    fn size(&self) -> Vec<Dim>;
    fn stride(&self) -> Vec<Dim>;
    /// Offset of the first element, in elements
    fn layout_offset(&self) -> Dim;
}

/// Resolves symbolic dimensions to concrete hints.
pub trait SizeHints {
    fn size_hint(&self, dim: &Dim) -> Result<usize, SpecError>;
}

fn resolve_all(dims: &[Dim], hints: &dyn SizeHints) -> Result<Vec<usize>, SpecError> {
    dims.iter().map(|dim| hints.size_hint(dim)).collect()
}

/// Size hints backed by a symbol table, with an optional fallback for symbols
/// that have no recorded hint.
#[derive(Debug, Clone, Default)]
pub struct HintMap {
    hints: HashMap<String, usize>,
    fallback: Option<usize>,
}

impl HintMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hint for a symbol
    pub fn with_hint(mut self, symbol: impl Into<String>, value: usize) -> Self {
        self.hints.insert(symbol.into(), value);
        self
    }

    /// Hint used for unknown symbols
    pub fn with_fallback(mut self, value: usize) -> Self {
        self.fallback = Some(value);
        self
    }
}

impl SizeHints for HintMap {
    fn size_hint(&self, dim: &Dim) -> Result<usize, SpecError> {
        match dim {
            Dim::Static(value) => Ok(*value),
            Dim::Symbolic(symbol) => self
                .hints
                .get(symbol)
                .copied()
                .or(self.fallback)
                .ok_or_else(|| SpecError::UnresolvedSymbol(symbol.clone())),
        }
    }
}
