//! Tensor container backed by owned storage or a slice of a device arena.

use std::cell::UnsafeCell;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::dtype::{DType, Element};
use super::location::MemoryInfo;

/// One contiguous device buffer shared by every arena-placed tensor of a run.
///
/// Distinct tensors view disjoint `(offset, nbytes)` ranges and the scheduler
/// orders producer writes before consumer reads, so the aliasing is never
/// observed concurrently on overlapping bytes.
pub struct ArenaBuffer {
    words: UnsafeCell<Box<[u64]>>,
    nbytes: usize,
}

unsafe impl Send for ArenaBuffer {}
unsafe impl Sync for ArenaBuffer {}

impl ArenaBuffer {
    pub fn new(nbytes: usize) -> Self {
        let words = vec![0u64; nbytes.div_ceil(8)].into_boxed_slice();
        Self {
            words: UnsafeCell::new(words),
            nbytes,
        }
    }

    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    fn base_ptr(&self) -> *mut u8 {
        unsafe { (*self.words.get()).as_mut_ptr() as *mut u8 }
    }
}

impl std::fmt::Debug for ArenaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaBuffer").field("nbytes", &self.nbytes).finish()
    }
}

enum TensorStorage {
    Owned { words: Box<[u64]> },
    Arena {
        arena: Arc<ArenaBuffer>,
        offset: usize,
    },
}

/// Dense tensor with dtype, shape, storage, and a device location.
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    nbytes: usize,
    storage: TensorStorage,
    location: MemoryInfo,
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl Tensor {
    /// Zero-filled tensor with owned storage at the CPU default location.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        Self::zeros_at(dtype, shape, MemoryInfo::cpu_default())
    }

    /// Zero-filled tensor with owned storage at an explicit location.
    pub fn zeros_at(dtype: DType, shape: &[usize], location: MemoryInfo) -> Self {
        let nbytes = numel(shape) * dtype.size();
        Tensor {
            dtype,
            shape: shape.to_vec(),
            nbytes,
            storage: TensorStorage::Owned {
                words: vec![0u64; nbytes.div_ceil(8)].into_boxed_slice(),
            },
            location,
        }
    }

    /// Build a tensor from a flat typed vector.
    ///
    /// # Example
    /// ```
    /// # use graphinfer::Tensor;
    /// # fn main() -> anyhow::Result<()> {
    /// let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0], &[3])?;
    /// assert_eq!(t.numel(), 3);
    /// # Ok(()) }
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        if data.len() != numel(shape) {
            return Err(anyhow!(
                "data length {} does not match shape {:?}",
                data.len(),
                shape
            ));
        }
        let mut tensor = Self::zeros(T::DTYPE, shape);
        tensor.as_bytes_mut().copy_from_slice(bytemuck::cast_slice(&data));
        Ok(tensor)
    }

    /// Rank-0 scalar tensor.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut tensor = Self::zeros(T::DTYPE, &[]);
        tensor.as_bytes_mut().copy_from_slice(bytemuck::bytes_of(&value));
        tensor
    }

    /// Tensor viewing `nbytes` of `arena` starting at `offset`.
    ///
    /// `offset` must be 8-byte aligned and the range must lie inside the
    /// arena; both are enforced when the memory pattern is realized.
    pub fn from_arena(
        dtype: DType,
        shape: &[usize],
        arena: Arc<ArenaBuffer>,
        offset: usize,
        location: MemoryInfo,
    ) -> Result<Self> {
        let nbytes = numel(shape) * dtype.size();
        if offset % 8 != 0 {
            return Err(anyhow!("arena offset {} is not aligned", offset));
        }
        if offset + nbytes > arena.len() {
            return Err(anyhow!(
                "arena slice {}..{} exceeds buffer of {} bytes",
                offset,
                offset + nbytes,
                arena.len()
            ));
        }
        Ok(Tensor {
            dtype,
            shape: shape.to_vec(),
            nbytes,
            storage: TensorStorage::Arena { arena, offset },
            location,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn location(&self) -> MemoryInfo {
        self.location
    }

    pub fn set_location(&mut self, location: MemoryInfo) {
        self.location = location;
    }

    /// Reinterpret the shape without touching storage.
    pub fn reshape(&mut self, shape: &[usize]) -> Result<()> {
        if numel(shape) != self.numel() {
            return Err(anyhow!(
                "cannot reshape {:?} into {:?}",
                self.shape,
                shape
            ));
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            TensorStorage::Owned { words } => {
                &bytemuck::cast_slice::<u64, u8>(&words[..])[..self.nbytes]
            }
            TensorStorage::Arena { arena, offset } => unsafe {
                std::slice::from_raw_parts(arena.base_ptr().add(*offset), self.nbytes)
            },
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes;
        match &mut self.storage {
            TensorStorage::Owned { words } => {
                &mut bytemuck::cast_slice_mut::<u64, u8>(&mut words[..])[..nbytes]
            }
            TensorStorage::Arena { arena, offset } => unsafe {
                std::slice::from_raw_parts_mut(arena.base_ptr().add(*offset), nbytes)
            },
        }
    }

    /// Typed view of the element data.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if T::DTYPE != self.dtype {
            return Err(anyhow!(
                "tensor is {} but {} was requested",
                self.dtype,
                T::DTYPE
            ));
        }
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|err| anyhow!("tensor cast: {}", err))
    }

    /// Typed mutable view of the element data.
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        if T::DTYPE != self.dtype {
            return Err(anyhow!(
                "tensor is {} but {} was requested",
                self.dtype,
                T::DTYPE
            ));
        }
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|err| anyhow!("tensor cast: {}", err))
    }

    /// Collect the element data into a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// Read element `index` widened to f64, for any dtype.
    pub fn value_f64(&self, index: usize) -> Result<f64> {
        if index >= self.numel() {
            return Err(anyhow!("index {} out of bounds for {:?}", index, self.shape));
        }
        Ok(match self.dtype {
            DType::F32 => self.as_slice::<f32>()?[index] as f64,
            DType::F64 => self.as_slice::<f64>()?[index],
            DType::I32 => self.as_slice::<i32>()?[index] as f64,
            DType::I64 => self.as_slice::<i64>()?[index] as f64,
        })
    }

    /// Read a single-element tensor widened to i64.
    pub fn scalar_i64(&self) -> Result<i64> {
        if self.numel() != 1 {
            return Err(anyhow!("expected scalar, got shape {:?}", self.shape));
        }
        Ok(match self.dtype {
            DType::F32 => self.as_slice::<f32>()?[0] as i64,
            DType::F64 => self.as_slice::<f64>()?[0] as i64,
            DType::I32 => self.as_slice::<i32>()?[0] as i64,
            DType::I64 => self.as_slice::<i64>()?[0],
        })
    }
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        let mut out = Tensor::zeros_at(self.dtype, &self.shape, self.location);
        out.as_bytes_mut().copy_from_slice(self.as_bytes());
        out
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.shape == other.shape
            && self.as_bytes() == other.as_bytes()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("location", &self.location)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TensorDataRepr {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    data: TensorDataRepr,
}

impl From<Tensor> for TensorRepr {
    fn from(tensor: Tensor) -> Self {
        let data = match tensor.dtype {
            DType::F32 => TensorDataRepr::F32(tensor.to_vec().unwrap_or_default()),
            DType::F64 => TensorDataRepr::F64(tensor.to_vec().unwrap_or_default()),
            DType::I32 => TensorDataRepr::I32(tensor.to_vec().unwrap_or_default()),
            DType::I64 => TensorDataRepr::I64(tensor.to_vec().unwrap_or_default()),
        };
        TensorRepr {
            shape: tensor.shape.clone(),
            data,
        }
    }
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = anyhow::Error;

    fn try_from(repr: TensorRepr) -> Result<Self> {
        match repr.data {
            TensorDataRepr::F32(data) => Tensor::from_vec(data, &repr.shape),
            TensorDataRepr::F64(data) => Tensor::from_vec(data, &repr.shape),
            TensorDataRepr::I32(data) => Tensor::from_vec(data, &repr.shape),
            TensorDataRepr::I64(data) => Tensor::from_vec(data, &repr.shape),
        }
    }
}

impl Serialize for Tensor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TensorRepr::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = TensorRepr::deserialize(deserializer)?;
        Tensor::try_from(repr).map_err(serde::de::Error::custom)
    }
}
