//! Logical tensor handles.
//!
//! A [`Tensor`] is cheap to clone: clones share one binding, so every holder
//! observes when an allocator detaches the tensor from its buffer. A tensor
//! without a buffer is *invalidated* and must not be read.

use crate::buffer::Buffer;
use crate::types::{DataType, DeviceType, Shape};
use crate::{Error, Result};
use bytemuck::Pod;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical tensor, shared by all its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.0)
    }
}

/// Identity of the allocator that owns a tensor's buffer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(u64);

impl AllocatorId {
    /// Reserve a fresh allocator identity.
    pub fn next() -> Self {
        Self(NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alloc#{}", self.0)
    }
}

/// Rust element types that map onto a [`DataType`].
pub trait Element: Pod {
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}

impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}

impl Element for u32 {
    const DTYPE: DataType = DataType::U32;
}

impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

#[derive(Debug)]
struct Binding {
    buffer: Option<Arc<Buffer>>,
    owner: Option<AllocatorId>,
    device: DeviceType,
}

#[derive(Debug)]
struct TensorInner {
    id: TensorId,
    shape: Shape,
    dtype: DataType,
    binding: Mutex<Binding>,
}

/// Logical tensor: shape, element type, device and an optional buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Tensor {
    fn with_binding(shape: Shape, dtype: DataType, binding: Binding) -> Self {
        Self {
            inner: Arc::new(TensorInner {
                id: TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)),
                shape,
                dtype,
                binding: Mutex::new(binding),
            }),
        }
    }

    /// Create a tensor that is not bound to any buffer.
    pub fn unbound(shape: impl Into<Shape>, dtype: DataType, device: DeviceType) -> Self {
        Self::with_binding(
            shape.into(),
            dtype,
            Binding {
                buffer: None,
                owner: None,
                device,
            },
        )
    }

    /// Create a tensor viewing `buffer`.
    ///
    /// # Errors
    /// Returns `Error::Shape` if the buffer is too small for the shape.
    pub fn bound(
        shape: impl Into<Shape>,
        dtype: DataType,
        buffer: Arc<Buffer>,
        owner: Option<AllocatorId>,
    ) -> Result<Self> {
        let shape = shape.into();
        let required = shape.byte_len(dtype);
        if buffer.capacity() < required {
            return Err(Error::Shape(format!(
                "{} holds {} bytes but shape {shape} of {dtype:?} needs {required}",
                buffer.id(),
                buffer.capacity()
            )));
        }
        let device = buffer.device();
        Ok(Self::with_binding(
            shape,
            dtype,
            Binding {
                buffer: Some(buffer),
                owner,
                device,
            },
        ))
    }

    /// Create an externally owned host tensor from a vector.
    ///
    /// # Errors
    /// Returns `Error::Shape` if the data length doesn't match the shape.
    ///
    /// # Example
    /// ```
    /// # use cairn_core::Tensor;
    /// let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2]).unwrap();
    /// assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    /// ```
    pub fn from_vec<T: Element>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(Error::Shape(format!(
                "Data length {} doesn't match shape {shape} (expected {})",
                data.len(),
                shape.numel()
            )));
        }
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let buffer = Buffer::host(bytes.len());
        buffer.write(bytes)?;
        Self::bound(shape, T::DTYPE, Arc::new(buffer), None)
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.inner
            .binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DataType {
        self.inner.dtype
    }

    pub fn device(&self) -> DeviceType {
        self.binding().device
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.inner.shape.numel()
    }

    /// Number of bytes the tensor's elements occupy.
    pub fn byte_len(&self) -> usize {
        self.inner.shape.byte_len(self.inner.dtype)
    }

    /// The bound buffer, or `None` if the tensor has been invalidated.
    pub fn buffer(&self) -> Option<Arc<Buffer>> {
        self.binding().buffer.clone()
    }

    /// Allocator that tracks this tensor, `None` for external tensors.
    pub fn owner(&self) -> Option<AllocatorId> {
        self.binding().owner
    }

    pub fn is_invalidated(&self) -> bool {
        self.binding().buffer.is_none()
    }

    /// Whether both tensors are bound to the same physical buffer.
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        match (self.buffer(), other.buffer()) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Point this tensor at `buffer` and record its owner.
    ///
    /// Bookkeeping is the caller's responsibility; allocators use this to
    /// re-bind tensors they track.
    pub fn attach(&self, buffer: Arc<Buffer>, owner: Option<AllocatorId>) {
        let mut binding = self.binding();
        binding.device = buffer.device();
        binding.buffer = Some(buffer);
        binding.owner = owner;
    }

    /// Drop the buffer reference, invalidating the tensor.
    pub fn detach(&self) -> Option<Arc<Buffer>> {
        let mut binding = self.binding();
        binding.owner = None;
        binding.buffer.take()
    }

    /// Change the recorded owner without touching the buffer.
    pub fn set_owner(&self, owner: Option<AllocatorId>) {
        self.binding().owner = owner;
    }

    /// Copy the tensor's bytes back to the host.
    ///
    /// # Errors
    /// Returns `Error::Invalidated` if no buffer is bound.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let buffer = self.buffer().ok_or(Error::Invalidated(self.id()))?;
        buffer.read(self.byte_len())
    }

    /// Copy the tensor's elements into a vector.
    ///
    /// # Errors
    /// Returns an error if the element type doesn't match or the tensor is invalidated.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let bytes = self.read_bytes()?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Overwrite the tensor's elements.
    ///
    /// # Errors
    /// Returns an error on type or length mismatch, or if the tensor is invalidated.
    pub fn write_slice<T: Element>(&self, data: &[T]) -> Result<()> {
        self.check_dtype::<T>()?;
        if data.len() != self.numel() {
            return Err(Error::Shape(format!(
                "cannot write {} elements into tensor of shape {}",
                data.len(),
                self.shape()
            )));
        }
        let buffer = self.buffer().ok_or(Error::Invalidated(self.id()))?;
        buffer.write(bytemuck::cast_slice(data))
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype() {
            return Err(Error::DataType {
                expected: self.dtype(),
                found: T::DTYPE,
            });
        }
        Ok(())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Tensor {}
