//! Backend seam.
//!
//! A [`Backend`] executes one layer at a time. It receives the layer's input
//! tensors and an [`ExecutionContext`] through which it obtains storage for
//! its result and for any scratch memory, so every buffer it touches is
//! accounted by the variable store's allocators.

use crate::error::Result;
use crate::store::Allocators;
use cairn_core::{
    AllocationScope, BufferFactory, DataType, DeviceType, Layer, Shape, Tensor,
};
use std::fmt;
use std::sync::Arc;

/// Device-specific executor of a single layer.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Device this backend computes on and allocates for.
    fn device(&self) -> DeviceType;

    /// Factory for new buffers on [`Backend::device`].
    fn buffer_factory(&self) -> Arc<dyn BufferFactory>;

    /// Whether this backend can execute layers of `op_type`.
    fn supports(&self, op_type: &str) -> bool;

    /// Execute `layer` and return its output tensor.
    ///
    /// `inputs` follows `layer.inputs`; empty slots are `None`. The output
    /// must be obtained from `ctx` with persistent scope (or be an alias of an
    /// input); returning an ephemeral scratch tensor is an error.
    fn execute(
        &self,
        layer: &Layer,
        inputs: &[Option<Tensor>],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Tensor>;

    /// Wait for device work producing `tensor`.
    ///
    /// With `blocking` false the backend may only submit outstanding work.
    fn flush(&self, tensor: &Tensor, blocking: bool) -> Result<()> {
        let _ = (tensor, blocking);
        Ok(())
    }
}

/// Per-layer allocation handle given to [`Backend::execute`].
pub struct ExecutionContext<'a> {
    layer_index: usize,
    device: DeviceType,
    requires_storage: bool,
    allocators: &'a mut Allocators,
    scratch: Vec<Tensor>,
    /// Persistent-scope tensors and owned views handed out so far.
    allocated: Vec<Tensor>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        layer_index: usize,
        device: DeviceType,
        requires_storage: bool,
        allocators: &'a mut Allocators,
    ) -> Self {
        Self {
            layer_index,
            device,
            requires_storage,
            allocators,
            scratch: Vec::new(),
            allocated: Vec::new(),
        }
    }

    /// Position of the executing layer.
    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    /// Whether the layer's output must outlive the next hop.
    pub fn requires_storage(&self) -> bool {
        self.requires_storage
    }

    /// Allocate a tensor on the backend's device.
    ///
    /// Ephemeral tensors are released as soon as the layer finishes.
    pub fn alloc(
        &mut self,
        shape: impl Into<Shape>,
        dtype: DataType,
        scope: AllocationScope,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let allocator = self.allocators.route(scope, self.requires_storage);
        let tensor = allocator.alloc(&shape, dtype, self.device, scope)?;
        match scope {
            AllocationScope::Ephemeral => self.scratch.push(tensor.clone()),
            AllocationScope::Persistent => self.allocated.push(tensor.clone()),
        }
        Ok(tensor)
    }

    /// Allocate the layer's output.
    pub fn alloc_output(&mut self, shape: impl Into<Shape>, dtype: DataType) -> Result<Tensor> {
        self.alloc(shape, dtype, AllocationScope::Persistent)
    }

    /// Allocate layer-local scratch.
    pub fn alloc_scratch(&mut self, shape: impl Into<Shape>, dtype: DataType) -> Result<Tensor> {
        self.alloc(shape, dtype, AllocationScope::Ephemeral)
    }

    /// Create a view of `source` with a new shape, sharing its buffer.
    ///
    /// Views of allocator-owned tensors add a share to the buffer so it stays
    /// alive when `source` is released. Views of external tensors stay
    /// external.
    ///
    /// # Errors
    /// Returns an error if `source` is invalidated or its buffer is too small.
    pub fn alias(&mut self, source: &Tensor, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        let buffer = source
            .buffer()
            .ok_or(cairn_core::Error::Invalidated(source.id()))?;
        let owner = source
            .owner()
            .and_then(|owner| self.allocators.by_owner(owner));
        match owner {
            Some(allocator) => {
                let view = allocator.alloc_with_buffer(
                    &shape,
                    source.dtype(),
                    &buffer,
                    AllocationScope::Persistent,
                )?;
                self.allocated.push(view.clone());
                Ok(view)
            }
            None => Ok(Tensor::bound(shape, source.dtype(), buffer, None)?),
        }
    }

    /// Scratch tensors and persistent allocations, in that order.
    pub(crate) fn into_allocations(self) -> (Vec<Tensor>, Vec<Tensor>) {
        (self.scratch, self.allocated)
    }
}

impl fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("layer_index", &self.layer_index)
            .field("device", &self.device)
            .field("requires_storage", &self.requires_storage)
            .field("scratch", &self.scratch.len())
            .field("allocated", &self.allocated.len())
            .finish()
    }
}
