//! Variable store.
//!
//! Owns the mapping from names to live tensors for one session. Caller inputs,
//! produced layer outputs and the single temporary slot are kept apart; model
//! constants are read straight from the model and never released.
//!
//! The allocation policy is a plain value: [`AllocationPolicy::ThreeTier`]
//! adds ping-pong and ephemeral allocators next to the persistent one, the
//! other policies route everything through the persistent allocator.

use crate::allocator::{AllocatorStats, CachePolicy, TensorAllocator};
use crate::backend::ExecutionContext;
use crate::config::{AllocationPolicy, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::footprint::StorageAnalysis;
use crate::liveness::LivenessPlan;
use cairn_core::{
    AllocationScope, AllocatorId, BufferFactory, DeviceType, Layer, Model, Shape, Tensor,
};
use std::collections::HashMap;
use std::sync::Arc;

/// The allocators behind a store.
#[derive(Debug)]
pub(crate) struct Allocators {
    persistent: TensorAllocator,
    ping_pong: Option<TensorAllocator>,
    ephemeral: Option<TensorAllocator>,
}

impl Allocators {
    fn new(
        policy: AllocationPolicy,
        cache: CachePolicy,
        factories: &[Arc<dyn BufferFactory>],
    ) -> Self {
        let make = |label: &str| TensorAllocator::new(label, cache, factories.to_vec());
        match policy {
            AllocationPolicy::ThreeTier => Self {
                persistent: make("persistent"),
                ping_pong: Some(make("ping-pong")),
                ephemeral: Some(make("ephemeral")),
            },
            AllocationPolicy::AlwaysPersist | AllocationPolicy::SingleSlotReuse => Self {
                persistent: make("persistent"),
                ping_pong: None,
                ephemeral: None,
            },
        }
    }

    /// Pick the allocator for a request from the executing layer.
    pub(crate) fn route(
        &mut self,
        scope: AllocationScope,
        requires_storage: bool,
    ) -> &mut TensorAllocator {
        match scope {
            AllocationScope::Ephemeral => match self.ephemeral.as_mut() {
                Some(allocator) => allocator,
                None => &mut self.persistent,
            },
            AllocationScope::Persistent if !requires_storage => match self.ping_pong.as_mut() {
                Some(allocator) => allocator,
                None => &mut self.persistent,
            },
            AllocationScope::Persistent => &mut self.persistent,
        }
    }

    pub(crate) fn by_owner(&mut self, owner: AllocatorId) -> Option<&mut TensorAllocator> {
        self.iter_mut().find(|allocator| allocator.id() == owner)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut TensorAllocator> {
        std::iter::once(&mut self.persistent)
            .chain(self.ping_pong.as_mut())
            .chain(self.ephemeral.as_mut())
    }

    /// Release through the owning allocator. Returns false for tensors no
    /// allocator here owns, which are left untouched.
    fn release(&mut self, tensor: &Tensor, explicit: bool) -> bool {
        match tensor.owner().and_then(|owner| self.by_owner(owner)) {
            Some(allocator) => {
                allocator.release(tensor, explicit);
                true
            }
            None => false,
        }
    }

    fn is_ephemeral(&self, tensor: &Tensor) -> bool {
        self.ephemeral
            .as_ref()
            .is_some_and(|allocator| tensor.owner() == Some(allocator.id()))
    }
}

/// Plan state for one (model, input shapes) pair.
#[derive(Debug)]
struct Prepared {
    model: Arc<Model>,
    shapes: Arc<HashMap<String, Shape>>,
    plan: LivenessPlan,
    requires_storage: Vec<bool>,
}

/// Allocator statistics for every allocator of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub persistent: AllocatorStats,
    pub ping_pong: Option<AllocatorStats>,
    pub ephemeral: Option<AllocatorStats>,
    /// Produced tensors currently bound by name (temporary slot included).
    pub bindings: usize,
}

impl StoreStats {
    /// Figures summed over all allocators.
    pub fn total(&self) -> AllocatorStats {
        let mut total = self.persistent;
        for stats in self.ping_pong.iter().chain(self.ephemeral.iter()) {
            total.merge(stats);
        }
        total
    }
}

/// Outcome of tearing a store down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Produced tensors released during teardown.
    pub released: usize,
    /// Layers whose output was never stored in the last run.
    pub unvisited_layers: Vec<String>,
}

/// Binds names to tensors and applies the allocation policy.
#[derive(Debug)]
pub struct VariableStore {
    policy: AllocationPolicy,
    keep_cache: bool,
    verbose_teardown: bool,
    allocators: Allocators,
    /// Caller-supplied inputs.
    inputs: HashMap<String, Tensor>,
    /// Allocator-owned wrappers of adopted caller inputs.
    adopted: HashMap<String, Tensor>,
    takeover: bool,
    /// Produced layer outputs.
    bindings: HashMap<String, Tensor>,
    /// Single-slot reuse: the latest output that needs no storage.
    temporary: Option<(String, Tensor)>,
    prepared: Option<Prepared>,
    plan_generation: usize,
    visited: Vec<bool>,
    last_output: Option<(usize, Tensor)>,
    occupied: bool,
}

impl VariableStore {
    /// Create a store drawing buffers from `factories`, one per device.
    pub fn new(config: &RuntimeConfig, factories: Vec<Arc<dyn BufferFactory>>) -> Self {
        Self {
            policy: config.policy,
            keep_cache: config.keep_cache_between_runs,
            verbose_teardown: config.verbose_teardown,
            allocators: Allocators::new(config.policy, config.cache, &factories),
            inputs: HashMap::new(),
            adopted: HashMap::new(),
            takeover: false,
            bindings: HashMap::new(),
            temporary: None,
            prepared: None,
            plan_generation: 0,
            visited: Vec::new(),
            last_output: None,
            occupied: false,
        }
    }

    pub fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    /// Bind a caller-supplied input.
    ///
    /// A tensor produced by this store (e.g. the previous run's output) is
    /// waived first so the next run's reset cannot invalidate it.
    pub fn set_input(&mut self, name: &str, tensor: Tensor) -> Result<()> {
        if let Some(allocator) = tensor.owner().and_then(|owner| self.allocators.by_owner(owner)) {
            allocator.waive_ownership(&tensor)?;
            self.forget(&tensor);
        }
        if let Some(previous) = self.adopted.remove(name) {
            self.allocators.release(&previous, true);
        }
        tracing::trace!(input = name, tensor = %tensor.id(), shape = %tensor.shape(), "bound input");
        self.inputs.insert(name.to_string(), tensor);
        Ok(())
    }

    fn forget(&mut self, tensor: &Tensor) {
        self.bindings.retain(|_, bound| bound.id() != tensor.id());
        if self
            .temporary
            .as_ref()
            .is_some_and(|(_, bound)| bound.id() == tensor.id())
        {
            self.temporary = None;
        }
    }

    /// Validate input bindings and rebuild the liveness plan if stale.
    ///
    /// Every model input must be bound to a tensor or have a shape, either in
    /// `shapes` or declared by the model. The plan is rebuilt only when
    /// `model` or `shapes` is a different allocation than last time. With
    /// `takeover`, unowned caller inputs are adopted by the persistent
    /// allocator and their buffers join its cache between runs.
    ///
    /// # Errors
    /// `InputNotBound` for an input with neither tensor nor shape, shape or
    /// data type errors for a bound tensor that contradicts the declaration.
    #[tracing::instrument(skip_all, fields(layers = model.len(), takeover = takeover))]
    pub fn prepare_storage(
        &mut self,
        model: &Arc<Model>,
        shapes: &Arc<HashMap<String, Shape>>,
        analysis: &dyn StorageAnalysis,
        takeover: bool,
    ) -> Result<()> {
        for input in model.inputs() {
            let expected = shapes.get(&input.name).or(input.shape.as_ref());
            match self.inputs.get(&input.name) {
                Some(tensor) => {
                    if tensor.is_invalidated() {
                        return Err(cairn_core::Error::Invalidated(tensor.id()).into());
                    }
                    if let Some(expected) = expected {
                        if tensor.shape() != expected {
                            return Err(cairn_core::Error::Shape(format!(
                                "input '{}' is bound to shape {} but {expected} is expected",
                                input.name,
                                tensor.shape()
                            ))
                            .into());
                        }
                    }
                    if tensor.dtype() != input.dtype {
                        return Err(cairn_core::Error::DataType {
                            expected: input.dtype,
                            found: tensor.dtype(),
                        }
                        .into());
                    }
                }
                None if expected.is_some() => {}
                None => return Err(RuntimeError::InputNotBound(input.name.clone())),
            }
        }

        let stale = match &self.prepared {
            Some(prepared) => {
                !(Arc::ptr_eq(&prepared.model, model) && Arc::ptr_eq(&prepared.shapes, shapes))
            }
            None => true,
        };
        if stale {
            if self
                .prepared
                .as_ref()
                .is_some_and(|prepared| !Arc::ptr_eq(&prepared.model, model))
            {
                self.release_bindings();
            }
            let plan = LivenessPlan::build(model);
            // Preserved names always get a named binding, whatever the analysis says.
            let requires_storage = model
                .layers()
                .iter()
                .enumerate()
                .map(|(index, layer)| {
                    plan.is_preserved(&layer.name) || analysis.requires_storage(model, index)
                })
                .collect();
            self.visited = vec![false; model.len()];
            self.plan_generation += 1;
            self.prepared = Some(Prepared {
                model: Arc::clone(model),
                shapes: Arc::clone(shapes),
                plan,
                requires_storage,
            });
            tracing::debug!(generation = self.plan_generation, "liveness plan rebuilt");
        }

        self.takeover = takeover;
        if takeover {
            self.adopt_inputs()?;
        }
        Ok(())
    }

    fn adopt_inputs(&mut self) -> Result<()> {
        for (name, tensor) in &self.inputs {
            if tensor.owner().is_some() || self.adopted.contains_key(name) {
                continue;
            }
            let Some(buffer) = tensor.buffer() else {
                continue;
            };
            let wrapper = self.allocators.persistent.alloc_with_buffer(
                tensor.shape(),
                tensor.dtype(),
                &buffer,
                AllocationScope::Persistent,
            )?;
            tracing::trace!(input = %name, buffer = %buffer.id(), "adopted input buffer");
            self.adopted.insert(name.clone(), wrapper);
        }
        Ok(())
    }

    /// Start a run: release the previous run's bindings and reset caches.
    ///
    /// If the previous run never finished the store is still occupied; its
    /// bindings are released one by one and only the ephemeral allocator is
    /// reset, leaving cached buffers in place.
    pub fn begin_run(&mut self) -> Result<()> {
        if self.occupied {
            tracing::warn!("previous run did not finish; skipping allocator cache reset");
            self.release_bindings();
            if let Some(ephemeral) = self.allocators.ephemeral.as_mut() {
                ephemeral.reset(true);
            }
        } else {
            self.release_bindings();
            for allocator in self.allocators.iter_mut() {
                allocator.reset(self.keep_cache);
            }
        }
        if self.takeover {
            self.adopt_inputs()?;
        }
        self.visited.fill(false);
        self.last_output = None;
        self.occupied = true;
        Ok(())
    }

    /// Mark the current run finished.
    pub fn end_run(&mut self) {
        self.occupied = false;
    }

    /// Whether a run has started and not finished.
    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    /// Release every produced binding and adopted input. Returns how many
    /// produced tensors were released.
    pub fn release_bindings(&mut self) -> usize {
        let mut released = 0;
        if let Some((name, tensor)) = self.temporary.take() {
            if self.allocators.release(&tensor, true) {
                released += 1;
                if self.verbose_teardown {
                    tracing::debug!(binding = %name, "released temporary");
                }
            }
        }
        for (name, tensor) in self.bindings.drain() {
            if self.allocators.release(&tensor, true) {
                released += 1;
                if self.verbose_teardown {
                    tracing::debug!(binding = %name, tensor = %tensor.id(), "released binding");
                }
            }
        }
        for (_, wrapper) in self.adopted.drain() {
            self.allocators.release(&wrapper, true);
        }
        released
    }

    fn lookup(&self, name: &str) -> Option<&Tensor> {
        if let Some((temporary, tensor)) = &self.temporary {
            if temporary == name {
                return Some(tensor);
            }
        }
        self.bindings
            .get(name)
            .or_else(|| self.adopted.get(name))
            .or_else(|| self.inputs.get(name))
            .or_else(|| {
                self.prepared
                    .as_ref()
                    .and_then(|prepared| prepared.model.constant(name))
            })
    }

    /// Tensors bound to `layer`'s inputs, `None` for empty slots.
    ///
    /// # Errors
    /// `MissingBinding` if a named input is not bound, `Invalidated` if its
    /// tensor has already been released.
    pub fn gather_inputs(&self, layer: &Layer) -> Result<Vec<Option<Tensor>>> {
        layer
            .inputs
            .iter()
            .map(|name| {
                if name.is_empty() {
                    return Ok(None);
                }
                let tensor = self
                    .lookup(name)
                    .ok_or_else(|| RuntimeError::MissingBinding {
                        layer: layer.name.clone(),
                        input: name.clone(),
                    })?;
                if tensor.is_invalidated() {
                    return Err(cairn_core::Error::Invalidated(tensor.id()).into());
                }
                Ok(Some(tensor.clone()))
            })
            .collect()
    }

    /// Whether layer `index`'s output must outlive the next hop.
    pub fn requires_storage(&self, index: usize) -> bool {
        self.prepared
            .as_ref()
            .and_then(|prepared| prepared.requires_storage.get(index).copied())
            .unwrap_or(true)
    }

    /// Allocation context for executing layer `index` on `device`.
    pub fn context(&mut self, index: usize, device: DeviceType) -> ExecutionContext<'_> {
        let requires_storage = self.requires_storage(index);
        ExecutionContext::new(index, device, requires_storage, &mut self.allocators)
    }

    /// Release a finished layer's scratch tensors.
    pub fn release_scratch(&mut self, scratch: Vec<Tensor>) {
        for tensor in &scratch {
            self.allocators.release(tensor, false);
        }
        if let Some(ephemeral) = self.allocators.ephemeral.as_mut() {
            ephemeral.reset(true);
        }
    }

    /// Release tensors a layer allocated but did not return, e.g. the
    /// output of a kernel that failed after allocating it.
    pub fn release_unreturned(&mut self, tensors: impl IntoIterator<Item = Tensor>) {
        let mut released = 0;
        for tensor in tensors {
            if self.allocators.release(&tensor, false) {
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, "released unreturned layer allocations");
        }
    }

    /// Whether `tensor` lives in the ephemeral allocator.
    pub fn is_ephemeral(&self, tensor: &Tensor) -> bool {
        self.allocators.is_ephemeral(tensor)
    }

    /// Bind the output of layer `index` under `name`.
    ///
    /// Under single-slot reuse, outputs that need no storage go to the
    /// temporary slot and release the previous temporary. A previous binding
    /// under the same name is released.
    ///
    /// # Errors
    /// `EphemeralEscape` if the tensor is ephemeral scratch.
    pub fn store(&mut self, index: usize, name: &str, tensor: Tensor) -> Result<()> {
        if self.allocators.is_ephemeral(&tensor) {
            return Err(RuntimeError::EphemeralEscape(name.to_string()));
        }
        if let Some(previous) = self.bindings.remove(name) {
            self.allocators.release(&previous, false);
        }

        let preserved = self
            .prepared
            .as_ref()
            .is_some_and(|prepared| prepared.plan.is_preserved(name));
        let temporary = self.policy == AllocationPolicy::SingleSlotReuse
            && !preserved
            && !self.requires_storage(index);
        if temporary {
            let previous = self.temporary.replace((name.to_string(), tensor.clone()));
            if let Some((previous_name, previous)) = previous {
                if previous.shares_buffer_with(&tensor) {
                    tracing::trace!(layer = name, previous = %previous_name, "temporary aliases previous slot");
                }
                if self.allocators.release(&previous, false) {
                    tracing::trace!(layer = name, released = %previous_name, "replaced temporary slot");
                }
            }
        } else {
            self.bindings.insert(name.to_string(), tensor.clone());
        }

        if let Some(visited) = self.visited.get_mut(index) {
            *visited = true;
        }
        self.last_output = Some((index, tensor));
        Ok(())
    }

    /// Release every value whose last consumer is layer `index`.
    ///
    /// Names bound to tensors no allocator here owns (caller inputs, external
    /// views, constants) are skipped. Returns how many tensors were released.
    pub fn dispose_after_layer(&mut self, index: usize) -> usize {
        let Self {
            prepared,
            temporary,
            bindings,
            allocators,
            ..
        } = self;
        let Some(prepared) = prepared.as_ref() else {
            return 0;
        };

        let mut released = 0;
        for name in prepared.plan.dispose_after(index) {
            let tensor = if temporary.as_ref().is_some_and(|(bound, _)| bound == name) {
                temporary.take().map(|(_, tensor)| tensor)
            } else if bindings.get(name).is_some_and(|tensor| tensor.owner().is_some()) {
                bindings.remove(name)
            } else {
                None
            };
            if let Some(tensor) = tensor {
                if allocators.release(&tensor, false) {
                    released += 1;
                }
            }
        }
        tracing::trace!(layer = index, released, "disposed dead values");
        released
    }

    /// Currently bound tensor for `name`, without removing it.
    ///
    /// # Errors
    /// `TensorNotFound` if nothing is bound under `name`.
    pub fn peek(&self, name: &str) -> Result<Tensor> {
        self.lookup(name)
            .cloned()
            .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))
    }

    /// Remove a produced tensor and waive allocator ownership of it.
    ///
    /// The returned tensor stays valid across later runs and teardown.
    ///
    /// # Errors
    /// `TensorNotFound` if no produced tensor is bound under `name`, or a
    /// device error from copying a shared buffer.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        let from_temporary = self
            .temporary
            .as_ref()
            .is_some_and(|(bound, _)| bound == name);
        let tensor = if from_temporary {
            self.temporary.take().map(|(_, tensor)| tensor)
        } else {
            self.bindings.remove(name)
        }
        .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))?;

        let waived = match tensor.owner().and_then(|owner| self.allocators.by_owner(owner)) {
            Some(allocator) => allocator.waive_ownership(&tensor),
            None => Ok(()),
        };
        if let Err(err) = waived {
            if from_temporary {
                self.temporary = Some((name.to_string(), tensor));
            } else {
                self.bindings.insert(name.to_string(), tensor);
            }
            return Err(err);
        }
        if self
            .last_output
            .as_ref()
            .is_some_and(|(_, last)| last.id() == tensor.id())
        {
            self.last_output = None;
        }
        Ok(tensor)
    }

    /// Most recently stored output and its layer index.
    pub fn last_output(&self) -> Option<(usize, &Tensor)> {
        self.last_output
            .as_ref()
            .map(|(index, tensor)| (*index, tensor))
    }

    pub fn liveness_plan(&self) -> Option<&LivenessPlan> {
        self.prepared.as_ref().map(|prepared| &prepared.plan)
    }

    /// Incremented every time the liveness plan is rebuilt.
    pub fn plan_generation(&self) -> usize {
        self.plan_generation
    }

    /// Names of produced tensors currently bound, sorted.
    pub fn bound_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bindings
            .keys()
            .cloned()
            .chain(self.temporary.iter().map(|(name, _)| name.clone()))
            .collect();
        names.sort();
        names
    }

    /// Release everything and destroy all cached buffers.
    ///
    /// Tolerates a partially executed run: layers never visited are reported,
    /// not treated as errors.
    #[tracing::instrument(skip_all)]
    pub fn teardown(&mut self) -> TeardownReport {
        let unvisited_layers: Vec<String> = self
            .prepared
            .as_ref()
            .map(|prepared| {
                prepared
                    .model
                    .layers()
                    .iter()
                    .zip(&self.visited)
                    .filter(|(_, visited)| !**visited)
                    .map(|(layer, _)| layer.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        if self.occupied && !unvisited_layers.is_empty() {
            tracing::warn!(
                unvisited = unvisited_layers.len(),
                first = %unvisited_layers[0],
                "tearing down a partially executed run"
            );
        }

        let released = self.release_bindings();
        for allocator in self.allocators.iter_mut() {
            allocator.dispose();
        }
        self.inputs.clear();
        self.last_output = None;
        self.occupied = false;

        tracing::debug!(released, "store torn down");
        TeardownReport {
            released,
            unvisited_layers,
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            persistent: self.allocators.persistent.stats(),
            ping_pong: self.allocators.ping_pong.as_ref().map(TensorAllocator::stats),
            ephemeral: self.allocators.ephemeral.as_ref().map(TensorAllocator::stats),
            bindings: self.bindings.len() + usize::from(self.temporary.is_some()),
        }
    }
}
