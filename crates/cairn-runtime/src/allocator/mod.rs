//! Buffer-caching tensor allocator.
//!
//! [`TensorAllocator`] binds tensors to physical buffers and recycles buffers
//! through a free list once no tensor references them. How many tensors share
//! a buffer is kept in an explicit share-count table keyed by buffer identity;
//! a buffer is either *busy* (share count above zero) or *free* (cached in the
//! free list), never both.
//!
//! Two free-list policies are available, see [`CachePolicy`].
//!
//! Invariant violations (releasing a tensor owned elsewhere, waiving a tensor
//! this allocator does not own, share-count underflow) are programming errors
//! and panic.

mod bucketed;
mod shape_exact;

use crate::error::{Result, RuntimeError};
use bucketed::SizeBucketedList;
use cairn_core::{
    AllocationScope, AllocatorId, Buffer, BufferFactory, BufferId, DataType, DeviceType,
    HostBufferFactory, Shape, Tensor, TensorId,
};
use shape_exact::ShapeExactList;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Free-list policy of a [`TensorAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// First fit by capacity over a capacity-sorted list.
    #[default]
    SizeBucketed,
    /// Reuse only buffers cached under the identical shape and device.
    ShapeExact,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePolicy::SizeBucketed => f.write_str("size-bucketed"),
            CachePolicy::ShapeExact => f.write_str("shape-exact"),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "size-bucketed" | "bucketed" => Ok(CachePolicy::SizeBucketed),
            "shape-exact" | "exact" => Ok(CachePolicy::ShapeExact),
            other => Err(format!(
                "unknown cache policy '{other}' (expected size-bucketed or shape-exact)"
            )),
        }
    }
}

#[derive(Debug)]
enum FreeList {
    SizeBucketed(SizeBucketedList),
    ShapeExact(ShapeExactList),
}

impl FreeList {
    fn new(policy: CachePolicy) -> Self {
        match policy {
            CachePolicy::SizeBucketed => FreeList::SizeBucketed(SizeBucketedList::new()),
            CachePolicy::ShapeExact => FreeList::ShapeExact(ShapeExactList::new()),
        }
    }

    fn take(&mut self, shape: &Shape, bytes: usize, device: DeviceType) -> Option<Arc<Buffer>> {
        match self {
            FreeList::SizeBucketed(list) => list.take(bytes, device),
            FreeList::ShapeExact(list) => list.take(shape, bytes, device),
        }
    }

    fn insert(&mut self, shape: &Shape, buffer: Arc<Buffer>) {
        match self {
            FreeList::SizeBucketed(list) => list.insert(buffer),
            FreeList::ShapeExact(list) => list.insert(shape, buffer),
        }
    }

    fn remove(&mut self, id: BufferId) -> Option<Arc<Buffer>> {
        match self {
            FreeList::SizeBucketed(list) => list.remove(id),
            FreeList::ShapeExact(list) => list.remove(id),
        }
    }

    fn contains(&self, id: BufferId) -> bool {
        match self {
            FreeList::SizeBucketed(list) => list.contains(id),
            FreeList::ShapeExact(list) => list.contains(id),
        }
    }

    fn len(&self) -> usize {
        match self {
            FreeList::SizeBucketed(list) => list.len(),
            FreeList::ShapeExact(list) => list.len(),
        }
    }

    fn bytes(&self) -> usize {
        match self {
            FreeList::SizeBucketed(list) => list.bytes(),
            FreeList::ShapeExact(list) => list.bytes(),
        }
    }

    fn drain(&mut self) -> Vec<Arc<Buffer>> {
        match self {
            FreeList::SizeBucketed(list) => list.drain(),
            FreeList::ShapeExact(list) => list.drain(),
        }
    }
}

/// Point-in-time view of an allocator's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Tensors currently bound through this allocator.
    pub busy_tensors: usize,
    /// Distinct buffers with a share count above zero.
    pub busy_buffers: usize,
    pub busy_bytes: usize,
    /// Buffers waiting in the free list.
    pub cached_buffers: usize,
    pub cached_bytes: usize,
    /// Highest `busy_bytes` observed.
    pub peak_bytes: usize,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl AllocatorStats {
    /// Accumulate another allocator's figures into this one.
    ///
    /// Peaks are summed, which over-approximates the combined peak.
    pub fn merge(&mut self, other: &AllocatorStats) {
        self.busy_tensors += other.busy_tensors;
        self.busy_buffers += other.busy_buffers;
        self.busy_bytes += other.busy_bytes;
        self.cached_buffers += other.cached_buffers;
        self.cached_bytes += other.cached_bytes;
        self.peak_bytes += other.peak_bytes;
        self.buffers_created += other.buffers_created;
        self.buffers_destroyed += other.buffers_destroyed;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
    }
}

/// Share-count entry for a busy buffer.
#[derive(Debug)]
struct BufferRecord {
    buffer: Arc<Buffer>,
    shares: usize,
    /// Shape the buffer was first bound with; the shape-exact free list key.
    shape: Shape,
}

/// Busy record for an owned tensor.
#[derive(Debug)]
struct TensorRecord {
    tensor: Tensor,
    buffer: BufferId,
}

#[derive(Debug, Default)]
struct Counters {
    created: usize,
    destroyed: usize,
    hits: usize,
    misses: usize,
    busy_bytes: usize,
    peak_bytes: usize,
}

/// Caching allocator binding tensors to reusable buffers.
#[derive(Debug)]
pub struct TensorAllocator {
    id: AllocatorId,
    label: String,
    policy: CachePolicy,
    factories: Vec<Arc<dyn BufferFactory>>,
    free: FreeList,
    records: HashMap<BufferId, BufferRecord>,
    tensors: HashMap<TensorId, TensorRecord>,
    /// Destroy buffers whose share count reaches zero instead of caching them.
    evict_on_release: bool,
    counters: Counters,
}

impl TensorAllocator {
    /// Create an allocator drawing new buffers from `factories`, one per device.
    pub fn new(
        label: impl Into<String>,
        policy: CachePolicy,
        factories: Vec<Arc<dyn BufferFactory>>,
    ) -> Self {
        Self {
            id: AllocatorId::next(),
            label: label.into(),
            policy,
            factories,
            free: FreeList::new(policy),
            records: HashMap::new(),
            tensors: HashMap::new(),
            evict_on_release: false,
            counters: Counters::default(),
        }
    }

    /// Create an allocator over unlimited host memory.
    pub fn host(label: impl Into<String>, policy: CachePolicy) -> Self {
        Self::new(label, policy, vec![Arc::new(HostBufferFactory::new())])
    }

    pub fn id(&self) -> AllocatorId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn factory(&self, device: DeviceType) -> Result<&Arc<dyn BufferFactory>> {
        self.factories
            .iter()
            .find(|factory| factory.device() == device)
            .ok_or_else(|| {
                RuntimeError::Core(cairn_core::Error::Device(format!(
                    "allocator '{}' has no buffer factory for {device}",
                    self.label
                )))
            })
    }

    /// Allocate a tensor, reusing a cached buffer when one fits.
    ///
    /// # Errors
    /// Propagates device errors (including out-of-memory) from the buffer factory.
    pub fn alloc(
        &mut self,
        shape: &Shape,
        dtype: DataType,
        device: DeviceType,
        scope: AllocationScope,
    ) -> Result<Tensor> {
        let bytes = shape.byte_len(dtype);
        let buffer = match self.free.take(shape, bytes, device) {
            Some(buffer) => {
                self.counters.hits += 1;
                tracing::trace!(
                    allocator = %self.label,
                    buffer = %buffer.id(),
                    bytes,
                    ?scope,
                    "cache hit"
                );
                buffer
            }
            None => {
                let buffer = self.factory(device)?.create(bytes)?;
                self.counters.misses += 1;
                self.counters.created += 1;
                tracing::trace!(
                    allocator = %self.label,
                    buffer = %buffer.id(),
                    bytes,
                    ?scope,
                    "cache miss, created buffer"
                );
                buffer
            }
        };

        let tensor = match Tensor::bound(shape.clone(), dtype, Arc::clone(&buffer), Some(self.id)) {
            Ok(tensor) => tensor,
            Err(err) => {
                self.free.insert(shape, buffer);
                return Err(err.into());
            }
        };
        self.share(&buffer, shape);
        self.tensors.insert(
            tensor.id(),
            TensorRecord {
                tensor: tensor.clone(),
                buffer: buffer.id(),
            },
        );
        Ok(tensor)
    }

    /// Wrap an existing buffer in a new tensor, incrementing its share count.
    ///
    /// The buffer is not taken from the free list by size; if it happens to be
    /// cached it becomes busy again. A buffer this allocator has never seen is
    /// adopted with a share count of one and is cached once released.
    ///
    /// # Errors
    /// Returns a shape error if the buffer is too small.
    pub fn alloc_with_buffer(
        &mut self,
        shape: &Shape,
        dtype: DataType,
        buffer: &Arc<Buffer>,
        scope: AllocationScope,
    ) -> Result<Tensor> {
        let tensor = Tensor::bound(shape.clone(), dtype, Arc::clone(buffer), Some(self.id))?;
        if self.free.remove(buffer.id()).is_some() {
            tracing::trace!(allocator = %self.label, buffer = %buffer.id(), "reclaimed cached buffer");
        }
        self.share(buffer, shape);
        self.tensors.insert(
            tensor.id(),
            TensorRecord {
                tensor: tensor.clone(),
                buffer: buffer.id(),
            },
        );
        tracing::trace!(
            allocator = %self.label,
            tensor = %tensor.id(),
            buffer = %buffer.id(),
            shares = self.share_count(buffer.id()),
            ?scope,
            "wrapped buffer"
        );
        Ok(tensor)
    }

    /// Detach `tensor` from its buffer and drop one share.
    ///
    /// The buffer goes back to the free list when its share count reaches zero
    /// (or is destroyed while the allocator is evicting). Releasing an already
    /// released tensor is a no-op. `explicit` marks a host-initiated dispose,
    /// which tolerates tensors this allocator does not own.
    ///
    /// # Panics
    /// On an internal release of a tensor owned by another allocator, or of a
    /// tensor claiming this allocator as owner without a busy record.
    pub fn release(&mut self, tensor: &Tensor, explicit: bool) {
        let Some(record) = self.tensors.remove(&tensor.id()) else {
            let owner = tensor.owner();
            if owner == Some(self.id) && !tensor.is_invalidated() {
                panic!(
                    "allocator '{}' owns {} but holds no busy record for it",
                    self.label,
                    tensor.id()
                );
            }
            if !explicit && owner.is_some() && owner != Some(self.id) {
                panic!(
                    "allocator '{}' asked to release {} owned by {}",
                    self.label,
                    tensor.id(),
                    owner.map(|id| id.to_string()).unwrap_or_default()
                );
            }
            tracing::trace!(allocator = %self.label, tensor = %tensor.id(), "release is a no-op");
            return;
        };

        record.tensor.detach();
        self.unshare(record.buffer, self.evict_on_release);
    }

    /// Re-point `tensor` from `old_buffer` to `new_buffer`.
    ///
    /// The new buffer gains a share, the old one loses one and is cached or,
    /// with `dispose_hint`, destroyed once unshared.
    ///
    /// # Errors
    /// Returns a shape error if `new_buffer` is too small for the tensor.
    ///
    /// # Panics
    /// If the tensor is not owned here or is not bound to `old_buffer`.
    pub fn move_to_device(
        &mut self,
        tensor: &Tensor,
        new_buffer: Arc<Buffer>,
        old_buffer: &Arc<Buffer>,
        dispose_hint: bool,
    ) -> Result<()> {
        let current = match self.tensors.get(&tensor.id()) {
            Some(record) => record.buffer,
            None => panic!(
                "allocator '{}' cannot move {}: not owned",
                self.label,
                tensor.id()
            ),
        };
        assert_eq!(
            current,
            old_buffer.id(),
            "{} is bound to {current}, not {}",
            tensor.id(),
            old_buffer.id()
        );
        if new_buffer.id() == current {
            return Ok(());
        }
        if new_buffer.capacity() < tensor.byte_len() {
            return Err(RuntimeError::Core(cairn_core::Error::Shape(format!(
                "{} holds {} bytes but {} needs {}",
                new_buffer.id(),
                new_buffer.capacity(),
                tensor.id(),
                tensor.byte_len()
            ))));
        }

        self.free.remove(new_buffer.id());
        self.share(&new_buffer, tensor.shape());
        tensor.attach(Arc::clone(&new_buffer), Some(self.id));
        if let Some(record) = self.tensors.get_mut(&tensor.id()) {
            record.buffer = new_buffer.id();
        }
        self.unshare(current, dispose_hint);
        tracing::trace!(
            allocator = %self.label,
            tensor = %tensor.id(),
            from = %current,
            to = %new_buffer.id(),
            "moved tensor"
        );
        Ok(())
    }

    /// Stop tracking `tensor` without freeing its memory.
    ///
    /// If other owned tensors still share the buffer, the waived tensor is
    /// moved onto a private copy and the original keeps the remaining shares.
    /// Otherwise the allocator forgets the buffer and the tensor keeps it.
    ///
    /// # Errors
    /// Propagates device errors from creating the private copy.
    ///
    /// # Panics
    /// If the tensor is not owned by this allocator.
    pub fn waive_ownership(&mut self, tensor: &Tensor) -> Result<()> {
        let buffer_id = match self.tensors.get(&tensor.id()) {
            Some(record) => record.buffer,
            None => panic!(
                "allocator '{}' cannot waive {}: not owned",
                self.label,
                tensor.id()
            ),
        };
        let (original, shares) = match self.records.get(&buffer_id) {
            Some(record) => (Arc::clone(&record.buffer), record.shares),
            None => panic!(
                "allocator '{}' tracks {} on untracked {buffer_id}",
                self.label,
                tensor.id()
            ),
        };

        if shares > 1 {
            let bytes = tensor.byte_len();
            let private = self.factory(original.device())?.create(bytes)?;
            private.copy_from(&original, bytes)?;
            self.tensors.remove(&tensor.id());
            tensor.attach(private, None);
            self.unshare(buffer_id, false);
        } else {
            self.tensors.remove(&tensor.id());
            if let Some(record) = self.records.remove(&buffer_id) {
                self.counters.busy_bytes -= record.buffer.capacity();
            }
            tensor.set_owner(None);
        }

        tracing::debug!(
            allocator = %self.label,
            tensor = %tensor.id(),
            detached = shares > 1,
            "waived ownership"
        );
        Ok(())
    }

    /// Release every busy tensor through the normal release path.
    ///
    /// With `keep_cached_memory` false, released and already cached buffers
    /// are destroyed so the allocator holds no memory afterwards.
    pub fn reset(&mut self, keep_cached_memory: bool) {
        let evict = std::mem::replace(&mut self.evict_on_release, !keep_cached_memory);
        let busy: Vec<Tensor> = self
            .tensors
            .values()
            .map(|record| record.tensor.clone())
            .collect();
        let released = busy.len();
        for tensor in &busy {
            self.release(tensor, false);
        }
        self.evict_on_release = evict;

        if !keep_cached_memory {
            let cached = self.free.drain();
            self.counters.destroyed += cached.len();
        }

        debug_assert!(
            self.records.is_empty(),
            "allocator '{}' still holds shares after reset",
            self.label
        );
        tracing::debug!(
            allocator = %self.label,
            released,
            keep_cached_memory,
            cached = self.free.len(),
            "reset allocator"
        );
    }

    /// Release everything and destroy all cached buffers.
    pub fn dispose(&mut self) {
        self.reset(false);
    }

    /// Whether this allocator holds a busy record for `tensor`.
    pub fn owns(&self, tensor: &Tensor) -> bool {
        self.tensors.contains_key(&tensor.id())
    }

    /// Current share count of a buffer, zero if not busy here.
    pub fn share_count(&self, id: BufferId) -> usize {
        self.records.get(&id).map_or(0, |record| record.shares)
    }

    pub fn is_cached(&self, id: BufferId) -> bool {
        self.free.contains(id)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            busy_tensors: self.tensors.len(),
            busy_buffers: self.records.len(),
            busy_bytes: self.counters.busy_bytes,
            cached_buffers: self.free.len(),
            cached_bytes: self.free.bytes(),
            peak_bytes: self.counters.peak_bytes,
            buffers_created: self.counters.created,
            buffers_destroyed: self.counters.destroyed,
            cache_hits: self.counters.hits,
            cache_misses: self.counters.misses,
        }
    }

    /// Check busy/free exclusivity and busy-record consistency.
    ///
    /// # Panics
    /// If any buffer is both busy and cached, or a tensor record points at an
    /// untracked buffer or a tensor bound elsewhere.
    pub fn assert_consistent(&self) {
        for (id, record) in &self.records {
            assert!(record.shares > 0, "{id} is tracked with zero shares");
            assert!(
                !self.free.contains(*id),
                "{id} is busy and cached in allocator '{}'",
                self.label
            );
        }
        let mut shares: HashMap<BufferId, usize> = HashMap::new();
        for record in self.tensors.values() {
            assert!(
                self.records.contains_key(&record.buffer),
                "{} points at untracked {}",
                record.tensor.id(),
                record.buffer
            );
            assert_eq!(
                record.tensor.buffer().map(|buffer| buffer.id()),
                Some(record.buffer),
                "{} is not bound to its recorded buffer",
                record.tensor.id()
            );
            *shares.entry(record.buffer).or_default() += 1;
        }
        for (id, record) in &self.records {
            assert_eq!(
                shares.get(id).copied().unwrap_or(0),
                record.shares,
                "{id} share count disagrees with its tensors"
            );
        }
    }

    fn share(&mut self, buffer: &Arc<Buffer>, shape: &Shape) {
        assert!(
            !self.free.contains(buffer.id()),
            "{} is cached in allocator '{}' while being bound",
            buffer.id(),
            self.label
        );
        match self.records.entry(buffer.id()) {
            Entry::Occupied(mut entry) => entry.get_mut().shares += 1,
            Entry::Vacant(entry) => {
                entry.insert(BufferRecord {
                    buffer: Arc::clone(buffer),
                    shares: 1,
                    shape: shape.clone(),
                });
                self.counters.busy_bytes += buffer.capacity();
                self.counters.peak_bytes = self.counters.peak_bytes.max(self.counters.busy_bytes);
            }
        }
    }

    fn unshare(&mut self, id: BufferId, dispose: bool) {
        let record = match self.records.entry(id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().shares -= 1;
                if entry.get().shares > 0 {
                    return;
                }
                entry.remove()
            }
            Entry::Vacant(_) => panic!(
                "share count underflow for {id} in allocator '{}'",
                self.label
            ),
        };

        self.counters.busy_bytes -= record.buffer.capacity();
        if dispose {
            self.counters.destroyed += 1;
            tracing::trace!(allocator = %self.label, buffer = %id, "destroyed buffer");
        } else {
            tracing::trace!(allocator = %self.label, buffer = %id, "cached buffer");
            self.free.insert(&record.shape, record.buffer);
        }
    }
}

impl Drop for TensorAllocator {
    fn drop(&mut self) {
        if !self.tensors.is_empty() || self.free.len() > 0 {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(allocator: &mut TensorAllocator, dims: &[usize]) -> Tensor {
        allocator
            .alloc(
                &Shape::from(dims),
                DataType::F32,
                DeviceType::Cpu,
                AllocationScope::Persistent,
            )
            .unwrap()
    }

    #[test]
    fn test_release_then_alloc_reuses_buffer() {
        for policy in [CachePolicy::SizeBucketed, CachePolicy::ShapeExact] {
            let mut allocator = TensorAllocator::host("test", policy);
            let first = alloc(&mut allocator, &[4, 4]);
            let buffer = first.buffer().unwrap().id();

            allocator.release(&first, false);
            assert!(first.is_invalidated());
            assert!(allocator.is_cached(buffer));

            let second = alloc(&mut allocator, &[4, 4]);
            assert_eq!(second.buffer().unwrap().id(), buffer);
            assert_eq!(allocator.stats().cache_hits, 1);
            allocator.assert_consistent();
        }
    }

    #[test]
    fn test_bucketed_reuses_larger_buffer() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let big = alloc(&mut allocator, &[64]);
        let buffer = big.buffer().unwrap().id();
        allocator.release(&big, false);

        let small = alloc(&mut allocator, &[8]);
        assert_eq!(small.buffer().unwrap().id(), buffer);
    }

    #[test]
    fn test_shape_exact_does_not_reuse_other_shapes() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::ShapeExact);
        let big = alloc(&mut allocator, &[64]);
        let buffer = big.buffer().unwrap().id();
        allocator.release(&big, false);

        let small = alloc(&mut allocator, &[8]);
        assert_ne!(small.buffer().unwrap().id(), buffer);
        assert_eq!(allocator.stats().cached_buffers, 1);
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        allocator.release(&tensor, false);
        allocator.release(&tensor, false);
        assert_eq!(allocator.stats().cached_buffers, 1);
        allocator.assert_consistent();
    }

    #[test]
    fn test_shared_buffer_survives_until_last_release() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let base = alloc(&mut allocator, &[2, 2]);
        let buffer = base.buffer().unwrap();
        let view = allocator
            .alloc_with_buffer(&Shape::from([4]), DataType::F32, &buffer, AllocationScope::Persistent)
            .unwrap();
        assert_eq!(allocator.share_count(buffer.id()), 2);

        allocator.release(&base, false);
        assert_eq!(allocator.share_count(buffer.id()), 1);
        assert!(!allocator.is_cached(buffer.id()));
        assert!(!view.is_invalidated());

        allocator.release(&view, false);
        assert!(allocator.is_cached(buffer.id()));
        allocator.assert_consistent();
    }

    #[test]
    fn test_alloc_with_cached_buffer_makes_it_busy() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        let buffer = tensor.buffer().unwrap();
        allocator.release(&tensor, false);
        assert!(allocator.is_cached(buffer.id()));

        let wrapped = allocator
            .alloc_with_buffer(&Shape::from([4]), DataType::F32, &buffer, AllocationScope::Persistent)
            .unwrap();
        assert!(!allocator.is_cached(buffer.id()));
        assert_eq!(allocator.share_count(buffer.id()), 1);
        assert!(allocator.owns(&wrapped));
        allocator.assert_consistent();
    }

    #[test]
    fn test_external_buffer_is_adopted() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let external = Arc::new(Buffer::host(16));
        let tensor = allocator
            .alloc_with_buffer(&Shape::from([4]), DataType::F32, &external, AllocationScope::Persistent)
            .unwrap();
        allocator.release(&tensor, false);
        assert!(allocator.is_cached(external.id()));
    }

    #[test]
    fn test_move_to_device() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        tensor.write_slice(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let old = tensor.buffer().unwrap();
        let new = Arc::new(Buffer::host(16));
        new.copy_from(&old, 16).unwrap();

        allocator
            .move_to_device(&tensor, Arc::clone(&new), &old, false)
            .unwrap();
        assert_eq!(tensor.buffer().unwrap().id(), new.id());
        assert_eq!(allocator.share_count(new.id()), 1);
        assert!(allocator.is_cached(old.id()));
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        allocator.assert_consistent();
    }

    #[test]
    fn test_move_to_device_with_dispose_hint_destroys_old() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        let old = tensor.buffer().unwrap();
        allocator
            .move_to_device(&tensor, Arc::new(Buffer::host(16)), &old, true)
            .unwrap();
        assert!(!allocator.is_cached(old.id()));
        assert_eq!(allocator.stats().buffers_destroyed, 1);
    }

    #[test]
    fn test_move_to_small_buffer_fails() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        let old = tensor.buffer().unwrap();
        let result = allocator.move_to_device(&tensor, Arc::new(Buffer::host(4)), &old, false);
        assert!(result.is_err());
        assert_eq!(tensor.buffer().unwrap().id(), old.id());
        allocator.assert_consistent();
    }

    #[test]
    fn test_waive_shared_buffer() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let t1 = alloc(&mut allocator, &[2, 2]);
        t1.write_slice(&[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let original = t1.buffer().unwrap();
        let t2 = allocator
            .alloc_with_buffer(&Shape::from([4]), DataType::F32, &original, AllocationScope::Persistent)
            .unwrap();
        let t3 = allocator
            .alloc_with_buffer(&Shape::from([1, 4]), DataType::F32, &original, AllocationScope::Persistent)
            .unwrap();
        assert_eq!(allocator.share_count(original.id()), 3);

        allocator.waive_ownership(&t1).unwrap();

        assert!(!allocator.owns(&t1));
        assert!(t1.owner().is_none());
        assert_ne!(t1.buffer().unwrap().id(), original.id());
        assert_eq!(t1.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(t2.shares_buffer_with(&t3));
        assert_eq!(t2.buffer().unwrap().id(), original.id());
        assert_eq!(allocator.share_count(original.id()), 2);
        allocator.assert_consistent();
    }

    #[test]
    fn test_waive_sole_owner_keeps_buffer() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut allocator, &[4]);
        let buffer = tensor.buffer().unwrap().id();

        allocator.waive_ownership(&tensor).unwrap();
        assert_eq!(tensor.buffer().unwrap().id(), buffer);
        assert_eq!(allocator.share_count(buffer), 0);

        allocator.reset(true);
        assert!(!tensor.is_invalidated());
        assert!(!allocator.is_cached(buffer));
    }

    #[test]
    fn test_reset_keep_cache() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let a = alloc(&mut allocator, &[4]);
        let _b = alloc(&mut allocator, &[8]);
        allocator.release(&a, false);
        let cached_before = allocator.stats().cached_bytes;

        allocator.reset(true);
        let stats = allocator.stats();
        assert_eq!(stats.busy_tensors, 0);
        assert_eq!(stats.busy_buffers, 0);
        assert_eq!(stats.cached_buffers, 2);
        assert!(stats.cached_bytes >= cached_before);

        allocator.reset(true);
        assert_eq!(allocator.stats().cached_buffers, 2);
    }

    #[test]
    fn test_reset_drop_cache() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::ShapeExact);
        let a = alloc(&mut allocator, &[4]);
        let b = alloc(&mut allocator, &[8]);
        allocator.release(&a, false);

        allocator.reset(false);
        let stats = allocator.stats();
        assert_eq!(stats.cached_buffers, 0);
        assert_eq!(stats.busy_tensors, 0);
        assert_eq!(stats.buffers_destroyed, 2);
        assert!(b.is_invalidated());
    }

    #[test]
    fn test_explicit_release_of_foreign_tensor_is_tolerated() {
        let mut a = TensorAllocator::host("a", CachePolicy::SizeBucketed);
        let mut b = TensorAllocator::host("b", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut a, &[4]);
        b.release(&tensor, true);
        assert!(!tensor.is_invalidated());
        assert!(a.owns(&tensor));
    }

    #[test]
    #[should_panic(expected = "owned by")]
    fn test_internal_release_of_foreign_tensor_panics() {
        let mut a = TensorAllocator::host("a", CachePolicy::SizeBucketed);
        let mut b = TensorAllocator::host("b", CachePolicy::SizeBucketed);
        let tensor = alloc(&mut a, &[4]);
        b.release(&tensor, false);
    }

    #[test]
    #[should_panic(expected = "not owned")]
    fn test_waive_unowned_tensor_panics() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let tensor = Tensor::from_vec(vec![1.0f32], [1]).unwrap();
        let _ = allocator.waive_ownership(&tensor);
    }

    #[test]
    fn test_missing_device_factory() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let result = allocator.alloc(
            &Shape::from([4]),
            DataType::F32,
            DeviceType::Gpu,
            AllocationScope::Persistent,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_memory_is_surfaced() {
        let factory: Arc<dyn BufferFactory> = Arc::new(HostBufferFactory::new().with_limit(32));
        let mut allocator = TensorAllocator::new("test", CachePolicy::SizeBucketed, vec![factory]);
        let _a = alloc(&mut allocator, &[8]);
        let result = allocator.alloc(
            &Shape::from([8]),
            DataType::F32,
            DeviceType::Cpu,
            AllocationScope::Persistent,
        );
        assert!(matches!(
            result,
            Err(RuntimeError::Core(cairn_core::Error::OutOfMemory { .. }))
        ));
    }

    #[test]
    fn test_peak_bytes() {
        let mut allocator = TensorAllocator::host("test", CachePolicy::SizeBucketed);
        let a = alloc(&mut allocator, &[4]);
        let b = alloc(&mut allocator, &[4]);
        allocator.release(&a, false);
        allocator.release(&b, false);
        let stats = allocator.stats();
        assert_eq!(stats.peak_bytes, 32);
        assert_eq!(stats.busy_bytes, 0);
    }
}
