//! Shape-exact free list.
//!
//! Free buffers are keyed by the exact shape and device they were allocated
//! for. Lookup is a single hash lookup and every reused buffer fits its consumer
//! exactly, which matters when something reads the memory by fixed geometry.

use cairn_core::{Buffer, BufferId, DeviceType, Shape};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct ShapeExactList {
    buckets: HashMap<(Shape, DeviceType), Vec<Arc<Buffer>>>,
}

impl ShapeExactList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free buffer cached under exactly `shape` on `device`.
    ///
    /// `bytes` guards against a same-shaped buffer of a narrower element type.
    pub fn take(&mut self, shape: &Shape, bytes: usize, device: DeviceType) -> Option<Arc<Buffer>> {
        let key = (shape.clone(), device);
        let bucket = self.buckets.get_mut(&key)?;
        let index = bucket.iter().position(|buffer| buffer.capacity() >= bytes)?;
        let buffer = bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        Some(buffer)
    }

    pub fn insert(&mut self, shape: &Shape, buffer: Arc<Buffer>) {
        self.buckets
            .entry((shape.clone(), buffer.device()))
            .or_default()
            .push(buffer);
    }

    pub fn remove(&mut self, id: BufferId) -> Option<Arc<Buffer>> {
        let (key, index) = self.buckets.iter().find_map(|(key, bucket)| {
            bucket
                .iter()
                .position(|buffer| buffer.id() == id)
                .map(|index| (key.clone(), index))
        })?;
        let bucket = self.buckets.get_mut(&key)?;
        let buffer = bucket.remove(index);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        Some(buffer)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.buckets
            .values()
            .any(|bucket| bucket.iter().any(|buffer| buffer.id() == id))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn bytes(&self) -> usize {
        self.buckets
            .values()
            .flatten()
            .map(|buffer| buffer.capacity())
            .sum()
    }

    pub fn drain(&mut self) -> Vec<Arc<Buffer>> {
        self.buckets.drain().flat_map(|(_, bucket)| bucket).collect()
    }
}
