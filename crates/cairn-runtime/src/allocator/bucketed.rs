//! Size-bucketed free list.
//!
//! Free buffers are kept sorted ascending by capacity. A request takes the
//! first buffer on the right device whose capacity is at least the requested
//! byte count, so reuse is broad at the cost of some slack per buffer.

use cairn_core::{Buffer, BufferId, DeviceType};
use std::sync::Arc;

#[derive(Debug)]
struct Entry {
    capacity: usize,
    device: DeviceType,
    buffer: Arc<Buffer>,
}

#[derive(Debug, Default)]
pub(crate) struct SizeBucketedList {
    entries: Vec<Entry>,
}

impl SizeBucketedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the smallest free buffer on `device` holding at least `bytes`.
    pub fn take(&mut self, bytes: usize, device: DeviceType) -> Option<Arc<Buffer>> {
        let start = self.entries.partition_point(|entry| entry.capacity < bytes);
        let offset = self.entries[start..]
            .iter()
            .position(|entry| entry.device == device)?;
        Some(self.entries.remove(start + offset).buffer)
    }

    /// Insert after any entries of equal capacity so equal-sized buffers cycle FIFO.
    pub fn insert(&mut self, buffer: Arc<Buffer>) {
        let capacity = buffer.capacity();
        let mut index = self.entries.partition_point(|entry| entry.capacity < capacity);
        while index < self.entries.len() && self.entries[index].capacity == capacity {
            index += 1;
        }
        self.entries.insert(
            index,
            Entry {
                capacity,
                device: buffer.device(),
                buffer,
            },
        );
    }

    pub fn remove(&mut self, id: BufferId) -> Option<Arc<Buffer>> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.buffer.id() == id)?;
        Some(self.entries.remove(index).buffer)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.entries.iter().any(|entry| entry.buffer.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.entries.iter().map(|entry| entry.capacity).sum()
    }

    pub fn drain(&mut self) -> Vec<Arc<Buffer>> {
        self.entries.drain(..).map(|entry| entry.buffer).collect()
    }
}
