//! Physical storage handles.
//!
//! A [`Buffer`] is opaque to the allocator beyond its identity, device and
//! capacity. The bytes themselves live behind a [`DeviceMemory`] so that host
//! memory and accelerator memory can be cached by the same allocator.

use crate::{DeviceType, Error, Result};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a physical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Byte-addressable device memory backing a [`Buffer`].
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Size of the allocation in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `len` bytes starting at `offset` back to the host.
    ///
    /// For accelerator memory this is a synchronization point.
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Access the concrete memory type (e.g. to reach a native GPU handle).
    fn as_any(&self) -> &dyn Any;
}

/// Host memory, optionally accounted against a [`HostBufferFactory`] limit.
#[derive(Debug)]
pub struct HostMemory {
    bytes: RwLock<Vec<u8>>,
    usage: Option<Arc<AtomicUsize>>,
}

impl HostMemory {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len]),
            usage: None,
        }
    }

    fn tracked(len: usize, usage: Arc<AtomicUsize>) -> Self {
        Self {
            bytes: RwLock::new(vec![0; len]),
            usage: Some(usage),
        }
    }
}

fn check_range(offset: usize, len: usize, total: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => Err(Error::Device(format!(
            "access of {len} bytes at offset {offset} exceeds allocation of {total} bytes"
        ))),
    }
}

impl DeviceMemory for HostMemory {
    fn len(&self) -> usize {
        self.bytes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let bytes = self.bytes.read().unwrap_or_else(PoisonError::into_inner);
        check_range(offset, len, bytes.len())?;
        Ok(bytes[offset..offset + len].to_vec())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        check_range(offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        if let Some(usage) = &self.usage {
            let len = self.bytes.get_mut().unwrap_or_else(PoisonError::into_inner).len();
            usage.fetch_sub(len, Ordering::Relaxed);
        }
    }
}

/// A physical storage handle.
///
/// Buffers carry no reference count of their own: how many tensors share a
/// buffer is tracked by the allocator that owns it.
pub struct Buffer {
    id: BufferId,
    device: DeviceType,
    capacity: usize,
    memory: Box<dyn DeviceMemory>,
}

impl Buffer {
    /// Wrap device memory in a new buffer with a fresh identity.
    pub fn new(device: DeviceType, memory: Box<dyn DeviceMemory>) -> Self {
        Self {
            id: BufferId::next(),
            device,
            capacity: memory.len(),
            memory,
        }
    }

    /// Create an untracked host buffer of `capacity` zeroed bytes.
    pub fn host(capacity: usize) -> Self {
        Self::new(DeviceType::Cpu, Box::new(HostMemory::zeroed(capacity)))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory(&self) -> &dyn DeviceMemory {
        self.memory.as_ref()
    }

    /// Read the first `len` bytes.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        self.memory.read(0, len)
    }

    /// Overwrite the leading bytes with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.memory.write(0, data)
    }

    /// Copy the first `len` bytes of `src` into this buffer.
    pub fn copy_from(&self, src: &Buffer, len: usize) -> Result<()> {
        let bytes = src.read(len)?;
        self.write(&bytes)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Creates new buffers for one device.
///
/// Out-of-memory conditions are reported here and never retried by callers.
pub trait BufferFactory: Send + Sync + fmt::Debug {
    /// Device the created buffers live on.
    fn device(&self) -> DeviceType;

    /// Allocate a new buffer of at least `bytes` bytes.
    fn create(&self, bytes: usize) -> Result<Arc<Buffer>>;

    /// Bytes currently held by live buffers from this factory, if tracked.
    fn bytes_in_use(&self) -> usize {
        0
    }
}

/// Factory for host-memory buffers with an optional byte budget.
///
/// `for_device` lets host memory stand in for another device, which keeps
/// device-matching logic testable without accelerator hardware.
#[derive(Debug, Clone)]
pub struct HostBufferFactory {
    device: DeviceType,
    limit: Option<usize>,
    usage: Arc<AtomicUsize>,
}

impl HostBufferFactory {
    /// Unlimited host memory for [`DeviceType::Cpu`].
    pub fn new() -> Self {
        Self::for_device(DeviceType::Cpu)
    }

    /// Host memory labelled as `device`.
    pub fn for_device(device: DeviceType) -> Self {
        Self {
            device,
            limit: None,
            usage: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse allocations that would push live bytes above `limit`.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Default for HostBufferFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferFactory for HostBufferFactory {
    fn device(&self) -> DeviceType {
        self.device
    }

    fn create(&self, bytes: usize) -> Result<Arc<Buffer>> {
        let in_use = self.usage.load(Ordering::Relaxed);
        if let Some(limit) = self.limit {
            if in_use + bytes > limit {
                return Err(Error::OutOfMemory {
                    device: self.device,
                    requested: bytes,
                    in_use,
                    limit,
                });
            }
        }

        self.usage.fetch_add(bytes, Ordering::Relaxed);
        let memory = HostMemory::tracked(bytes, Arc::clone(&self.usage));
        Ok(Arc::new(Buffer::new(self.device, Box::new(memory))))
    }

    fn bytes_in_use(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_ids_are_unique() {
        let a = Buffer::host(16);
        let b = Buffer::host(16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_host_memory_read_write() {
        let buffer = Buffer::host(8);
        buffer.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.read(4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.memory().read(2, 4).unwrap(), vec![3, 4, 0, 0]);
    }

    #[test]
    fn test_out_of_range_access_is_an_error() {
        let buffer = Buffer::host(4);
        assert!(buffer.read(8).is_err());
        assert!(buffer.write(&[0; 5]).is_err());
    }

    #[test]
    fn test_copy_from() {
        let src = Buffer::host(4);
        src.write(&[9, 8, 7, 6]).unwrap();
        let dst = Buffer::host(8);
        dst.copy_from(&src, 4).unwrap();
        assert_eq!(dst.read(4).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_factory_limit_and_accounting() {
        let factory = HostBufferFactory::new().with_limit(100);
        let a = factory.create(60).unwrap();
        assert_eq!(factory.bytes_in_use(), 60);

        let err = factory.create(60).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { requested: 60, .. }));

        drop(a);
        assert_eq!(factory.bytes_in_use(), 0);
        assert!(factory.create(60).is_ok());
    }

    #[test]
    fn test_factory_device_label() {
        let factory = HostBufferFactory::for_device(DeviceType::Gpu);
        let buffer = factory.create(4).unwrap();
        assert_eq!(buffer.device(), DeviceType::Gpu);
    }
}
