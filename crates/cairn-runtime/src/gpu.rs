//! wgpu device memory.
//!
//! Lets the allocator cache GPU buffers exactly like host buffers. Reads go
//! through a staging buffer and block until the device is idle.

use crate::error::{Result, RuntimeError};
use cairn_core::{Buffer, BufferFactory, DeviceMemory, DeviceType};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const ALIGN: usize = wgpu::COPY_BUFFER_ALIGNMENT as usize;

fn align_up(n: usize) -> usize {
    n.div_ceil(ALIGN) * ALIGN
}

fn device_error(message: impl Into<String>) -> cairn_core::Error {
    cairn_core::Error::Device(message.into())
}

/// A storage buffer on a wgpu device.
#[derive(Debug)]
pub struct WgpuMemory {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    buffer: wgpu::Buffer,
    len: usize,
    usage: Arc<AtomicUsize>,
}

impl WgpuMemory {
    /// The native buffer, for binding in compute passes.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    fn check(&self, offset: usize, len: usize) -> cairn_core::Result<()> {
        if offset % ALIGN != 0 {
            return Err(device_error(format!(
                "offset {offset} is not a multiple of {ALIGN}"
            )));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(device_error(format!(
                "access of {len} bytes at offset {offset} exceeds allocation of {} bytes",
                self.len
            ))),
        }
    }
}

impl DeviceMemory for WgpuMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, len: usize) -> cairn_core::Result<Vec<u8>> {
        self.check(offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let size = align_up(len).min(self.len - offset) as u64;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cairn_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cairn_readback_copy"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, offset as u64, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| device_error(format!("GPU poll failed during readback: {e:?}")))?;
        receiver
            .recv()
            .map_err(|e| device_error(format!("map recv failed: {e}")))?
            .map_err(|e| device_error(format!("map failed: {e}")))?;

        let data = slice.get_mapped_range()[..len].to_vec();
        staging.unmap();
        Ok(data)
    }

    fn write(&self, offset: usize, data: &[u8]) -> cairn_core::Result<()> {
        self.check(offset, data.len())?;
        if data.len() % ALIGN == 0 {
            self.queue.write_buffer(&self.buffer, offset as u64, data);
        } else {
            // Capacity is aligned, so padding stays inside the allocation.
            let mut padded = data.to_vec();
            padded.resize(align_up(data.len()), 0);
            self.queue.write_buffer(&self.buffer, offset as u64, &padded);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for WgpuMemory {
    fn drop(&mut self) {
        self.usage.fetch_sub(self.len, Ordering::Relaxed);
        self.buffer.destroy();
    }
}

/// Creates storage buffers on a wgpu device.
#[derive(Debug, Clone)]
pub struct WgpuBufferFactory {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    usage: Arc<AtomicUsize>,
}

impl WgpuBufferFactory {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            usage: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl BufferFactory for WgpuBufferFactory {
    fn device(&self) -> DeviceType {
        DeviceType::Gpu
    }

    fn create(&self, bytes: usize) -> cairn_core::Result<Arc<Buffer>> {
        let len = align_up(bytes.max(ALIGN));
        let limit = self.device.limits().max_buffer_size as usize;
        if len > limit {
            return Err(cairn_core::Error::OutOfMemory {
                device: DeviceType::Gpu,
                requested: len,
                in_use: self.usage.load(Ordering::Relaxed),
                limit,
            });
        }

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("cairn_tensor"),
            size: len as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.usage.fetch_add(len, Ordering::Relaxed);
        let memory = WgpuMemory {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            buffer,
            len,
            usage: Arc::clone(&self.usage),
        };
        Ok(Arc::new(Buffer::new(DeviceType::Gpu, Box::new(memory))))
    }

    fn bytes_in_use(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}

/// A wgpu device and queue.
#[derive(Debug)]
pub struct WgpuContext {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
}

impl WgpuContext {
    /// Open the default high-performance adapter.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or device creation fails.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RuntimeError::Gpu(format!("no suitable GPU adapter: {e}")))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| RuntimeError::Gpu(format!("failed to create device: {e}")))?;

        tracing::debug!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "opened GPU");
        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn buffer_factory(&self) -> WgpuBufferFactory {
        WgpuBufferFactory::new(Arc::clone(&self.device), Arc::clone(&self.queue))
    }

    /// Wait for submitted work, or only kick the device when not blocking.
    pub fn flush(&self, blocking: bool) -> Result<()> {
        let poll = if blocking {
            wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            }
        } else {
            wgpu::PollType::Poll
        };
        self.device
            .poll(poll)
            .map(|_| ())
            .map_err(|e| RuntimeError::Gpu(format!("GPU poll failed: {e:?}")))
    }
}
