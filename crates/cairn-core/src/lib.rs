//! Core data model for the cairn inference runtime.
//!
//! This crate provides the foundational types every other cairn crate builds on:
//! - Element and device descriptors (`DataType`, `DeviceType`, `Shape`)
//! - Physical storage (`Buffer`, `DeviceMemory`, `BufferFactory`)
//! - Logical tensor handles (`Tensor`) that may or may not be bound to a buffer
//! - The static layer graph (`Layer`, `Model`) with validation and topological ordering

pub mod buffer;
pub mod model;
pub mod tensor;
pub mod types;

pub use buffer::{Buffer, BufferFactory, BufferId, DeviceMemory, HostBufferFactory, HostMemory};
pub use model::{Attribute, Layer, Model, ModelBuilder, ModelInput};
pub use tensor::{AllocatorId, Element, Tensor, TensorId};
pub use types::{AllocationScope, DataType, DeviceType, Shape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for cairn-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Duplicate output name '{0}'")]
    DuplicateOutput(String),

    #[error("Layer '{layer}' references unknown input '{input}'")]
    BrokenLink { layer: String, input: String },

    #[error("Graph contains a cycle through layer '{0}'")]
    Cycle(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Data type mismatch: expected {expected:?}, found {found:?}")]
    DataType { expected: DataType, found: DataType },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Out of memory on {device}: requested {requested} bytes with {in_use} of {limit} in use")]
    OutOfMemory {
        device: DeviceType,
        requested: usize,
        in_use: usize,
        limit: usize,
    },

    #[error("Tensor {0} is invalidated (no buffer bound)")]
    Invalidated(TensorId),
}
