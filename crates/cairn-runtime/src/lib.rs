//! Execution core for the cairn inference runtime.
//!
//! This crate binds tensors to physical memory and drives a model layer by
//! layer:
//!
//! - [`TensorAllocator`] caches buffers in a size-bucketed or shape-exact
//!   free list and tracks how many tensors share each buffer
//! - [`LivenessPlan`] works out after which layer each value is dead
//! - [`VariableStore`] binds names to tensors under one of three
//!   [`AllocationPolicy`] values
//! - [`Session`] steps through the layers cooperatively via a [`Schedule`]
//!
//! Kernels are supplied by a [`Backend`]; [`CpuBackend`] is a small
//! reference implementation and the default fallback.
//!
//! # Example
//!
//! ```
//! use cairn_core::{Layer, ModelBuilder, Tensor};
//! use cairn_runtime::{AllocationPolicy, CpuBackend, RuntimeConfig, Session};
//!
//! let model = ModelBuilder::new()
//!     .input("x", [2])
//!     .layer(Layer::new("y", "Relu").with_inputs(["x"]))
//!     .build()?;
//! let config = RuntimeConfig::default().with_policy(AllocationPolicy::ThreeTier);
//! let mut session = Session::new(model, CpuBackend::new(), config)?;
//!
//! let x = Tensor::from_vec(vec![-1.0f32, 1.0], [2])?;
//! let y = session.execute(&[("x", x)])?.take_output("y")?;
//! assert_eq!(y.to_vec::<f32>()?, vec![0.0, 1.0]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod allocator;
pub mod backend;
pub mod config;
pub mod cpu;
pub mod error;
pub mod footprint;
#[cfg(feature = "wgpu")]
pub mod gpu;
pub mod liveness;
pub mod session;
pub mod store;

pub use allocator::{AllocatorStats, CachePolicy, TensorAllocator};
pub use backend::{Backend, ExecutionContext};
pub use config::{AllocationPolicy, RuntimeConfig};
pub use cpu::CpuBackend;
pub use error::{Result, RuntimeError};
pub use footprint::{FootprintAnalysis, RetainAll, StorageAnalysis};
#[cfg(feature = "wgpu")]
pub use gpu::{WgpuBufferFactory, WgpuContext, WgpuMemory};
pub use liveness::LivenessPlan;
pub use session::{Schedule, ScheduleProgress, ScheduleState, Session, StepReport, StepResult};
pub use store::{StoreStats, TeardownReport, VariableStore};
