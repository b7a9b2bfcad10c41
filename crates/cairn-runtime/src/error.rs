//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime execution errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Graph, tensor or device error from the core crate.
    #[error(transparent)]
    Core(#[from] cairn_core::Error),

    /// A layer reads a name that nothing has bound.
    #[error("Layer '{layer}' reads '{input}', which is not bound to any tensor")]
    MissingBinding { layer: String, input: String },

    /// Tensor not found.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// The model declares no input with this name.
    #[error("Model has no input named '{0}'")]
    UnknownInput(String),

    /// A declared input has neither a bound tensor nor a known shape.
    #[error("Input '{0}' is neither bound to a tensor nor given a shape")]
    InputNotBound(String),

    /// The model has more than one input, so no default input name exists.
    #[error("Model declares {0} inputs; a default input requires exactly one")]
    AmbiguousInput(usize),

    /// Neither the configured backend nor the fallback can run this layer.
    #[error("No backend supports op '{op_type}' of layer '{layer}'")]
    UnsupportedOp { layer: String, op_type: String },

    /// A kernel rejected its inputs or failed to compute.
    #[error("Kernel '{op_type}' failed: {message}")]
    Kernel { op_type: String, message: String },

    /// A layer failed mid-run.
    #[error("Layer '{layer}' failed: {source}")]
    Execution {
        layer: String,
        #[source]
        source: Box<RuntimeError>,
    },

    /// A backend returned layer-local scratch as a layer output.
    #[error("Layer '{0}' returned an ephemeral scratch tensor as its output")]
    EphemeralEscape(String),

    /// wgpu error.
    #[cfg(feature = "wgpu")]
    #[error("wgpu error: {0}")]
    Gpu(String),
}

impl RuntimeError {
    /// Build a kernel error.
    pub fn kernel(op_type: &str, message: impl Into<String>) -> Self {
        RuntimeError::Kernel {
            op_type: op_type.to_string(),
            message: message.into(),
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
