//! Common test utilities for runtime integration tests.
//!
//! Graph builders and a restricted backend shared across the test files.

#![allow(dead_code)]

use cairn_core::{Attribute, BufferFactory, DeviceType, Layer, Model, ModelBuilder, Tensor};
use cairn_runtime::{Backend, CpuBackend, ExecutionContext, Result, RuntimeError, StorageAnalysis};
use std::sync::Arc;

/// Install a debug-level test subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_test_writer()
        .try_init();
}

/// Linear chain `x -> A -> B -> C -> D`, D being the only output.
pub fn make_chain_model(width: usize) -> Model {
    ModelBuilder::new()
        .input("x", [width])
        .layer(Layer::new("A", "Relu").with_inputs(["x"]))
        .layer(Layer::new("B", "Neg").with_inputs(["A"]))
        .layer(Layer::new("C", "Relu").with_inputs(["B"]))
        .layer(Layer::new("D", "Neg").with_inputs(["C"]))
        .build()
        .expect("chain model")
}

/// Diamond `x -> P -> {Q, R} -> S`.
pub fn make_diamond_model(width: usize) -> Model {
    ModelBuilder::new()
        .input("x", [width])
        .layer(Layer::new("P", "Relu").with_inputs(["x"]))
        .layer(Layer::new("Q", "Neg").with_inputs(["P"]))
        .layer(Layer::new("R", "Scale").with_inputs(["P"]).with_attribute("alpha", Attribute::Float(2.0)))
        .layer(Layer::new("S", "Add").with_inputs(["Q", "R"]))
        .build()
        .expect("diamond model")
}

/// Chain of `depth` alternating Relu/Neg layers named `l0..`.
pub fn make_deep_chain(depth: usize, width: usize) -> Model {
    let mut builder = ModelBuilder::new().input("x", [width]);
    let mut previous = "x".to_string();
    for i in 0..depth {
        let name = format!("l{i}");
        let op = if i % 2 == 0 { "Relu" } else { "Neg" };
        builder = builder.layer(Layer::new(&name, op).with_inputs([previous.as_str()]));
        previous = name;
    }
    builder.build().expect("deep chain")
}

/// Five layers, the third of which fails.
pub fn make_failing_model() -> Model {
    ModelBuilder::new()
        .input("x", [4])
        .layer(Layer::new("l1", "Relu").with_inputs(["x"]))
        .layer(Layer::new("l2", "Scale").with_inputs(["l1"]).with_attribute("alpha", Attribute::Float(3.0)))
        .layer(Layer::new("l3", "Fail").with_inputs(["l2"]))
        .layer(Layer::new("l4", "Relu").with_inputs(["l3"]))
        .layer(Layer::new("l5", "Neg").with_inputs(["l4"]))
        .build()
        .expect("failing model")
}

/// Reshape feeding two consumers, so the reshaped view shares a buffer.
pub fn make_reshape_model() -> Model {
    ModelBuilder::new()
        .input("x", [2, 3])
        .layer(Layer::new("a", "Relu").with_inputs(["x"]))
        .layer(
            Layer::new("flat", "Reshape")
                .with_inputs(["a"])
                .with_attribute("shape", Attribute::Ints(vec![-1])),
        )
        .layer(Layer::new("b", "Neg").with_inputs(["flat"]))
        .layer(Layer::new("c", "Add").with_inputs(["b", "flat"]))
        .build()
        .expect("reshape model")
}

pub fn input(data: &[f32]) -> Tensor {
    Tensor::from_vec(data.to_vec(), [data.len()]).expect("input tensor")
}

/// A backend that only runs the listed ops, delegating to the CPU kernels.
#[derive(Debug)]
pub struct RestrictedBackend {
    ops: Vec<&'static str>,
    inner: CpuBackend,
}

impl RestrictedBackend {
    pub fn new(ops: &[&'static str]) -> Self {
        Self {
            ops: ops.to_vec(),
            inner: CpuBackend::new(),
        }
    }
}

impl Backend for RestrictedBackend {
    fn name(&self) -> &str {
        "restricted"
    }

    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn buffer_factory(&self) -> Arc<dyn BufferFactory> {
        self.inner.buffer_factory()
    }

    fn supports(&self, op_type: &str) -> bool {
        self.ops.contains(&op_type)
    }

    fn execute(
        &self,
        layer: &Layer,
        inputs: &[Option<Tensor>],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Tensor> {
        self.inner.execute(layer, inputs, ctx)
    }
}

/// A backend that returns its scratch tensor as the output.
#[derive(Debug, Default)]
pub struct LeakyBackend;

impl Backend for LeakyBackend {
    fn name(&self) -> &str {
        "leaky"
    }

    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn buffer_factory(&self) -> Arc<dyn BufferFactory> {
        Arc::new(cairn_core::HostBufferFactory::new())
    }

    fn supports(&self, _op_type: &str) -> bool {
        true
    }

    fn execute(
        &self,
        _layer: &Layer,
        inputs: &[Option<Tensor>],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Tensor> {
        let shape = inputs[0].as_ref().map(|t| t.shape().clone()).unwrap_or_default();
        ctx.alloc_scratch(shape, cairn_core::DataType::F32)
    }
}

/// Storage analysis that never asks for a named binding.
#[derive(Debug)]
pub struct NeverStore;

impl StorageAnalysis for NeverStore {
    fn requires_storage(&self, _model: &Model, _layer_index: usize) -> bool {
        false
    }
}

/// A backend whose kernels allocate their output and then fail.
#[derive(Debug, Default)]
pub struct FailAfterAllocBackend;

impl Backend for FailAfterAllocBackend {
    fn name(&self) -> &str {
        "fail-after-alloc"
    }

    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn buffer_factory(&self) -> Arc<dyn BufferFactory> {
        Arc::new(cairn_core::HostBufferFactory::new())
    }

    fn supports(&self, _op_type: &str) -> bool {
        true
    }

    fn execute(
        &self,
        layer: &Layer,
        inputs: &[Option<Tensor>],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Tensor> {
        let shape = inputs[0].as_ref().map(|t| t.shape().clone()).unwrap_or_default();
        ctx.alloc_output(shape, cairn_core::DataType::F32)?;
        Err(RuntimeError::kernel(&layer.op_type, "failed after allocating"))
    }
}
