//! Reference CPU backend.
//!
//! f32 kernels over host memory. Slow but simple; also serves as the
//! fallback for layers the configured backend cannot run.

use crate::backend::{Backend, ExecutionContext};
use crate::error::{Result, RuntimeError};
use cairn_core::{BufferFactory, DataType, DeviceType, HostBufferFactory, Layer, Shape, Tensor};
use std::sync::Arc;

const SUPPORTED_OPS: &[&str] = &[
    "Identity", "Reshape", "Add", "Sub", "Mul", "Relu", "Neg", "Scale", "Softmax", "Fail",
];

/// Executes layers on the host.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    factory: Arc<HostBufferFactory>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::with_factory(HostBufferFactory::new())
    }

    /// Use a specific host factory, e.g. one with a memory limit.
    pub fn with_factory(factory: HostBufferFactory) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn input<'t>(layer: &Layer, inputs: &'t [Option<Tensor>], slot: usize) -> Result<&'t Tensor> {
    inputs
        .get(slot)
        .and_then(Option::as_ref)
        .ok_or_else(|| RuntimeError::kernel(&layer.op_type, format!("missing input {slot}")))
}

fn read_f32(layer: &Layer, tensor: &Tensor) -> Result<Vec<f32>> {
    if tensor.dtype() != DataType::F32 {
        return Err(RuntimeError::kernel(
            &layer.op_type,
            format!("expected f32 input, got {:?}", tensor.dtype()),
        ));
    }
    Ok(tensor.to_vec::<f32>()?)
}

fn unary(
    layer: &Layer,
    inputs: &[Option<Tensor>],
    ctx: &mut ExecutionContext<'_>,
    f: impl Fn(f32) -> f32,
) -> Result<Tensor> {
    let x = input(layer, inputs, 0)?;
    let data: Vec<f32> = read_f32(layer, x)?.into_iter().map(f).collect();
    let output = ctx.alloc_output(x.shape().clone(), DataType::F32)?;
    output.write_slice(&data)?;
    Ok(output)
}

/// Elementwise binary op. The right operand may be a scalar or match the
/// left operand's last dimension.
fn binary(
    layer: &Layer,
    inputs: &[Option<Tensor>],
    ctx: &mut ExecutionContext<'_>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Tensor> {
    let a = input(layer, inputs, 0)?;
    let b = input(layer, inputs, 1)?;
    let lhs = read_f32(layer, a)?;
    let rhs = read_f32(layer, b)?;

    let data: Vec<f32> = if rhs.len() == lhs.len() {
        lhs.iter().zip(&rhs).map(|(&x, &y)| f(x, y)).collect()
    } else if rhs.len() == 1 {
        lhs.iter().map(|&x| f(x, rhs[0])).collect()
    } else if !rhs.is_empty() && rhs.len() == a.shape().last_dim() {
        lhs.iter()
            .zip(rhs.iter().cycle())
            .map(|(&x, &y)| f(x, y))
            .collect()
    } else {
        return Err(RuntimeError::kernel(
            &layer.op_type,
            format!("cannot broadcast {} onto {}", b.shape(), a.shape()),
        ));
    };

    let output = ctx.alloc_output(a.shape().clone(), DataType::F32)?;
    output.write_slice(&data)?;
    Ok(output)
}

/// Resolve a target shape with at most one `-1` and `0` meaning "keep".
fn reshape_target(layer: &Layer, source: &Shape) -> Result<Shape> {
    let requested = layer
        .ints_attr("shape")
        .ok_or_else(|| RuntimeError::kernel("Reshape", "missing 'shape' attribute"))?;

    let mut dims = Vec::with_capacity(requested.len());
    let mut inferred = None;
    for (axis, &dim) in requested.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => {
                inferred = Some(axis);
                dims.push(1);
            }
            0 => dims.push(source.dims().get(axis).copied().ok_or_else(|| {
                RuntimeError::kernel("Reshape", format!("axis {axis} does not exist in {source}"))
            })?),
            d if d > 0 => dims.push(d as usize),
            d => {
                return Err(RuntimeError::kernel(
                    "Reshape",
                    format!("invalid dimension {d} in target shape"),
                ));
            }
        }
    }

    let known: usize = dims.iter().product();
    if let Some(axis) = inferred {
        if known == 0 || source.numel() % known != 0 {
            return Err(RuntimeError::kernel(
                "Reshape",
                format!("cannot infer dimension for {source} -> {requested:?}"),
            ));
        }
        dims[axis] = source.numel() / known;
    }

    let target = Shape::new(dims);
    if target.numel() != source.numel() {
        return Err(RuntimeError::kernel(
            "Reshape",
            format!("cannot reshape {source} to {target}"),
        ));
    }
    Ok(target)
}

/// Softmax over the last dimension, staging exponentials in scratch memory.
fn softmax(
    layer: &Layer,
    inputs: &[Option<Tensor>],
    ctx: &mut ExecutionContext<'_>,
) -> Result<Tensor> {
    let x = input(layer, inputs, 0)?;
    let data = read_f32(layer, x)?;
    let width = x.shape().last_dim().max(1);

    let scratch = ctx.alloc_scratch(x.shape().clone(), DataType::F32)?;
    let mut exps = Vec::with_capacity(data.len());
    for row in data.chunks(width) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        exps.extend(row.iter().map(|&v| (v - max).exp()));
    }
    scratch.write_slice(&exps)?;

    let staged = scratch.to_vec::<f32>()?;
    let mut result = Vec::with_capacity(staged.len());
    for row in staged.chunks(width) {
        let sum: f32 = row.iter().sum();
        result.extend(row.iter().map(|&v| v / sum));
    }

    let output = ctx.alloc_output(x.shape().clone(), DataType::F32)?;
    output.write_slice(&result)?;
    Ok(output)
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn buffer_factory(&self) -> Arc<dyn BufferFactory> {
        self.factory.clone()
    }

    fn supports(&self, op_type: &str) -> bool {
        SUPPORTED_OPS.contains(&op_type)
    }

    fn execute(
        &self,
        layer: &Layer,
        inputs: &[Option<Tensor>],
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Tensor> {
        match layer.op_type.as_str() {
            "Identity" => {
                let x = input(layer, inputs, 0)?;
                ctx.alias(x, x.shape().clone())
            }
            "Reshape" => {
                let x = input(layer, inputs, 0)?;
                let target = reshape_target(layer, x.shape())?;
                ctx.alias(x, target)
            }
            "Add" => binary(layer, inputs, ctx, |a, b| a + b),
            "Sub" => binary(layer, inputs, ctx, |a, b| a - b),
            "Mul" => binary(layer, inputs, ctx, |a, b| a * b),
            "Relu" => unary(layer, inputs, ctx, |v| v.max(0.0)),
            "Neg" => unary(layer, inputs, ctx, |v| -v),
            "Scale" => {
                let alpha = layer.float_attr("alpha").unwrap_or(1.0);
                unary(layer, inputs, ctx, move |v| v * alpha)
            }
            "Softmax" => softmax(layer, inputs, ctx),
            "Fail" => {
                let message = match layer.attribute("message") {
                    Some(attr) => format!("{attr:?}"),
                    None => "failure requested".to_string(),
                };
                Err(RuntimeError::kernel("Fail", message))
            }
            other => Err(RuntimeError::UnsupportedOp {
                layer: layer.name.clone(),
                op_type: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::Attribute;

    #[test]
    fn test_reshape_target() {
        let source = Shape::from([2, 3, 4]);
        let layer = Layer::new("r", "Reshape")
            .with_attribute("shape", Attribute::Ints(vec![0, -1]));
        assert_eq!(reshape_target(&layer, &source).unwrap(), Shape::from([2, 12]));

        let bad = Layer::new("r", "Reshape").with_attribute("shape", Attribute::Ints(vec![5, -1]));
        assert!(reshape_target(&bad, &source).is_err());

        let two_inferred =
            Layer::new("r", "Reshape").with_attribute("shape", Attribute::Ints(vec![-1, -1]));
        assert!(reshape_target(&two_inferred, &source).is_err());
    }

    #[test]
    fn test_supports() {
        let backend = CpuBackend::new();
        assert!(backend.supports("Softmax"));
        assert!(!backend.supports("MatMul"));
        assert_eq!(backend.buffer_factory().device(), DeviceType::Cpu);
    }
}
