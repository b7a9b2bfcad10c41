//! Memory-footprint analysis.
//!
//! Decides which layer outputs must be retained across more than one hop.
//! Outputs that do not need storage are eligible for the single temporary
//! slot or the ping-pong allocator.

use cairn_core::Model;

/// Decides whether a layer's output must live in long-term storage.
pub trait StorageAnalysis: Send + Sync {
    fn requires_storage(&self, model: &Model, layer_index: usize) -> bool;
}

/// Default analysis: an output can skip storage only when its sole consumer
/// is the immediately following layer and it is not a model output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FootprintAnalysis;

impl StorageAnalysis for FootprintAnalysis {
    fn requires_storage(&self, model: &Model, layer_index: usize) -> bool {
        let Some(layer) = model.layers().get(layer_index) else {
            return true;
        };
        if model.is_output(&layer.name) {
            return true;
        }
        !matches!(model.consumers(&layer.name).as_slice(), [next] if *next == layer_index + 1)
    }
}

/// Analysis that keeps every output in storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetainAll;

impl StorageAnalysis for RetainAll {
    fn requires_storage(&self, _model: &Model, _layer_index: usize) -> bool {
        true
    }
}
