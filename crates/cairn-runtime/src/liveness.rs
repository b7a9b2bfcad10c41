//! Liveness planning.
//!
//! For every layer, the plan lists the previously produced names whose last
//! consumer is that layer. Those names are safe to release as soon as the
//! layer has executed. Model inputs, model outputs and constants form the
//! preserve set and are never listed.

use cairn_core::Model;
use std::collections::{HashMap, HashSet};

/// Per-layer dispose sets for one model.
#[derive(Debug, Clone, Default)]
pub struct LivenessPlan {
    /// Indexed by layer position; names sorted for deterministic release order.
    dispose_after: Vec<Vec<String>>,
    last_consumer: HashMap<String, usize>,
    preserved: HashSet<String>,
}

impl LivenessPlan {
    /// Compute the plan by walking the layers in execution order.
    ///
    /// A produced name nobody reads is disposed right after its own layer
    /// unless it is preserved.
    #[tracing::instrument(skip_all, fields(layers = model.len()))]
    pub fn build(model: &Model) -> Self {
        let mut last_consumer: HashMap<String, usize> = HashMap::new();
        for (index, layer) in model.layers().iter().enumerate() {
            for input in layer.bound_inputs() {
                last_consumer
                    .entry(input.to_string())
                    .and_modify(|last| *last = (*last).max(index))
                    .or_insert(index);
            }
        }

        let preserved: HashSet<String> = model
            .input_names()
            .map(str::to_string)
            .chain(model.outputs().iter().cloned())
            .chain(model.constants().keys().cloned())
            .collect();

        let mut dispose_after = vec![Vec::new(); model.len()];
        for (name, &index) in &last_consumer {
            if !preserved.contains(name) {
                dispose_after[index].push(name.clone());
            }
        }
        for (index, layer) in model.layers().iter().enumerate() {
            if !last_consumer.contains_key(&layer.name) && !preserved.contains(&layer.name) {
                dispose_after[index].push(layer.name.clone());
            }
        }
        for names in &mut dispose_after {
            names.sort();
        }

        tracing::debug!(
            tracked = last_consumer.len(),
            preserved = preserved.len(),
            "built liveness plan"
        );

        Self {
            dispose_after,
            last_consumer,
            preserved,
        }
    }

    /// Names to release once layer `index` has executed.
    pub fn dispose_after(&self, index: usize) -> &[String] {
        self.dispose_after.get(index).map_or(&[], Vec::as_slice)
    }

    /// Index of the last layer reading `name`, if any layer reads it.
    pub fn last_consumer(&self, name: &str) -> Option<usize> {
        self.last_consumer.get(name).copied()
    }

    pub fn is_preserved(&self, name: &str) -> bool {
        self.preserved.contains(name)
    }

    /// Number of layers covered by the plan.
    pub fn len(&self) -> usize {
        self.dispose_after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispose_after.is_empty()
    }
}
