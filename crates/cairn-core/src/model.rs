//! Static layer graph.
//!
//! A [`Model`] is an ordered list of [`Layer`]s, each producing one named
//! output from named inputs. Construction validates the links and orders the
//! layers topologically, so everything downstream may assume a DAG whose
//! producers precede their consumers.

use crate::tensor::Tensor;
use crate::types::{DataType, Shape};
use crate::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// A layer attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    Ints(Vec<i64>),
}

/// One node of the computation graph: named inputs, one named output.
///
/// The layer's name is also the name of its output. Empty input names mark
/// unused optional slots.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
}

impl Layer {
    /// Create a layer with no inputs.
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Attribute) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    /// Float attribute, accepting integer values as well.
    pub fn float_attr(&self, key: &str) -> Option<f32> {
        match self.attributes.get(key)? {
            Attribute::Float(v) => Some(*v),
            Attribute::Int(v) => Some(*v as f32),
            Attribute::Ints(_) => None,
        }
    }

    pub fn ints_attr(&self, key: &str) -> Option<&[i64]> {
        match self.attributes.get(key)? {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }

    /// Input names that are actually connected.
    pub fn bound_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// A declared model input.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub name: String,
    /// Declared shape, `None` if the shape is only known once the caller binds a tensor.
    pub shape: Option<Shape>,
    pub dtype: DataType,
}

/// A validated, topologically ordered layer graph.
#[derive(Debug)]
pub struct Model {
    layers: Vec<Layer>,
    inputs: Vec<ModelInput>,
    outputs: Vec<String>,
    constants: HashMap<String, Tensor>,
    layer_index: HashMap<String, usize>,
}

impl Model {
    /// Validate and order a graph.
    ///
    /// If `outputs` is empty the last layer's output becomes the model output.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidGraph` for an empty graph, unnamed layers or unknown outputs
    /// - `Error::DuplicateOutput` if a name is produced more than once
    /// - `Error::BrokenLink` if a layer reads a name nothing produces
    /// - `Error::Cycle` if the layers cannot be ordered
    pub fn new(
        layers: Vec<Layer>,
        inputs: Vec<ModelInput>,
        outputs: Vec<String>,
        constants: HashMap<String, Tensor>,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvalidGraph("model has no layers".to_string()));
        }

        let mut names: HashSet<&str> = HashSet::new();
        let declared = inputs
            .iter()
            .map(|input| input.name.as_str())
            .chain(constants.keys().map(String::as_str))
            .chain(layers.iter().map(|layer| layer.name.as_str()));
        for name in declared {
            if name.is_empty() {
                return Err(Error::InvalidGraph(
                    "layers, inputs and constants must be named".to_string(),
                ));
            }
            if !names.insert(name) {
                return Err(Error::DuplicateOutput(name.to_string()));
            }
        }

        for layer in &layers {
            if let Some(input) = layer.bound_inputs().find(|input| !names.contains(input)) {
                return Err(Error::BrokenLink {
                    layer: layer.name.clone(),
                    input: input.to_string(),
                });
            }
        }

        let layers = order_layers(layers)?;
        let layer_index: HashMap<String, usize> = layers
            .iter()
            .enumerate()
            .map(|(index, layer)| (layer.name.clone(), index))
            .collect();

        let outputs = if outputs.is_empty() {
            vec![layers[layers.len() - 1].name.clone()]
        } else {
            outputs
        };
        if let Some(missing) = outputs.iter().find(|name| !layer_index.contains_key(*name)) {
            return Err(Error::InvalidGraph(format!(
                "output '{missing}' is not produced by any layer"
            )));
        }

        tracing::debug!(
            layers = layers.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            constants = constants.len(),
            "validated model"
        );

        Ok(Self {
            layers,
            inputs,
            outputs,
            constants,
            layer_index,
        })
    }

    /// Layers in execution order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn inputs(&self) -> &[ModelInput] {
        &self.inputs
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|input| input.name.as_str())
    }

    pub fn input(&self, name: &str) -> Option<&ModelInput> {
        self.inputs.iter().find(|input| input.name == name)
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn constants(&self) -> &HashMap<String, Tensor> {
        &self.constants
    }

    pub fn constant(&self, name: &str) -> Option<&Tensor> {
        self.constants.get(name)
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layer_index.get(name).map(|&index| &self.layers[index])
    }

    /// Position of a layer in execution order.
    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layer_index.get(name).copied()
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|input| input.name == name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|output| output == name)
    }

    /// Indices of the layers that read `name`, ascending.
    pub fn consumers(&self, name: &str) -> Vec<usize> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.bound_inputs().any(|input| input == name))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Keep the declared order when it is already topological, otherwise sort.
fn order_layers(layers: Vec<Layer>) -> Result<Vec<Layer>> {
    let position: HashMap<&str, usize> = layers
        .iter()
        .enumerate()
        .map(|(index, layer)| (layer.name.as_str(), index))
        .collect();

    let mut dep_graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..layers.len()).map(|i| dep_graph.add_node(i)).collect();

    let mut in_order = true;
    for (consumer, layer) in layers.iter().enumerate() {
        for input in layer.bound_inputs() {
            if let Some(&producer) = position.get(input) {
                dep_graph.add_edge(nodes[producer], nodes[consumer], ());
                if producer >= consumer {
                    in_order = false;
                }
            }
        }
    }

    if in_order {
        return Ok(layers);
    }

    let sorted = petgraph::algo::toposort(&dep_graph, None)
        .map_err(|cycle| Error::Cycle(layers[dep_graph[cycle.node_id()]].name.clone()))?;

    let mut slots: Vec<Option<Layer>> = layers.into_iter().map(Some).collect();
    Ok(sorted
        .into_iter()
        .filter_map(|node| slots[dep_graph[node]].take())
        .collect())
}

/// Incremental construction of a [`Model`].
#[derive(Debug, Default)]
pub struct ModelBuilder {
    layers: Vec<Layer>,
    inputs: Vec<ModelInput>,
    outputs: Vec<String>,
    constants: HashMap<String, Tensor>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an f32 input with a known shape.
    pub fn input(mut self, name: impl Into<String>, shape: impl Into<Shape>) -> Self {
        self.inputs.push(ModelInput {
            name: name.into(),
            shape: Some(shape.into()),
            dtype: DataType::F32,
        });
        self
    }

    /// Declare an f32 input whose shape comes from the bound tensor.
    pub fn dynamic_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(ModelInput {
            name: name.into(),
            shape: None,
            dtype: DataType::F32,
        });
        self
    }

    pub fn constant(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.constants.insert(name.into(), tensor);
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn build(self) -> Result<Model> {
        Model::new(self.layers, self.inputs, self.outputs, self.constants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ModelBuilder {
        ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("a", "Relu").with_inputs(["x"]))
            .layer(Layer::new("b", "Neg").with_inputs(["a"]))
            .layer(Layer::new("c", "Relu").with_inputs(["b"]))
    }

    #[test]
    fn test_default_output_is_last_layer() {
        let model = chain().build().unwrap();
        assert_eq!(model.outputs(), &["c".to_string()]);
        assert!(model.is_output("c"));
        assert!(model.is_input("x"));
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn test_declared_topological_order_is_kept() {
        let model = chain().build().unwrap();
        let names: Vec<_> = model.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(model.layer_index("b"), Some(1));
    }

    #[test]
    fn test_out_of_order_layers_are_sorted() {
        let model = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("c", "Relu").with_inputs(["b"]))
            .layer(Layer::new("b", "Neg").with_inputs(["a"]))
            .layer(Layer::new("a", "Relu").with_inputs(["x"]))
            .output("c")
            .build()
            .unwrap();

        let a = model.layer_index("a").unwrap();
        let b = model.layer_index("b").unwrap();
        let c = model.layer_index("c").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("a", "Add").with_inputs(["x", "b"]))
            .layer(Layer::new("b", "Relu").with_inputs(["a"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn test_broken_link_names_layer_and_input() {
        let err = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("a", "Add").with_inputs(["x", "missing"]))
            .build()
            .unwrap_err();
        match err {
            Error::BrokenLink { layer, input } => {
                assert_eq!(layer, "a");
                assert_eq!(input, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_output_is_rejected() {
        let err = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("a", "Relu").with_inputs(["x"]))
            .layer(Layer::new("a", "Neg").with_inputs(["x"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateOutput(name) if name == "a"));
    }

    #[test]
    fn test_unknown_output_is_rejected() {
        let err = chain().output("nope").build().unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));
    }

    #[test]
    fn test_empty_inputs_are_optional_slots() {
        let model = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("a", "Add").with_inputs(["x", ""]))
            .build()
            .unwrap();
        assert_eq!(model.layers()[0].bound_inputs().count(), 1);
    }

    #[test]
    fn test_consumers() {
        let model = ModelBuilder::new()
            .input("x", [4])
            .layer(Layer::new("p", "Relu").with_inputs(["x"]))
            .layer(Layer::new("q", "Neg").with_inputs(["p"]))
            .layer(Layer::new("r", "Relu").with_inputs(["p"]))
            .layer(Layer::new("s", "Add").with_inputs(["q", "r"]))
            .build()
            .unwrap();
        assert_eq!(model.consumers("p"), vec![1, 2]);
        assert_eq!(model.consumers("s"), Vec::<usize>::new());
    }

    #[test]
    fn test_attributes() {
        let layer = Layer::new("s", "Scale")
            .with_attribute("alpha", Attribute::Float(0.5))
            .with_attribute("shape", Attribute::Ints(vec![2, 2]));
        assert_eq!(layer.float_attr("alpha"), Some(0.5));
        assert_eq!(layer.ints_attr("shape"), Some(&[2i64, 2][..]));
        assert_eq!(layer.float_attr("shape"), None);
    }
}
