//! Shape-annotated layer graphs.
//!
//! A [`LayerGraph`] is an acyclic graph of layer operations. Nodes are appended
//! through a [`GraphBuilder`], which computes each node's output shape from its
//! inputs when the node is added and rejects anything that does not fit. Node ids
//! are assigned in insertion order, so iterating `nodes()` visits every node after
//! all of its inputs.
//!
//! Shapes are stored channels-first internally; [`DataFormat`] only decides how
//! per-example shapes are read from and presented to the caller.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::hyperparameters::{DataFormat, PoolingType};

pub type NodeId = usize;

/// Output shape of a node, excluding the batch axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    Spatial { channels: usize, height: usize, width: usize },
    Flat { features: usize },
}

impl Shape {
    /// Number of values per example
    pub fn len(&self) -> usize {
        match *self {
            Shape::Spatial { channels, height, width } => channels * height * width,
            Shape::Flat { features } => features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel count for spatial shapes, feature count for flat ones
    pub fn channels(&self) -> usize {
        match *self {
            Shape::Spatial { channels, .. } => channels,
            Shape::Flat { features } => features,
        }
    }

    /// Per-example dimensions as laid out in `format`
    pub fn dims(&self, format: DataFormat) -> Vec<usize> {
        match *self {
            Shape::Spatial {
                channels,
                height,
                width,
            } => format.join(channels, height, width).to_vec(),
            Shape::Flat { features } => vec![features],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerOp {
    Input,
    /// Stride-1 convolution with same padding
    Conv2D { filters: usize, kernel_size: usize },
    /// Per-channel normalization with batch statistics
    BatchNorm { epsilon: f32, momentum: f32 },
    Activation(Activation),
    /// Non-overlapping `size` x `size` pooling
    Pool2D { kind: PoolingType, size: usize },
    Add,
    Flatten,
    Dropout { rate: f32 },
    Dense { units: usize },
}

impl LayerOp {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerOp::Input => "InputLayer",
            LayerOp::Conv2D { .. } => "Conv2D",
            LayerOp::BatchNorm { .. } => "BatchNormalization",
            LayerOp::Activation(Activation::LeakyReLU(_)) => "LeakyReLU",
            LayerOp::Activation(_) => "Activation",
            LayerOp::Pool2D { kind: PoolingType::Mean, .. } => "AveragePooling2D",
            LayerOp::Pool2D { kind: PoolingType::Max, .. } => "MaxPooling2D",
            LayerOp::Add => "Add",
            LayerOp::Flatten => "Flatten",
            LayerOp::Dropout { .. } => "Dropout",
            LayerOp::Dense { .. } => "Dense",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: LayerOp,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerGraph {
    data_format: DataFormat,
    nodes: Vec<Node>,
    output: NodeId,
}

impl LayerGraph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    /// The single input node is always the first node
    pub fn input_shape(&self) -> Shape {
        self.nodes[0].shape
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn output_shape(&self) -> Shape {
        self.nodes[self.output].shape
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes whose op satisfies `predicate`
    pub fn count_ops(&self, predicate: impl Fn(&LayerOp) -> bool) -> usize {
        self.nodes.iter().filter(|node| predicate(&node.op)).count()
    }

    /// Parameters held by one node, counting batch norm moving statistics
    pub fn node_parameter_count(&self, id: NodeId) -> usize {
        let node = &self.nodes[id];
        match node.op {
            LayerOp::Conv2D { filters, kernel_size } => {
                let in_channels = self.nodes[node.inputs[0]].shape.channels();
                (in_channels * kernel_size * kernel_size + 1) * filters
            }
            LayerOp::BatchNorm { .. } => 4 * node.shape.channels(),
            LayerOp::Dense { units } => (self.nodes[node.inputs[0]].shape.len() + 1) * units,
            LayerOp::Input
            | LayerOp::Activation(_)
            | LayerOp::Pool2D { .. }
            | LayerOp::Add
            | LayerOp::Flatten
            | LayerOp::Dropout { .. } => 0,
        }
    }

    pub fn parameter_count(&self) -> usize {
        (0..self.nodes.len()).map(|id| self.node_parameter_count(id)).sum()
    }

    /// Human readable table of layers, shapes and parameter counts
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<40}{:<22}{:>10}  Connected to", "Layer (type)", "Output Shape", "Param #")?;
        for (id, node) in self.nodes.iter().enumerate() {
            let label = format!("{} ({})", node.name, node.op.type_name());
            let dims = node
                .shape
                .dims(self.data_format)
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let connected = node
                .inputs
                .iter()
                .map(|&input| self.nodes[input].name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "{:<40}{:<22}{:>10}  {}",
                label,
                format!("(None, {})", dims),
                self.node_parameter_count(id),
                connected
            )?;
        }
        write!(f, "Total params: {}", self.parameter_count())
    }
}

/// Appends nodes to a graph, validating shapes as it goes
#[derive(Debug)]
pub struct GraphBuilder {
    data_format: DataFormat,
    nodes: Vec<Node>,
    names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new(data_format: DataFormat) -> Self {
        Self {
            data_format,
            nodes: Vec::new(),
            names: HashSet::new(),
        }
    }

    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    pub fn shape(&self, id: NodeId) -> Shape {
        self.nodes[id].shape
    }

    /// Adds the graph input. `dims` is read according to the builder's data format.
    pub fn input(&mut self, name: impl Into<String>, dims: [usize; 3]) -> Result<NodeId> {
        if !self.nodes.is_empty() {
            return Err(Error::graph("the input node must be added first"));
        }
        let (channels, height, width) = self.data_format.split(dims);
        if channels == 0 || height == 0 || width == 0 {
            return Err(Error::invalid_shape(format!(
                "input dimensions must be positive, got {:?}",
                dims
            )));
        }
        self.push(name, LayerOp::Input, Vec::new(), Shape::Spatial { channels, height, width })
    }

    pub fn conv2d(
        &mut self,
        name: impl Into<String>,
        input: NodeId,
        filters: usize,
        kernel_size: usize,
    ) -> Result<NodeId> {
        let (_, height, width) = self.spatial(input, "Conv2D")?;
        if filters == 0 {
            return Err(Error::graph("convolution needs at least one filter"));
        }
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(Error::graph(format!(
                "same padding needs an odd kernel size, got {}",
                kernel_size
            )));
        }
        let shape = Shape::Spatial { channels: filters, height, width };
        self.push(name, LayerOp::Conv2D { filters, kernel_size }, vec![input], shape)
    }

    pub fn batch_norm(&mut self, name: impl Into<String>, input: NodeId) -> Result<NodeId> {
        let shape = self.checked(input)?;
        self.push(name, LayerOp::BatchNorm { epsilon: 1e-3, momentum: 0.99 }, vec![input], shape)
    }

    pub fn activation(
        &mut self,
        name: impl Into<String>,
        input: NodeId,
        activation: Activation,
    ) -> Result<NodeId> {
        let shape = self.checked(input)?;
        if activation == Activation::Softmax && matches!(shape, Shape::Spatial { .. }) {
            return Err(Error::graph("softmax is only defined on flat tensors"));
        }
        self.push(name, LayerOp::Activation(activation), vec![input], shape)
    }

    pub fn pool2d(
        &mut self,
        name: impl Into<String>,
        input: NodeId,
        kind: PoolingType,
    ) -> Result<NodeId> {
        const SIZE: usize = 2;
        let (channels, height, width) = self.spatial(input, "pooling")?;
        let (height, width) = (height / SIZE, width / SIZE);
        if height == 0 || width == 0 {
            return Err(Error::invalid_shape(format!(
                "pooling would reduce node {} to an empty feature map",
                self.nodes[input].name
            )));
        }
        let shape = Shape::Spatial { channels, height, width };
        self.push(name, LayerOp::Pool2D { kind, size: SIZE }, vec![input], shape)
    }

    /// Element-wise sum; both inputs must have identical shapes
    pub fn add(&mut self, name: impl Into<String>, left: NodeId, right: NodeId) -> Result<NodeId> {
        let left_shape = self.checked(left)?;
        let right_shape = self.checked(right)?;
        if left_shape != right_shape {
            return Err(Error::graph(format!(
                "cannot add {:?} and {:?}",
                left_shape, right_shape
            )));
        }
        self.push(name, LayerOp::Add, vec![left, right], left_shape)
    }

    pub fn flatten(&mut self, name: impl Into<String>, input: NodeId) -> Result<NodeId> {
        let features = self.checked(input)?.len();
        self.push(name, LayerOp::Flatten, vec![input], Shape::Flat { features })
    }

    pub fn dropout(&mut self, name: impl Into<String>, input: NodeId, rate: f32) -> Result<NodeId> {
        let shape = self.checked(input)?;
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::graph(format!("dropout rate must lie in [0, 1), got {}", rate)));
        }
        self.push(name, LayerOp::Dropout { rate }, vec![input], shape)
    }

    pub fn dense(
        &mut self,
        name: impl Into<String>,
        input: NodeId,
        units: usize,
    ) -> Result<NodeId> {
        match self.checked(input)? {
            Shape::Flat { .. } => {}
            Shape::Spatial { .. } => {
                return Err(Error::graph("dense layers need a flattened input"))
            }
        }
        if units == 0 {
            return Err(Error::invalid_shape("output size must be positive"));
        }
        self.push(name, LayerOp::Dense { units }, vec![input], Shape::Flat { features: units })
    }

    /// Consumes the builder, marking `output` as the graph output
    pub fn finish(self, output: NodeId) -> Result<LayerGraph> {
        if output >= self.nodes.len() {
            return Err(Error::graph(format!("unknown output node {}", output)));
        }
        Ok(LayerGraph {
            data_format: self.data_format,
            nodes: self.nodes,
            output,
        })
    }

    fn checked(&self, id: NodeId) -> Result<Shape> {
        self.nodes
            .get(id)
            .map(|node| node.shape)
            .ok_or_else(|| Error::graph(format!("unknown node {}", id)))
    }

    fn spatial(&self, id: NodeId, op: &str) -> Result<(usize, usize, usize)> {
        match self.checked(id)? {
            Shape::Spatial { channels, height, width } => Ok((channels, height, width)),
            Shape::Flat { .. } => Err(Error::graph(format!("{} needs a spatial input", op))),
        }
    }

    fn push(
        &mut self,
        name: impl Into<String>,
        op: LayerOp,
        inputs: Vec<NodeId>,
        shape: Shape,
    ) -> Result<NodeId> {
        let name = name.into();
        if !self.names.insert(name.clone()) {
            return Err(Error::graph(format!("duplicate layer name {}", name)));
        }
        self.nodes.push(Node { name, op, inputs, shape });
        Ok(self.nodes.len() - 1)
    }
}
