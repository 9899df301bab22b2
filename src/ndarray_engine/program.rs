use ndarray::{Array2, ArrayD, ArrayView2, ArrayViewD, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Device;
use crate::error::{Error, Result};
use crate::graph::{LayerGraph, LayerOp};
use crate::hyperparameters::PoolingType;
use crate::layers::{
    ActivationLayer, AvgPoolLayer, BatchNormLayer, Conv2DLayer, DropoutLayer, FeedForwardLayer,
    FlattenLayer, Layer, LayerParams, MaxPoolLayer, Phase,
};
use crate::loss::Loss;

/// Executable layers for one copy of a graph, indexed by node id. Input and
/// add nodes carry no layer. Tensors are channels-first throughout.
#[derive(Debug, Clone)]
pub(crate) struct Program {
    layers: Vec<Option<Box<dyn Layer>>>,
    rng: StdRng,
    pub device: Device,
}

impl Program {
    pub fn instantiate(graph: &LayerGraph, device: Device, rng: &mut StdRng) -> Result<Self> {
        let mut layers: Vec<Option<Box<dyn Layer>>> = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let input_shape = node.inputs.first().map(|&input| graph.node(input).shape);
            let layer: Option<Box<dyn Layer>> = match node.op {
                LayerOp::Input | LayerOp::Add => None,
                LayerOp::Conv2D { filters, kernel_size } => {
                    let in_channels = input_shape.map(|shape| shape.channels()).unwrap_or(0);
                    Some(Box::new(Conv2DLayer::new(in_channels, filters, kernel_size, rng)?))
                }
                LayerOp::BatchNorm { epsilon, momentum } => {
                    Some(Box::new(BatchNormLayer::new(node.shape.channels(), epsilon, momentum)))
                }
                LayerOp::Activation(activation) => Some(Box::new(ActivationLayer::new(activation))),
                LayerOp::Pool2D { kind: PoolingType::Mean, size } => {
                    Some(Box::new(AvgPoolLayer::new((size, size), size)))
                }
                LayerOp::Pool2D { kind: PoolingType::Max, size } => {
                    Some(Box::new(MaxPoolLayer::new((size, size), size)))
                }
                LayerOp::Flatten => Some(Box::new(FlattenLayer::new(graph.data_format()))),
                LayerOp::Dropout { rate } => Some(Box::new(DropoutLayer::new(rate)?)),
                LayerOp::Dense { units } => {
                    let inputs = input_shape.map(|shape| shape.len()).unwrap_or(0);
                    Some(Box::new(FeedForwardLayer::new(inputs, units, rng)?))
                }
            };
            layers.push(layer);
        }

        Ok(Program {
            layers,
            rng: StdRng::seed_from_u64(rng.random()),
            device,
        })
    }

    /// Copy of this program on another device with its own dropout stream
    pub fn replica(&self, device: Device, rng: &mut StdRng) -> Self {
        Program {
            layers: self.layers.clone(),
            rng: StdRng::seed_from_u64(rng.random()),
            device,
        }
    }

    pub fn forward(
        &mut self,
        graph: &LayerGraph,
        input: &ArrayD<f32>,
        training: bool,
    ) -> Result<ArrayD<f32>> {
        let Program { layers, rng, .. } = self;
        let mut phase = if training { Phase::Training(rng) } else { Phase::Inference };
        let mut values: Vec<Option<ArrayD<f32>>> = vec![None; graph.len()];

        for (id, node) in graph.nodes().iter().enumerate() {
            let output = match node.op {
                LayerOp::Input => input.clone(),
                LayerOp::Add => {
                    let left = value(&values, node.inputs[0])?;
                    let right = value(&values, node.inputs[1])?;
                    left + right
                }
                _ => {
                    let layer = layers[id]
                        .as_mut()
                        .ok_or_else(|| Error::engine(format!("node {} has no layer", node.name)))?;
                    layer.forward(value(&values, node.inputs[0])?, &mut phase)?
                }
            };
            values[id] = Some(output);
        }

        values[graph.output()]
            .take()
            .ok_or_else(|| Error::engine("graph output was not computed"))
    }

    /// Back-propagates `grad` from the graph output, accumulating parameter
    /// gradients. Nodes feeding several consumers sum their incoming gradients.
    pub fn backward(&mut self, graph: &LayerGraph, grad: ArrayD<f32>) -> Result<()> {
        let mut grads: Vec<Option<ArrayD<f32>>> = vec![None; graph.len()];
        grads[graph.output()] = Some(grad);

        for (id, node) in graph.nodes().iter().enumerate().rev() {
            let Some(grad) = grads[id].take() else {
                continue;
            };
            match node.op {
                LayerOp::Input => {}
                LayerOp::Add => {
                    for &input in &node.inputs {
                        accumulate(&mut grads[input], grad.clone());
                    }
                }
                _ => {
                    let layer = self.layers[id]
                        .as_mut()
                        .ok_or_else(|| Error::engine(format!("node {} has no layer", node.name)))?;
                    let input_grad = layer.backward(&grad)?;
                    accumulate(&mut grads[node.inputs[0]], input_grad);
                }
            }
        }
        Ok(())
    }

    /// Forward and backward over one shard, returning its predictions
    pub fn train_shard(
        &mut self,
        graph: &LayerGraph,
        x: ArrayViewD<'_, f32>,
        y: ArrayView2<'_, f32>,
        loss: Loss,
    ) -> Result<Array2<f32>> {
        let predictions = self
            .forward(graph, &x.to_owned(), true)?
            .into_dimensionality::<Ix2>()?;
        let grad = loss.gradient(&predictions, &y.to_owned());
        self.backward(graph, grad.into_dyn())?;
        Ok(predictions)
    }

    pub fn zero_grads(&mut self) {
        for layer in self.layers.iter_mut().flatten() {
            if let Some(params) = layer.params_mut() {
                params.zero_grads();
            }
        }
    }

    /// Takes weights and buffers from `master`
    pub fn sync_from(&mut self, master: &Program) {
        for (mine, theirs) in self.layers.iter_mut().zip(&master.layers) {
            let (Some(mine), Some(theirs)) = (mine, theirs) else {
                continue;
            };
            if let (Some(params), Some(source)) = (mine.params_mut(), theirs.params()) {
                params.copy_weights(source);
            }
            for (buffer, source) in mine.buffers_mut().into_iter().zip(theirs.buffers()) {
                buffer.assign(source);
            }
        }
    }

    pub fn clear_buffers(&mut self) {
        for layer in self.layers.iter_mut().flatten() {
            for buffer in layer.buffers_mut() {
                buffer.fill(0.0);
            }
        }
    }

    /// Adds `weight` times a replica's gradients and buffers to this program
    pub fn accumulate_from(&mut self, replica: &Program, weight: f32) {
        for (mine, theirs) in self.layers.iter_mut().zip(&replica.layers) {
            let (Some(mine), Some(theirs)) = (mine, theirs) else {
                continue;
            };
            if let (Some(params), Some(source)) = (mine.params_mut(), theirs.params()) {
                params.accumulate_grads(source, weight);
            }
            for (buffer, source) in mine.buffers_mut().into_iter().zip(theirs.buffers()) {
                buffer.scaled_add(weight, source);
            }
        }
    }

    /// (value, gradient) pairs in a stable order for the optimizer
    pub fn slots(&mut self) -> Vec<(&mut ArrayD<f32>, &ArrayD<f32>)> {
        let mut slots = Vec::new();
        for layer in self.layers.iter_mut().flatten() {
            if let Some(params) = layer.params_mut() {
                let LayerParams {
                    weights,
                    bias,
                    weight_grads,
                    bias_grads,
                } = params;
                slots.push((weights, &*weight_grads));
                slots.push((bias, &*bias_grads));
            }
        }
        slots
    }

    pub fn layer(&self, id: usize) -> Option<&dyn Layer> {
        self.layers.get(id).and_then(|layer| layer.as_deref())
    }
}

fn value(values: &[Option<ArrayD<f32>>], id: usize) -> Result<&ArrayD<f32>> {
    values[id]
        .as_ref()
        .ok_or_else(|| Error::engine(format!("node {} used before it was computed", id)))
}

fn accumulate(slot: &mut Option<ArrayD<f32>>, grad: ArrayD<f32>) {
    match slot {
        Some(existing) => *existing += &grad,
        None => *slot = Some(grad),
    }
}
