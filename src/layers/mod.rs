pub mod activation;
pub mod avg_pool;
pub mod batch_norm;
pub mod conv2d;
pub mod dropout;
pub mod feed_forward;
pub mod flatten;
pub mod max_pool;

use std::fmt::Debug;

use ndarray::{ArrayD, Zip};
use rand::rngs::StdRng;

use crate::error::Result;

/// Whether a pass is part of a training step. Training passes carry the
/// random generator used for stochastic layers.
pub enum Phase<'a> {
    Training(&'a mut StdRng),
    Inference,
}

impl Phase<'_> {
    pub fn is_training(&self) -> bool {
        matches!(self, Phase::Training(_))
    }
}

/// Trainable weights of a layer and their accumulated gradients
#[derive(Debug, Clone)]
pub struct LayerParams {
    pub weights: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub weight_grads: ArrayD<f32>,
    pub bias_grads: ArrayD<f32>,
}

impl LayerParams {
    pub fn new(weights: ArrayD<f32>, bias: ArrayD<f32>) -> Self {
        let weight_grads = ArrayD::zeros(weights.raw_dim());
        let bias_grads = ArrayD::zeros(bias.raw_dim());
        LayerParams {
            weights,
            bias,
            weight_grads,
            bias_grads,
        }
    }

    pub fn count(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    pub fn zero_grads(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    /// Adds `scale` times another layer's gradients to this layer's gradients
    pub fn accumulate_grads(&mut self, other: &LayerParams, scale: f32) {
        Zip::from(&mut self.weight_grads)
            .and(&other.weight_grads)
            .for_each(|g, &o| *g += scale * o);
        Zip::from(&mut self.bias_grads)
            .and(&other.bias_grads)
            .for_each(|g, &o| *g += scale * o);
    }

    /// Copies weights from another layer of the same shape
    pub fn copy_weights(&mut self, other: &LayerParams) {
        self.weights.assign(&other.weights);
        self.bias.assign(&other.bias);
    }
}

pub trait Layer: Debug + Send {
    fn forward(&mut self, input: &ArrayD<f32>, phase: &mut Phase<'_>) -> Result<ArrayD<f32>>;

    /// Propagates the output gradient of the latest forward pass back to the
    /// input, accumulating parameter gradients on the way.
    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>>;

    fn clone_box(&self) -> Box<dyn Layer>;

    fn params(&self) -> Option<&LayerParams> {
        None
    }

    fn params_mut(&mut self) -> Option<&mut LayerParams> {
        None
    }

    /// Non-trainable state updated by forward passes
    fn buffers(&self) -> Vec<&ArrayD<f32>> {
        Vec::new()
    }

    fn buffers_mut(&mut self) -> Vec<&mut ArrayD<f32>> {
        Vec::new()
    }
}

impl Clone for Box<dyn Layer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub use activation::ActivationLayer;
pub use avg_pool::AvgPoolLayer;
pub use batch_norm::BatchNormLayer;
pub use conv2d::Conv2DLayer;
pub use dropout::DropoutLayer;
pub use feed_forward::FeedForwardLayer;
pub use flatten::FlattenLayer;
pub use max_pool::MaxPoolLayer;

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ndarray::Dimension;

    /// Central-difference check of d(sum(output * probe))/d(input) against `backward`
    pub fn check_input_gradient(layer: &mut dyn Layer, input: &ArrayD<f32>, tolerance: f32) {
        let output = layer.forward(input, &mut Phase::Inference).unwrap();
        let probe = ArrayD::from_shape_fn(output.raw_dim(), |idx| {
            let flat: usize = idx.slice().iter().sum();
            0.5 + (flat % 3) as f32 * 0.25
        });
        let analytic = layer.backward(&probe).unwrap();

        let h = 1e-2;
        for (i, _) in input.iter().enumerate() {
            let mut plus = input.clone();
            let mut minus = input.clone();
            plus.as_slice_mut().unwrap()[i] += h;
            minus.as_slice_mut().unwrap()[i] -= h;
            let f_plus = (&layer.forward(&plus, &mut Phase::Inference).unwrap() * &probe).sum();
            let f_minus = (&layer.forward(&minus, &mut Phase::Inference).unwrap() * &probe).sum();
            let numeric = (f_plus - f_minus) / (2.0 * h);
            let got = analytic.as_slice().unwrap()[i];
            assert!(
                (numeric - got).abs() < tolerance,
                "gradient mismatch at {}: numeric {} analytic {}",
                i,
                numeric,
                got
            );
        }
    }
}
