use ndarray::{Array1, Array3, ArrayD, Axis, Zip};

use super::{Layer, LayerParams, Phase};
use crate::error::{Error, Result};

/// Per-channel normalization over the batch and spatial axes. Channels sit on
/// axis 1. Training passes use batch statistics and update the moving averages
/// used for inference.
#[derive(Debug, Clone)]
pub struct BatchNormLayer {
    /// gamma in `weights`, beta in `bias`
    pub params: LayerParams,
    pub channels: usize,
    pub epsilon: f32,
    pub momentum: f32,
    moving_mean: ArrayD<f32>,
    moving_variance: ArrayD<f32>,
    cached_normalized: Option<Array3<f32>>,
    cached_inv_std: Array1<f32>,
}

impl BatchNormLayer {
    pub fn new(channels: usize, epsilon: f32, momentum: f32) -> Self {
        let params = LayerParams::new(ArrayD::ones(vec![channels]), ArrayD::zeros(vec![channels]));
        BatchNormLayer {
            params,
            channels,
            epsilon,
            momentum,
            moving_mean: ArrayD::zeros(vec![channels]),
            moving_variance: ArrayD::ones(vec![channels]),
            cached_normalized: None,
            cached_inv_std: Array1::zeros(channels),
        }
    }

    pub fn moving_mean(&self) -> &ArrayD<f32> {
        &self.moving_mean
    }

    pub fn moving_variance(&self) -> &ArrayD<f32> {
        &self.moving_variance
    }

    /// Views an (N, C, ...) tensor as (N, C, positions)
    fn grouped(&self, input: &ArrayD<f32>) -> Result<Array3<f32>> {
        let shape = input.shape();
        if shape.len() < 2 || shape[1] != self.channels {
            return Err(Error::invalid_shape(format!(
                "batch norm expects {} channels on axis 1, got shape {:?}",
                self.channels, shape
            )));
        }
        let positions = shape[2..].iter().product::<usize>();
        Ok(input
            .to_shape((shape[0], self.channels, positions))?
            .into_owned())
    }
}

impl Layer for BatchNormLayer {
    fn forward(&mut self, input: &ArrayD<f32>, phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let x = self.grouped(input)?;
        let (batch, channels, positions) = x.dim();
        let count = (batch * positions).max(1) as f32;
        let mut output = Array3::zeros(x.raw_dim());
        let mut normalized = Array3::zeros(x.raw_dim());

        for c in 0..channels {
            let slice = x.index_axis(Axis(1), c);
            let (mean, variance) = if phase.is_training() {
                let mean = slice.sum() / count;
                let variance = slice.fold(0.0, |acc, &v| acc + (v - mean).powi(2)) / count;
                self.moving_mean[[c]] =
                    self.momentum * self.moving_mean[[c]] + (1.0 - self.momentum) * mean;
                self.moving_variance[[c]] =
                    self.momentum * self.moving_variance[[c]] + (1.0 - self.momentum) * variance;
                (mean, variance)
            } else {
                (self.moving_mean[[c]], self.moving_variance[[c]])
            };
            let inv_std = 1.0 / (variance + self.epsilon).sqrt();
            self.cached_inv_std[c] = inv_std;

            let gamma = self.params.weights[[c]];
            let beta = self.params.bias[[c]];
            let x_hat = slice.mapv(|v| (v - mean) * inv_std);
            output.index_axis_mut(Axis(1), c).assign(&x_hat.mapv(|v| gamma * v + beta));
            normalized.index_axis_mut(Axis(1), c).assign(&x_hat);
        }

        self.cached_normalized = Some(normalized);
        Ok(output.into_shape_with_order(input.raw_dim())?)
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let normalized = self
            .cached_normalized
            .as_ref()
            .ok_or_else(|| Error::engine("batch norm backward called before forward"))?;
        let grad = grad_output
            .view()
            .into_shape_with_order(normalized.raw_dim())?;
        let (batch, channels, positions) = normalized.dim();
        let count = (batch * positions).max(1) as f32;
        let mut input_gradient = Array3::zeros(normalized.raw_dim());

        for c in 0..channels {
            let g = grad.index_axis(Axis(1), c);
            let x_hat = normalized.index_axis(Axis(1), c);
            let sum_g = g.sum();
            let sum_g_xhat = (&g * &x_hat).sum();
            self.params.weight_grads[[c]] += sum_g_xhat;
            self.params.bias_grads[[c]] += sum_g;

            let gamma = self.params.weights[[c]];
            let inv_std = self.cached_inv_std[c];
            let dx = Zip::from(&g).and(&x_hat).map_collect(|&gv, &xh| {
                gamma * inv_std / count * (count * gv - sum_g - xh * sum_g_xhat)
            });
            input_gradient.index_axis_mut(Axis(1), c).assign(&dx);
        }

        Ok(input_gradient.into_shape_with_order(grad_output.raw_dim())?)
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn params(&self) -> Option<&LayerParams> {
        Some(&self.params)
    }

    fn params_mut(&mut self) -> Option<&mut LayerParams> {
        Some(&mut self.params)
    }

    fn buffers(&self) -> Vec<&ArrayD<f32>> {
        vec![&self.moving_mean, &self.moving_variance]
    }

    fn buffers_mut(&mut self) -> Vec<&mut ArrayD<f32>> {
        vec![&mut self.moving_mean, &mut self.moving_variance]
    }
}
