use ndarray::ArrayD;
use rand::Rng;

use super::{Layer, Phase};
use crate::error::{Error, Result};

/// Inverted dropout: kept units are scaled by `1 / (1 - rate)` during
/// training so inference is the identity.
#[derive(Debug, Clone)]
pub struct DropoutLayer {
    dropout_rate: f32,
    scale: f32,
    mask: Option<ArrayD<f32>>,
}

impl DropoutLayer {
    pub fn new(dropout_rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&dropout_rate) {
            return Err(Error::invalid_hyperparameter(format!(
                "dropout rate must be in [0, 1), got {}",
                dropout_rate
            )));
        }
        Ok(DropoutLayer {
            dropout_rate,
            scale: 1.0 / (1.0 - dropout_rate),
            mask: None,
        })
    }

    pub fn rate(&self) -> f32 {
        self.dropout_rate
    }
}

impl Layer for DropoutLayer {
    fn forward(&mut self, input: &ArrayD<f32>, phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        match phase {
            Phase::Training(rng) => {
                let mask = ArrayD::from_shape_fn(input.raw_dim(), |_| {
                    if rng.random::<f32>() >= self.dropout_rate {
                        self.scale
                    } else {
                        0.0
                    }
                });
                let output = input * &mask;
                self.mask = Some(mask);
                Ok(output)
            }
            Phase::Inference => {
                self.mask = None;
                Ok(input.clone())
            }
        }
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        // Gradients flow through the same units the forward pass kept
        match &self.mask {
            Some(mask) => Ok(grad_output * mask),
            None => Ok(grad_output.clone()),
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
