use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix1, Ix2};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use super::{Layer, LayerParams, Phase};
use crate::error::{Error, Result};

/// Fully connected layer over (batch, inputs) matrices
#[derive(Debug, Clone)]
pub struct FeedForwardLayer {
    pub params: LayerParams,
    pub inputs: usize,
    pub units: usize,
    input_cache: Option<Array2<f32>>,
}

impl FeedForwardLayer {
    pub fn new(inputs: usize, units: usize, rng: &mut StdRng) -> Result<Self> {
        // Assume He normalization
        let std_dev = (2.0 / inputs.max(1) as f32).sqrt();
        let normal_dist = Normal::new(0.0, std_dev)
            .map_err(|e| Error::invalid_hyperparameter(e.to_string()))?;

        // Weights are (units × inputs)
        let weights = ArrayD::from_shape_fn(vec![units, inputs], |_| normal_dist.sample(rng));
        let bias = ArrayD::zeros(vec![units]);

        Ok(FeedForwardLayer {
            params: LayerParams::new(weights, bias),
            inputs,
            units,
            input_cache: None,
        })
    }

    fn weight_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        Ok(self.params.weights.view().into_dimensionality::<Ix2>()?)
    }
}

impl Layer for FeedForwardLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let input_2d = input.view().into_dimensionality::<Ix2>()?;
        if input_2d.ncols() != self.inputs {
            return Err(Error::invalid_shape(format!(
                "dense layer expects {} inputs, got {}",
                self.inputs,
                input_2d.ncols()
            )));
        }

        let bias = self.params.bias.view().into_dimensionality::<Ix1>()?;
        let output = input_2d.dot(&self.weight_matrix()?.t()) + &bias;
        self.input_cache = Some(input_2d.to_owned());
        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input = self
            .input_cache
            .as_ref()
            .ok_or_else(|| Error::engine("dense backward called before forward"))?;
        let grad = grad_output.view().into_dimensionality::<Ix2>()?;

        // grad is (batch × units), input is (batch × inputs)
        let weight_grads = grad.t().dot(input);
        let bias_grads = grad.sum_axis(Axis(0));
        self.params.weight_grads += &weight_grads.into_dyn();
        self.params.bias_grads += &bias_grads.into_dyn();

        Ok(grad.dot(&self.weight_matrix()?).into_dyn())
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::check_input_gradient;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, IxDyn};
    use rand::SeedableRng;

    #[test]
    fn test_forward_matches_manual() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut layer = FeedForwardLayer::new(3, 2, &mut rng).unwrap();
        layer.params.weights = array![[1.0f32, 0.0, -1.0], [0.5, 0.5, 0.5]].into_dyn();
        layer.params.bias = array![0.1f32, -0.1].into_dyn();

        let input = array![[1.0f32, 2.0, 3.0]].into_dyn();
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_abs_diff_eq!(output[[0, 0]], -1.9, epsilon = 1e-6);
        assert_abs_diff_eq!(output[[0, 1]], 2.9, epsilon = 1e-6);
    }

    #[test]
    fn test_gradients() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = FeedForwardLayer::new(4, 3, &mut rng).unwrap();
        let input =
            ArrayD::from_shape_fn(IxDyn(&[2, 4]), |idx| idx[1] as f32 * 0.3 - idx[0] as f32);
        check_input_gradient(&mut layer, &input, 1e-2);

        layer.params.zero_grads();
        layer.forward(&input, &mut Phase::Inference).unwrap();
        layer.backward(&ArrayD::ones(IxDyn(&[2, 3]))).unwrap();
        // db is the column sum of the output gradient
        assert!(layer.params.bias_grads.iter().all(|&g| (g - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = FeedForwardLayer::new(4, 3, &mut rng).unwrap();
        let input = ArrayD::zeros(IxDyn(&[2, 5]));
        assert!(layer.forward(&input, &mut Phase::Inference).is_err());
    }
}
