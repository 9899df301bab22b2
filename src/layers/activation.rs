use ndarray::{ArrayD, Axis, Ix2, Zip};

use super::{Layer, Phase};
use crate::activation::Activation;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ActivationLayer {
    pub activation: Activation,
    preactivation_cache: Option<ArrayD<f32>>,
    activation_cache: Option<ArrayD<f32>>,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        ActivationLayer {
            activation,
            preactivation_cache: None,
            activation_cache: None,
        }
    }

    fn softmax(input: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut output = input.view().into_dimensionality::<Ix2>()?.to_owned();
        for mut row in output.axis_iter_mut(Axis(0)) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }
        Ok(output.into_dyn())
    }
}

impl Layer for ActivationLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let output = match self.activation {
            Activation::Softmax => Self::softmax(input)?,
            activation => input.mapv(|x| activation.apply(x)),
        };
        self.preactivation_cache = Some(input.clone());
        self.activation_cache = Some(output.clone());
        Ok(output)
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let missing = || Error::engine("activation backward called before forward");
        match self.activation {
            Activation::Softmax => {
                // dx = s * (g - sum(g * s)) per example
                let output = self.activation_cache.as_ref().ok_or_else(missing)?;
                let s = output.view().into_dimensionality::<Ix2>()?;
                let g = grad_output.view().into_dimensionality::<Ix2>()?;
                let dot = (&g * &s).sum_axis(Axis(1)).insert_axis(Axis(1));
                Ok((&s * &(&g - &dot)).into_dyn())
            }
            activation => {
                let preactivation = self.preactivation_cache.as_ref().ok_or_else(missing)?;
                Ok(Zip::from(grad_output)
                    .and(preactivation)
                    .map_collect(|&g, &x| g * activation.derivative(x)))
            }
        }
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::check_input_gradient;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_sigmoid_output_is_bounded() {
        let mut layer = ActivationLayer::new(Activation::Sigmoid);
        let input = array![[-1000.0f32, -3.0, 0.0, 3.0, 1000.0]].into_dyn();
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert!(output.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut layer = ActivationLayer::new(Activation::Softmax);
        let input = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]].into_dyn();
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        for row in output.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_leaky_gradient() {
        let mut layer = ActivationLayer::new(Activation::LeakyReLU(0.2));
        let input =
            ArrayD::from_shape_fn(IxDyn(&[2, 3]), |idx| idx[1] as f32 - 1.3 + idx[0] as f32);
        check_input_gradient(&mut layer, &input, 1e-2);
    }

    #[test]
    fn test_softmax_gradient() {
        let mut layer = ActivationLayer::new(Activation::Softmax);
        let input = array![[0.1f32, -0.4, 0.8], [1.0, 0.5, -1.0]].into_dyn();
        check_input_gradient(&mut layer, &input, 1e-2);
    }
}
