use ndarray::{Array4, ArrayD, Ix4};

use super::{Layer, Phase};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct AvgPoolLayer {
    pub pool_size: (usize, usize),
    pub stride: usize,
    input_shape: Option<(usize, usize, usize, usize)>,
}

impl AvgPoolLayer {
    pub fn new(pool_size: (usize, usize), stride: usize) -> Self {
        AvgPoolLayer {
            pool_size,
            stride,
            input_shape: None,
        }
    }
}

impl Layer for AvgPoolLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let input_4d = input.view().into_dimensionality::<Ix4>()?;
        let (batch, channels, height, width) = input_4d.dim();
        if height < self.pool_size.0 || width < self.pool_size.1 {
            return Err(Error::invalid_shape("pooling window larger than the feature map"));
        }
        let output_height = ((height - self.pool_size.0) / self.stride) + 1;
        let output_width = ((width - self.pool_size.1) / self.stride) + 1;
        let window = (self.pool_size.0 * self.pool_size.1) as f32;

        let mut output = Array4::<f32>::zeros((batch, channels, output_height, output_width));
        for ((n, c, h, w), value) in output.indexed_iter_mut() {
            let h_start = h * self.stride;
            let w_start = w * self.stride;
            let mut sum = 0.0;
            for ph in 0..self.pool_size.0 {
                for pw in 0..self.pool_size.1 {
                    sum += input_4d[[n, c, h_start + ph, w_start + pw]];
                }
            }
            *value = sum / window;
        }

        self.input_shape = Some((batch, channels, height, width));
        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let input_shape = self
            .input_shape
            .ok_or_else(|| Error::engine("average pool backward called before forward"))?;
        let grad_output_4d = grad_output.view().into_dimensionality::<Ix4>()?;
        let window = (self.pool_size.0 * self.pool_size.1) as f32;
        let mut input_gradient = Array4::<f32>::zeros(input_shape);

        // Every position in a window receives an equal share
        for ((n, c, h, w), &grad) in grad_output_4d.indexed_iter() {
            let h_start = h * self.stride;
            let w_start = w * self.stride;
            for ph in 0..self.pool_size.0 {
                for pw in 0..self.pool_size.1 {
                    input_gradient[[n, c, h_start + ph, w_start + pw]] += grad / window;
                }
            }
        }

        Ok(input_gradient.into_dyn())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::testing::check_input_gradient;
    use ndarray::IxDyn;

    #[test]
    fn test_avg_pool_forward() {
        let mut layer = AvgPoolLayer::new((2, 2), 2);
        let input = ArrayD::from_shape_vec(
            IxDyn(&[1, 1, 2, 4]),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        )
        .unwrap();

        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output.shape(), &[1, 1, 1, 2]);
        assert_eq!(output.iter().copied().collect::<Vec<_>>(), vec![3.5, 5.5]);
    }

    #[test]
    fn test_avg_pool_gradient() {
        let mut layer = AvgPoolLayer::new((2, 2), 2);
        let input =
            ArrayD::from_shape_fn(IxDyn(&[2, 2, 4, 4]), |idx| (idx[2] * 4 + idx[3]) as f32 * 0.1);
        check_input_gradient(&mut layer, &input, 1e-2);
    }
}
