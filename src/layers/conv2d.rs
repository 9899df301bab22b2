use ndarray::{s, Array2, Array4, ArrayD, ArrayView3, Axis, Ix4};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use super::{Layer, LayerParams, Phase};
use crate::error::{Error, Result};

/// Stride-1 convolution with same padding, computed per example as a matrix
/// product over im2col columns.
#[derive(Debug, Clone)]
pub struct Conv2DLayer {
    pub params: LayerParams,
    pub in_channels: usize,
    pub filters: usize,
    pub kernel_size: usize,
    pub padding: usize,
    input_dims: (usize, usize, usize, usize),
    cached_cols: Vec<Array2<f32>>,
}

impl Conv2DLayer {
    pub fn new(
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if kernel_size % 2 == 0 {
            return Err(Error::engine(format!(
                "same padding needs an odd kernel, got {}",
                kernel_size
            )));
        }
        // He initialization
        let fan_in = in_channels * kernel_size * kernel_size;
        let std_dev = (2.0 / fan_in as f32).sqrt();
        let normal_dist = Normal::new(0.0, std_dev).map_err(|e| Error::engine(e.to_string()))?;

        let weights = Array4::from_shape_fn((filters, in_channels, kernel_size, kernel_size), |_| {
            normal_dist.sample(rng)
        })
        .into_dyn();
        let bias = ArrayD::zeros(vec![filters]);

        Ok(Conv2DLayer {
            params: LayerParams::new(weights, bias),
            in_channels,
            filters,
            kernel_size,
            padding: kernel_size / 2,
            input_dims: (0, 0, 0, 0),
            cached_cols: Vec::new(),
        })
    }

    fn kernel_matrix(&self) -> Result<Array2<f32>> {
        let rows = self.in_channels * self.kernel_size * self.kernel_size;
        Ok(self
            .params
            .weights
            .to_shape((self.filters, rows))?
            .into_owned())
    }

    fn im2col(&self, example: ArrayView3<f32>) -> Array2<f32> {
        let (channels, height, width) = example.dim();
        let k = self.kernel_size;
        let pad = self.padding as isize;
        let mut cols = Array2::zeros((channels * k * k, height * width));

        for c in 0..channels {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (c * k + ki) * k + kj;
                    for i in 0..height {
                        let y = i as isize + ki as isize - pad;
                        if y < 0 || y >= height as isize {
                            continue;
                        }
                        for j in 0..width {
                            let x = j as isize + kj as isize - pad;
                            if x < 0 || x >= width as isize {
                                continue;
                            }
                            cols[[row, i * width + j]] = example[[c, y as usize, x as usize]];
                        }
                    }
                }
            }
        }
        cols
    }

    fn col2im(&self, cols: &Array2<f32>, height: usize, width: usize) -> Array4<f32> {
        let k = self.kernel_size;
        let pad = self.padding as isize;
        let mut image = Array4::zeros((1, self.in_channels, height, width));

        for c in 0..self.in_channels {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (c * k + ki) * k + kj;
                    for i in 0..height {
                        let y = i as isize + ki as isize - pad;
                        if y < 0 || y >= height as isize {
                            continue;
                        }
                        for j in 0..width {
                            let x = j as isize + kj as isize - pad;
                            if x < 0 || x >= width as isize {
                                continue;
                            }
                            image[[0, c, y as usize, x as usize]] += cols[[row, i * width + j]];
                        }
                    }
                }
            }
        }
        image
    }
}

impl Layer for Conv2DLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let input = input.view().into_dimensionality::<Ix4>()?;
        let (batch, channels, height, width) = input.dim();
        if channels != self.in_channels {
            return Err(Error::invalid_shape(format!(
                "convolution expects {} channels, got {}",
                self.in_channels, channels
            )));
        }

        let kernel = self.kernel_matrix()?;
        let mut output = Array4::zeros((batch, self.filters, height, width));
        self.cached_cols.clear();

        for n in 0..batch {
            let cols = self.im2col(input.index_axis(Axis(0), n));
            let mut out = kernel.dot(&cols);
            for (f, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
                let b = self.params.bias[[f]];
                row.mapv_inplace(|x| x + b);
            }
            output
                .slice_mut(s![n, .., .., ..])
                .assign(&out.to_shape((self.filters, height, width))?);
            self.cached_cols.push(cols);
        }

        self.input_dims = (batch, channels, height, width);
        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let grad_output = grad_output.view().into_dimensionality::<Ix4>()?;
        let (batch, channels, height, width) = self.input_dims;
        if self.cached_cols.len() != batch {
            return Err(Error::engine("convolution backward called before forward"));
        }

        let kernel = self.kernel_matrix()?;
        let rows = kernel.ncols();
        let mut weight_grads = Array2::<f32>::zeros((self.filters, rows));
        let mut input_gradient = Array4::zeros((batch, channels, height, width));

        for n in 0..batch {
            let grad = grad_output
                .index_axis(Axis(0), n)
                .to_shape((self.filters, height * width))?
                .into_owned();
            weight_grads += &grad.dot(&self.cached_cols[n].t());
            let bias_step = grad.sum_axis(Axis(1));
            for f in 0..self.filters {
                self.params.bias_grads[[f]] += bias_step[f];
            }
            let cols_grad = kernel.t().dot(&grad);
            let image = self.col2im(&cols_grad, height, width);
            input_gradient
                .slice_mut(s![n..n + 1, .., .., ..])
                .assign(&image);
        }

        let weight_grads = weight_grads.into_shape_with_order(self.params.weights.raw_dim())?;
        self.params.weight_grads += &weight_grads;
        Ok(input_gradient.into_dyn())
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
    use ndarray::IxDyn;
    use rand::SeedableRng;

    #[test]
    fn test_same_padding_preserves_spatial_dims() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Conv2DLayer::new(2, 4, 3, &mut rng).unwrap();
        let input = ArrayD::ones(IxDyn(&[3, 2, 5, 6]));
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output.shape(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_identity_kernel() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Conv2DLayer::new(1, 1, 3, &mut rng).unwrap();
        layer.params.weights.fill(0.0);
        layer.params.weights[[0, 0, 1, 1]] = 1.0;
        layer.params.bias[[0]] = 0.5;

        let input = ArrayD::from_shape_fn(IxDyn(&[1, 1, 3, 3]), |idx| (idx[2] * 3 + idx[3]) as f32);
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output, &input + 0.5);
    }

    #[test]
    fn test_border_sum_uses_zero_padding() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Conv2DLayer::new(1, 1, 3, &mut rng).unwrap();
        layer.params.weights.fill(1.0);

        let input = ArrayD::ones(IxDyn(&[1, 1, 3, 3]));
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output[[0, 0, 0, 0]], 4.0);
        assert_eq!(output[[0, 0, 0, 1]], 6.0);
        assert_eq!(output[[0, 0, 1, 1]], 9.0);
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut layer = Conv2DLayer::new(2, 3, 3, &mut rng).unwrap();
        let input = ArrayD::from_shape_fn(IxDyn(&[2, 2, 4, 4]), |idx| {
            ((idx[0] * 7 + idx[1] * 5 + idx[2] * 3 + idx[3]) % 11) as f32 / 11.0 - 0.5
        });
        check_input_gradient(&mut layer, &input, 2e-2);
    }

    #[test]
    fn test_weight_gradient_accumulates() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Conv2DLayer::new(1, 1, 1, &mut rng).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[1, 1, 2, 2]), 2.0);
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        layer.backward(&ArrayD::ones(output.raw_dim())).unwrap();

        // 1x1 kernel: dW = sum(input), db = number of output positions
        assert_eq!(layer.params.weight_grads[[0, 0, 0, 0]], 8.0);
        assert_eq!(layer.params.bias_grads[[0]], 4.0);
    }
}
