use ndarray::{Array4, ArrayD, Ix4};

use super::{Layer, Phase};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MaxPoolLayer {
    pub pool_size: (usize, usize),
    pub stride: usize,
    input_shape: (usize, usize, usize, usize),
    max_indices: Option<Array4<(usize, usize)>>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize), stride: usize) -> Self {
        MaxPoolLayer {
            pool_size,
            stride,
            input_shape: (0, 0, 0, 0),
            max_indices: None,
        }
    }
}

impl Layer for MaxPoolLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let input_4d = input.view().into_dimensionality::<Ix4>()?;
        let (batch, channels, height, width) = input_4d.dim();
        if height < self.pool_size.0 || width < self.pool_size.1 {
            return Err(Error::invalid_shape("pooling window larger than the feature map"));
        }
        let output_height = ((height - self.pool_size.0) / self.stride) + 1;
        let output_width = ((width - self.pool_size.1) / self.stride) + 1;

        let mut output = Array4::<f32>::zeros((batch, channels, output_height, output_width));
        let mut max_indices = Array4::<(usize, usize)>::from_elem(
            (batch, channels, output_height, output_width),
            (0, 0),
        );

        for n in 0..batch {
            for c in 0..channels {
                for h in 0..output_height {
                    for w in 0..output_width {
                        let h_start = h * self.stride;
                        let w_start = w * self.stride;

                        let mut max_val = f32::NEG_INFINITY;
                        let mut max_h = 0;
                        let mut max_w = 0;

                        // Find maximum in pooling window
                        for ph in 0..self.pool_size.0 {
                            for pw in 0..self.pool_size.1 {
                                let val = input_4d[[n, c, h_start + ph, w_start + pw]];
                                if val > max_val {
                                    max_val = val;
                                    max_h = ph;
                                    max_w = pw;
                                }
                            }
                        }

                        output[[n, c, h, w]] = max_val;
                        max_indices[[n, c, h, w]] = (max_h, max_w);
                    }
                }
            }
        }

        self.input_shape = (batch, channels, height, width);
        self.max_indices = Some(max_indices);
        Ok(output.into_dyn())
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let max_indices = self
            .max_indices
            .as_ref()
            .ok_or_else(|| Error::engine("max pool backward called before forward"))?;
        let grad_output_4d = grad_output.view().into_dimensionality::<Ix4>()?;
        let (batch, channels, output_height, output_width) = grad_output_4d.dim();
        let mut input_gradient = Array4::<f32>::zeros(self.input_shape);

        // Route each gradient to the position that won the forward max
        for n in 0..batch {
            for c in 0..channels {
                for h in 0..output_height {
                    for w in 0..output_width {
                        let h_start = h * self.stride;
                        let w_start = w * self.stride;
                        let (max_h, max_w) = max_indices[[n, c, h, w]];

                        input_gradient[[n, c, h_start + max_h, w_start + max_w]] +=
                            grad_output_4d[[n, c, h, w]];
                    }
                }
            }
        }

        Ok(input_gradient.into_dyn())
    }

    fn clone_box(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
