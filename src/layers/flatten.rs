use ndarray::ArrayD;

use super::{Layer, Phase};
use crate::error::{Error, Result};
use crate::hyperparameters::DataFormat;

/// Collapses (N, C, H, W) feature maps into (N, features). Features are
/// ordered as the configured data format lays them out.
#[derive(Debug, Clone)]
pub struct FlattenLayer {
    data_format: DataFormat,
    input_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new(data_format: DataFormat) -> Self {
        FlattenLayer {
            data_format,
            input_shape: None,
        }
    }
}

impl Layer for FlattenLayer {
    fn forward(&mut self, input: &ArrayD<f32>, _phase: &mut Phase<'_>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        if shape.len() != 4 {
            return Err(Error::invalid_shape(format!(
                "flatten expects a rank 4 input, got {:?}",
                shape
            )));
        }
        let features = shape[1..].iter().product::<usize>();
        let ordered = match self.data_format {
            DataFormat::ChannelsFirst => input.view(),
            DataFormat::ChannelsLast => input.view().permuted_axes(vec![0, 2, 3, 1]),
        };
        let output = ordered
            .to_shape(vec![shape[0], features])?
            .into_owned();
        self.input_shape = Some(shape);
        Ok(output)
    }

    fn backward(&mut self, grad_output: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let shape = self
            .input_shape
            .as_ref()
            .ok_or_else(|| Error::engine("flatten backward called before forward"))?;
        let (n, c, h, w) = (shape[0], shape[1], shape[2], shape[3]);
        let grad = match self.data_format {
            DataFormat::ChannelsFirst => grad_output.to_shape(vec![n, c, h, w])?.into_owned(),
            DataFormat::ChannelsLast => grad_output
                .to_shape(vec![n, h, w, c])?
                .permuted_axes(vec![0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        };
        Ok(grad)
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
    fn test_channels_first_order() {
        let mut layer = FlattenLayer::new(DataFormat::ChannelsFirst);
        let input =
            ArrayD::from_shape_fn(IxDyn(&[1, 2, 1, 2]), |idx| (idx[1] * 10 + idx[3]) as f32);
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 10.0, 11.0]);
    }

    #[test]
    fn test_channels_last_order() {
        let mut layer = FlattenLayer::new(DataFormat::ChannelsLast);
        let input =
            ArrayD::from_shape_fn(IxDyn(&[1, 2, 1, 2]), |idx| (idx[1] * 10 + idx[3]) as f32);
        let output = layer.forward(&input, &mut Phase::Inference).unwrap();
        assert_eq!(output.shape(), &[1, 4]);
        assert_eq!(output.iter().copied().collect::<Vec<_>>(), vec![0.0, 10.0, 1.0, 11.0]);
    }

    #[test]
    fn test_backward_restores_layout() {
        let mut layer = FlattenLayer::new(DataFormat::ChannelsLast);
        let input =
            ArrayD::from_shape_fn(IxDyn(&[2, 3, 2, 2]), |idx| idx[1] as f32 - idx[2] as f32);
        check_input_gradient(&mut layer, &input, 1e-2);
    }
}
