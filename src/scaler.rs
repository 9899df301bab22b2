use ndarray::{ArrayD, Axis, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hyperparameters::DataFormat;

/// Fitted bounds of one variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleParameters {
    pub min: f32,
    pub max: f32,
    pub range: f32,
}

/// Rescales each variable of a 4D array from its fitted `[min, max]` to
/// `[out_min, out_max]`. Variables sit on axis 1, or axis 3 for channels-last
/// data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler2D {
    out_min: f32,
    out_max: f32,
    data_format: DataFormat,
    scale_values: Option<Vec<ScaleParameters>>,
}

impl Default for MinMaxScaler2D {
    fn default() -> Self {
        MinMaxScaler2D::new(0.0, 1.0)
    }
}

impl MinMaxScaler2D {
    pub fn new(out_min: f32, out_max: f32) -> Self {
        MinMaxScaler2D {
            out_min,
            out_max,
            data_format: DataFormat::ChannelsFirst,
            scale_values: None,
        }
    }

    pub fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = data_format;
        self
    }

    /// Starts from previously fitted parameters
    pub fn with_scale_values(mut self, scale_values: Vec<ScaleParameters>) -> Self {
        self.scale_values = Some(scale_values);
        self
    }

    pub fn scale_values(&self) -> Option<&[ScaleParameters]> {
        self.scale_values.as_deref()
    }

    pub fn fit(&mut self, x: &ArrayD<f32>) -> Result<()> {
        let axis = self.variable_axis(x)?;
        if x.is_empty() {
            return Err(Error::invalid_shape(format!(
                "cannot fit on an empty array of shape {:?}",
                x.shape()
            )));
        }
        let scale_values = x
            .axis_iter(axis)
            .map(|variable| {
                let (min, max) = variable.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
                ScaleParameters {
                    min,
                    max,
                    range: max - min,
                }
            })
            .collect();
        self.scale_values = Some(scale_values);
        Ok(())
    }

    pub fn transform(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let out_range = self.out_max - self.out_min;
        self.map_variables(x, |value, params| {
            (value - params.min) / params.range * out_range + self.out_min
        })
    }

    pub fn fit_transform(&mut self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        self.fit(x)?;
        self.transform(x)
    }

    /// Maps scaled values back to the fitted range
    pub fn inverse_transform(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let out_range = self.out_max - self.out_min;
        self.map_variables(x, |value, params| {
            (value - self.out_min) / out_range * params.range + params.min
        })
    }

    fn map_variables(
        &self,
        x: &ArrayD<f32>,
        f: impl Fn(f32, &ScaleParameters) -> f32,
    ) -> Result<ArrayD<f32>> {
        let scale_values = self.scale_values.as_ref().ok_or(Error::NotFitted)?;
        let axis = self.variable_axis(x)?;
        if x.len_of(axis) != scale_values.len() {
            return Err(Error::VariableMismatch {
                expected: scale_values.len(),
                found: x.len_of(axis),
            });
        }
        if let Some(variable) = scale_values.iter().position(|params| params.range == 0.0) {
            return Err(Error::ZeroRange { variable });
        }

        let mut output = ArrayD::zeros(x.raw_dim());
        for ((out, input), params) in output
            .axis_iter_mut(axis)
            .zip(x.axis_iter(axis))
            .zip(scale_values)
        {
            Zip::from(out).and(input).for_each(|o, &v| *o = f(v, params));
        }
        Ok(output)
    }

    fn variable_axis(&self, x: &ArrayD<f32>) -> Result<Axis> {
        if x.ndim() != 4 {
            return Err(Error::invalid_shape(format!(
                "expected a 4D array, got shape {:?}",
                x.shape()
            )));
        }
        Ok(Axis(self.data_format.channel_axis()))
    }
}
