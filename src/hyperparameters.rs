use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::activation::ActivationType;
use crate::error::{Error, Result};
use crate::loss::Loss;
use crate::optimizer::{OptimizerSpec, OptimizerType};

/// Pooling applied after every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingType {
    Mean,
    Max,
}

/// Position of the channel axis in a single example
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// (channels, height, width)
    ChannelsFirst,
    /// (height, width, channels)
    ChannelsLast,
}

impl DataFormat {
    /// Splits a per-example shape into (channels, height, width)
    pub fn split(self, shape: [usize; 3]) -> (usize, usize, usize) {
        match self {
            DataFormat::ChannelsFirst => (shape[0], shape[1], shape[2]),
            DataFormat::ChannelsLast => (shape[2], shape[0], shape[1]),
        }
    }

    /// Inverse of `split`
    pub fn join(self, channels: usize, height: usize, width: usize) -> [usize; 3] {
        match self {
            DataFormat::ChannelsFirst => [channels, height, width],
            DataFormat::ChannelsLast => [height, width, channels],
        }
    }

    /// Channel axis of a batched 4D array
    pub fn channel_axis(self) -> usize {
        match self {
            DataFormat::ChannelsFirst => 1,
            DataFormat::ChannelsLast => 3,
        }
    }
}

/// Hyperparameters for the convolutional network builders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvNetHyperparameters {
    /// Number of convolution filters in the first stage
    pub min_filters: usize,

    /// Multiplier on the filter count between stages
    pub filter_growth_rate: f64,

    /// Spatial width of every convolution kernel
    pub filter_width: usize,

    /// Width of the data after the final pooling layer; constrains the stage count
    pub min_data_width: usize,

    pub hidden_activation: ActivationType,
    pub output_activation: ActivationType,
    pub pooling: PoolingType,

    /// Inserts a dropout layer between the final stage and the output layer
    pub use_dropout: bool,
    pub dropout_alpha: f32,

    pub data_format: DataFormat,
    pub optimizer: OptimizerType,
    pub loss: Loss,
    pub learning_rate: f32,

    /// Negative slope when `hidden_activation` is leaky
    pub leaky_alpha: f32,

    pub metrics: Vec<Loss>,
    pub batch_size: usize,
    pub epochs: usize,
    pub verbose: u8,
}

impl Default for ConvNetHyperparameters {
    fn default() -> Self {
        ConvNetHyperparameters {
            min_filters: 16,
            filter_growth_rate: 2.0,
            filter_width: 5,
            min_data_width: 4,
            hidden_activation: ActivationType::ReLU,
            output_activation: ActivationType::Sigmoid,
            pooling: PoolingType::Mean,
            use_dropout: false,
            dropout_alpha: 0.0,
            data_format: DataFormat::ChannelsFirst,
            optimizer: OptimizerType::Adam,
            loss: Loss::MeanSquaredError,
            learning_rate: 0.00001,
            leaky_alpha: 0.1,
            metrics: Vec::new(),
            batch_size: 256,
            epochs: 10,
            verbose: 0,
        }
    }
}

impl ConvNetHyperparameters {
    /// Reads hyperparameters from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let hyperparameters: ConvNetHyperparameters = serde_json::from_str(&contents)?;
        hyperparameters.validate()?;
        Ok(hyperparameters)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_filters == 0 {
            return Err(Error::invalid_hyperparameter("min_filters must be positive"));
        }
        if self.filter_growth_rate <= 0.0 || !self.filter_growth_rate.is_finite() {
            return Err(Error::invalid_hyperparameter("filter_growth_rate must be positive"));
        }
        if self.filter_width == 0 || self.filter_width % 2 == 0 {
            return Err(Error::invalid_hyperparameter(format!(
                "filter_width must be a positive odd number, got {}",
                self.filter_width
            )));
        }
        if self.min_data_width == 0 {
            return Err(Error::invalid_hyperparameter("min_data_width must be positive"));
        }
        if !self.hidden_activation.is_elementwise() {
            return Err(Error::invalid_hyperparameter(
                "hidden_activation must be an element-wise function",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_alpha) {
            return Err(Error::invalid_hyperparameter(format!(
                "dropout_alpha must lie in [0, 1), got {}",
                self.dropout_alpha
            )));
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(Error::invalid_hyperparameter("learning_rate must be positive"));
        }
        if self.batch_size == 0 || self.epochs == 0 {
            return Err(Error::invalid_hyperparameter("batch_size and epochs must be positive"));
        }
        Ok(())
    }

    pub fn optimizer_spec(&self) -> OptimizerSpec {
        OptimizerSpec::new(self.optimizer, self.learning_rate)
    }

    /// Filter count of each of `stages` stages. Growth is applied iteratively with
    /// truncation at every step, so rounding error compounds.
    pub fn filter_schedule(&self, stages: usize) -> Vec<usize> {
        let mut schedule = Vec::with_capacity(stages);
        let mut filters = self.min_filters;
        for _ in 0..stages {
            schedule.push(filters);
            filters = (filters as f64 * self.filter_growth_rate) as usize;
        }
        schedule
    }
}
