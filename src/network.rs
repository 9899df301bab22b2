//! Convolutional network builders.
//!
//! [`ConvNet`] turns a [`ConvNetHyperparameters`] set into a [`LayerGraph`]:
//! a stack of stages, each halving the spatial size with 2x2 pooling until the
//! data is `min_data_width` wide, followed by flatten, optional dropout, a dense
//! layer and the output activation. What a stage contains before its pooling
//! layer is decided by a [`StageBuilder`]: [`PlainStage`] applies a single
//! convolution and activation, [`ResidualStage`] a two-convolution residual
//! block.

use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::engine::{Device, FitOptions, History, Session};
use crate::error::{Error, Result};
use crate::graph::{GraphBuilder, LayerGraph, NodeId};
use crate::hyperparameters::ConvNetHyperparameters;

/// Stage body used between the input and the dense tail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[default]
    Standard,
    Residual,
}

/// Appends the body of one stage, excluding its pooling layer
pub trait StageBuilder {
    /// Returns the node whose output has `filters` channels and the spatial
    /// size of `input`.
    fn build_stage(
        &self,
        graph: &mut GraphBuilder,
        filters: usize,
        input: NodeId,
        stage: usize,
    ) -> Result<NodeId>;
}

/// Convolution followed by the hidden activation
#[derive(Debug, Clone)]
pub struct PlainStage {
    filter_width: usize,
    activation: Activation,
}

impl PlainStage {
    pub fn new(hyperparameters: &ConvNetHyperparameters) -> Self {
        PlainStage {
            filter_width: hyperparameters.filter_width,
            activation: hyperparameters.hidden_activation.resolve(hyperparameters.leaky_alpha),
        }
    }
}

impl StageBuilder for PlainStage {
    fn build_stage(
        &self,
        graph: &mut GraphBuilder,
        filters: usize,
        input: NodeId,
        stage: usize,
    ) -> Result<NodeId> {
        let conv = graph.conv2d(format!("conv_{:02}", stage), input, filters, self.filter_width)?;
        graph.activation(format!("hidden_activation_{:02}", stage), conv, self.activation)
    }
}

/// Pre-activation residual block:
/// `shortcut -> bn -> act -> conv -> bn -> act -> conv -> + shortcut`.
/// The shortcut is the input itself when it already has `filters` channels,
/// otherwise a convolution projecting it to `filters` channels.
#[derive(Debug, Clone)]
pub struct ResidualStage {
    filter_width: usize,
    activation: Activation,
}

impl ResidualStage {
    pub fn new(hyperparameters: &ConvNetHyperparameters) -> Self {
        ResidualStage {
            filter_width: hyperparameters.filter_width,
            activation: hyperparameters.hidden_activation.resolve(hyperparameters.leaky_alpha),
        }
    }
}

impl StageBuilder for ResidualStage {
    fn build_stage(
        &self,
        graph: &mut GraphBuilder,
        filters: usize,
        input: NodeId,
        stage: usize,
    ) -> Result<NodeId> {
        let shortcut = if graph.shape(input).channels() != filters {
            graph.conv2d(format!("res_shortcut_{:02}", stage), input, filters, self.filter_width)?
        } else {
            input
        };

        let mut main = shortcut;
        for branch in ["a", "b"] {
            main = graph.batch_norm(format!("bn_res_{:02}_{}", stage, branch), main)?;
            main = graph.activation(
                format!("res_activation_{:02}_{}", stage, branch),
                main,
                self.activation,
            )?;
            main = graph.conv2d(
                format!("res_conv_{:02}_{}", stage, branch),
                main,
                filters,
                self.filter_width,
            )?;
        }

        graph.add(format!("res_add_{:02}", stage), main, shortcut)
    }
}

/// Number of halvings that take `width` down to `min_data_width`. The ratio
/// must be an exact power of two.
pub fn num_stages(width: usize, min_data_width: usize) -> Result<usize> {
    if min_data_width == 0 {
        return Err(Error::invalid_hyperparameter("min_data_width must be positive"));
    }
    if width < min_data_width
        || width % min_data_width != 0
        || !(width / min_data_width).is_power_of_two()
    {
        return Err(Error::DepthRatio { width, min_data_width });
    }
    Ok((width / min_data_width).trailing_zeros() as usize)
}

#[derive(Debug, Clone)]
pub struct ConvNet {
    hyperparameters: ConvNetHyperparameters,
    architecture: Architecture,
}

impl ConvNet {
    pub fn new(
        hyperparameters: ConvNetHyperparameters,
        architecture: Architecture,
    ) -> Result<Self> {
        hyperparameters.validate()?;
        Ok(ConvNet {
            hyperparameters,
            architecture,
        })
    }

    pub fn standard(hyperparameters: ConvNetHyperparameters) -> Result<Self> {
        Self::new(hyperparameters, Architecture::Standard)
    }

    pub fn residual(hyperparameters: ConvNetHyperparameters) -> Result<Self> {
        Self::new(hyperparameters, Architecture::Residual)
    }

    pub fn hyperparameters(&self) -> &ConvNetHyperparameters {
        &self.hyperparameters
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Per-example input shape and output width of a dataset. `x` must be
    /// rank 4; `y` is either one target per example or rank 2.
    pub fn get_data_shapes(x: &ArrayD<f32>, y: &ArrayD<f32>) -> Result<([usize; 3], usize)> {
        let &[examples, a, b, c] = x.shape() else {
            return Err(Error::invalid_shape(format!(
                "input data must have dimensions (examples, y, x, predictor), got {:?}",
                x.shape()
            )));
        };
        let output_size = match y.shape() {
            &[_] => 1,
            &[_, outputs] => outputs,
            shape => {
                return Err(Error::invalid_shape(format!(
                    "targets must have rank 1 or 2, got {:?}",
                    shape
                )))
            }
        };
        if y.shape()[0] != examples {
            return Err(Error::invalid_shape(format!(
                "{} input examples but {} targets",
                examples,
                y.shape()[0]
            )));
        }
        Ok(([a, b, c], output_size))
    }

    /// Builds the graph for the configured architecture. `input_shape` is read
    /// in the configured data format.
    pub fn build_network(&self, input_shape: [usize; 3], output_size: usize) -> Result<LayerGraph> {
        match self.architecture {
            Architecture::Standard => {
                let stage = PlainStage::new(&self.hyperparameters);
                self.build_network_with(&stage, input_shape, output_size)
            }
            Architecture::Residual => {
                let stage = ResidualStage::new(&self.hyperparameters);
                self.build_network_with(&stage, input_shape, output_size)
            }
        }
    }

    pub fn build_network_with(
        &self,
        stage_builder: &dyn StageBuilder,
        input_shape: [usize; 3],
        output_size: usize,
    ) -> Result<LayerGraph> {
        let hp = &self.hyperparameters;
        if output_size == 0 {
            return Err(Error::invalid_shape("output size must be positive"));
        }
        let (channels, height, width) = hp.data_format.split(input_shape);
        if channels == 0 || height == 0 || width == 0 {
            return Err(Error::invalid_shape(format!(
                "input dimensions must be positive, got {:?}",
                input_shape
            )));
        }
        let stages = num_stages(width, hp.min_data_width)?;
        if height >> stages == 0 {
            return Err(Error::invalid_shape(format!(
                "height {} cannot be halved {} times",
                height, stages
            )));
        }

        let mut graph = GraphBuilder::new(hp.data_format);
        let mut node = graph.input("scn_input", input_shape)?;
        for (stage, filters) in hp.filter_schedule(stages).into_iter().enumerate() {
            node = stage_builder.build_stage(&mut graph, filters, node, stage)?;
            node = graph.pool2d(format!("pooling_{:02}", stage), node, hp.pooling)?;
        }

        node = graph.flatten("flatten", node)?;
        if hp.use_dropout {
            node = graph.dropout("dense_dropout", node, hp.dropout_alpha)?;
        }
        node = graph.dense("dense_output", node, output_size)?;
        node = graph.activation(
            "activation_output",
            node,
            hp.output_activation.resolve(hp.leaky_alpha),
        )?;
        graph.finish(node)
    }

    /// Options for a fit call with the configured batch size, epochs and verbosity
    pub fn fit_options(&self, seed: u64) -> FitOptions {
        FitOptions {
            batch_size: self.hyperparameters.batch_size,
            epochs: self.hyperparameters.epochs,
            verbose: self.hyperparameters.verbose,
            shuffle: true,
            seed,
        }
    }

    /// Builds a graph sized for `x` and `y` and places it on `device`
    pub fn build_model<S: Session>(
        &self,
        session: &mut S,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        device: Device,
    ) -> Result<S::Model> {
        let (input_shape, output_size) = Self::get_data_shapes(x, y)?;
        let graph = self.build_network(input_shape, output_size)?;
        session.build(graph, device)
    }

    pub fn compile_model<S: Session>(&self, session: &mut S, model: &mut S::Model) -> Result<()> {
        let hp = &self.hyperparameters;
        session.compile(model, &hp.optimizer_spec(), hp.loss, &hp.metrics)
    }

    /// Builds, compiles and trains a new model
    pub fn fit<S: Session>(
        &self,
        session: &mut S,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        device: Device,
        seed: u64,
        validation: Option<(&ArrayD<f32>, &ArrayD<f32>)>,
    ) -> Result<(S::Model, History)> {
        let mut model = self.build_model(session, x, y, device)?;
        self.compile_model(session, &mut model)?;
        let options = self.fit_options(seed);
        let history = self.fit_model(session, &mut model, x, y, &options, validation)?;
        Ok((model, history))
    }

    /// Trains an already built and compiled model
    pub fn fit_model<S: Session>(
        &self,
        session: &mut S,
        model: &mut S::Model,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        options: &FitOptions,
        validation: Option<(&ArrayD<f32>, &ArrayD<f32>)>,
    ) -> Result<History> {
        session.fit(model, x, y, options, validation)
    }

    pub fn predict<S: Session>(
        &self,
        session: &mut S,
        model: &mut S::Model,
        x: &ArrayD<f32>,
    ) -> Result<Array2<f32>> {
        session.predict(model, x, self.hyperparameters.batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_stages() {
        assert_eq!(num_stages(32, 4).unwrap(), 3);
        assert_eq!(num_stages(4, 4).unwrap(), 0);
        assert!(matches!(num_stages(24, 4), Err(Error::DepthRatio { .. })));
        assert!(matches!(num_stages(2, 4), Err(Error::DepthRatio { .. })));
    }

    #[test]
    fn test_plain_stage_names() {
        let net = ConvNet::standard(ConvNetHyperparameters::default()).unwrap();
        let graph = net.build_network([3, 16, 16], 2).unwrap();
        for name in [
            "conv_00",
            "hidden_activation_00",
            "pooling_00",
            "conv_01",
            "pooling_01",
            "flatten",
            "dense_output",
            "activation_output",
        ] {
            assert!(graph.find(name).is_some(), "missing {}", name);
        }
        assert!(graph.find("conv_02").is_none());
        assert!(graph.find("dense_dropout").is_none());
    }

    #[test]
    fn test_dropout_inserted_before_output() {
        let hp = ConvNetHyperparameters {
            use_dropout: true,
            dropout_alpha: 0.3,
            ..ConvNetHyperparameters::default()
        };
        let graph = ConvNet::standard(hp).unwrap().build_network([1, 8, 8], 1).unwrap();
        let dense = graph.find("dense_output").unwrap();
        assert_eq!(graph.node(dense.inputs[0]).name, "dense_dropout");
    }

    #[test]
    fn test_leaky_hidden_activation_uses_slope() {
        let hp = ConvNetHyperparameters {
            hidden_activation: crate::activation::ActivationType::Leaky,
            leaky_alpha: 0.2,
            ..ConvNetHyperparameters::default()
        };
        let graph = ConvNet::standard(hp).unwrap().build_network([1, 8, 8], 1).unwrap();
        let node = graph.find("hidden_activation_00").unwrap();
        assert_eq!(node.op, crate::graph::LayerOp::Activation(Activation::LeakyReLU(0.2)));
    }

    #[test]
    fn test_residual_projection_only_when_channels_differ() {
        let hp = ConvNetHyperparameters {
            min_filters: 4,
            filter_growth_rate: 1.0,
            filter_width: 3,
            ..ConvNetHyperparameters::default()
        };
        let net = ConvNet::residual(hp).unwrap();

        let graph = net.build_network([4, 16, 16], 1).unwrap();
        assert!(graph.find("res_shortcut_00").is_none());

        let graph = net.build_network([2, 16, 16], 1).unwrap();
        assert!(graph.find("res_shortcut_00").is_some());
        assert!(graph.find("res_shortcut_01").is_none());
    }

    #[test]
    fn test_malformed_shapes_rejected() {
        let net = ConvNet::standard(ConvNetHyperparameters::default()).unwrap();
        assert!(net.build_network([3, 16, 16], 0).is_err());
        assert!(net.build_network([0, 16, 16], 1).is_err());
        assert!(matches!(net.build_network([3, 16, 12], 1), Err(Error::DepthRatio { .. })));
    }
}
