pub mod activation;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hyperparameters;
pub mod layers;
pub mod loss;
pub mod ndarray_engine;
pub mod network;
pub mod optimizer;
pub mod scaler;
pub mod training;

pub use activation::{Activation, ActivationType};
pub use config::{load_config, DriverConfig, RunConfig};
pub use engine::{
    Device, Engine, EpochMetrics, FitOptions, History, MergeStrategy, Session, SessionConfig,
};
pub use error::{Error, Result};
pub use graph::{GraphBuilder, LayerGraph, LayerOp, Node, NodeId, Shape};
pub use hyperparameters::{ConvNetHyperparameters, DataFormat, PoolingType};
pub use loss::Loss;
pub use ndarray_engine::{NdArrayEngine, NdArrayModel, NdArraySession};
pub use network::{num_stages, Architecture, ConvNet, PlainStage, ResidualStage, StageBuilder};
pub use optimizer::{Optimizer, OptimizerSpec, OptimizerType};
pub use scaler::{MinMaxScaler2D, ScaleParameters};
pub use training::{
    model_path, train_conv_net, DeviceStrategy, ModelOf, Trainer, TrainingData, TrainingReport,
};
