//! Training drivers for the convolutional networks.
//!
//! A [`Trainer`] picks a device strategy, opens one engine session for the run,
//! builds and fits the network, and writes the trained model to
//! `<output_dir>/goes16_resnet_gpus_<NN>.h5`. The session lives only inside
//! the training call and is released when it returns, whether or not training
//! succeeded.
//!
//! The seed is passed into the session, which derives weight initialization
//! and dropout from it, and into the fit options, where it drives the
//! per-epoch shuffle. Two runs with the same seed and data train identically.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::engine::{Device, Engine, History, MergeStrategy, Session, SessionConfig};
use crate::error::Result;
use crate::hyperparameters::ConvNetHyperparameters;
use crate::network::{Architecture, ConvNet};

/// Model type produced by an engine's sessions
pub type ModelOf<E> = <<E as Engine>::Session as Session>::Model;

/// Training examples, targets and optional validation data
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub x: ArrayD<f32>,
    pub y: ArrayD<f32>,
    pub val_x: Option<ArrayD<f32>>,
    pub val_y: Option<ArrayD<f32>>,
}

impl TrainingData {
    pub fn new(x: ArrayD<f32>, y: ArrayD<f32>) -> Self {
        TrainingData {
            x,
            y,
            val_x: None,
            val_y: None,
        }
    }

    pub fn with_validation(mut self, val_x: ArrayD<f32>, val_y: ArrayD<f32>) -> Self {
        self.val_x = Some(val_x);
        self.val_y = Some(val_y);
        self
    }

    /// Validation pair, present only when both halves are set
    pub fn validation(&self) -> Option<(&ArrayD<f32>, &ArrayD<f32>)> {
        match (&self.val_x, &self.val_y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }
}

/// Which devices a run trains on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceStrategy {
    /// One host device with `processors` concurrent ops
    Cpu { processors: usize },
    /// `count` accelerators; more than one replicates the model
    Accelerators { count: usize },
}

#[derive(Debug)]
pub struct TrainingReport<M> {
    /// Accelerators trained on, 0 for the host strategy
    pub device_count: usize,
    pub history: History,
    pub model_path: PathBuf,
    pub model: M,
}

/// Where a run with `device_count` devices saves its model
pub fn model_path(output_dir: &Path, device_count: usize) -> PathBuf {
    output_dir.join(format!("goes16_resnet_gpus_{:02}.h5", device_count))
}

pub struct Trainer<'e, E: Engine> {
    engine: &'e E,
    hyperparameters: ConvNetHyperparameters,
    seed: u64,
    output_dir: PathBuf,
    architecture: Option<Architecture>,
    merge: MergeStrategy,
}

impl<'e, E: Engine> Trainer<'e, E> {
    pub fn new(engine: &'e E, hyperparameters: ConvNetHyperparameters) -> Self {
        Trainer {
            engine,
            hyperparameters,
            seed: 0,
            output_dir: PathBuf::from("."),
            architecture: None,
            merge: MergeStrategy::default(),
        }
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Overrides the default architecture: standard on the host, residual on accelerators
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    pub fn merge_strategy(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    pub fn train(
        &self,
        data: &TrainingData,
        strategy: DeviceStrategy,
    ) -> Result<Option<TrainingReport<ModelOf<E>>>> {
        match strategy {
            DeviceStrategy::Cpu { processors } => self.train_cpu(data, processors).map(Some),
            DeviceStrategy::Accelerators { count } => self.train_gpu(data, count),
        }
    }

    /// Trains on `/cpu:0` with single-threaded kernels and `processors`
    /// concurrent ops. Placement is strict.
    pub fn train_cpu(
        &self,
        data: &TrainingData,
        processors: usize,
    ) -> Result<TrainingReport<ModelOf<E>>> {
        let net = ConvNet::new(
            self.hyperparameters.clone(),
            self.architecture.unwrap_or(Architecture::Standard),
        )?;
        let mut session = self.engine.open_session(&SessionConfig::cpu(processors), self.seed)?;

        let mut model = net.build_model(&mut session, &data.x, &data.y, Device::Cpu(0))?;
        info!("Model summary:\n{}", session.graph(&model).summary());
        net.compile_model(&mut session, &mut model)?;
        let history = net.fit_model(
            &mut session,
            &mut model,
            &data.x,
            &data.y,
            &net.fit_options(self.seed),
            data.validation(),
        )?;

        let model_path = self.persist(&session, &model, 0)?;
        Ok(TrainingReport {
            device_count: 0,
            history,
            model_path,
            model,
        })
    }

    /// Trains on `count` accelerators. A single accelerator holds the whole
    /// model; more than one replicate it, with each replica fitting a shard of a
    /// batch `count` times the configured size. Zero accelerators trains nothing.
    pub fn train_gpu(
        &self,
        data: &TrainingData,
        count: usize,
    ) -> Result<Option<TrainingReport<ModelOf<E>>>> {
        if count == 0 {
            warn!("Number of GPUs set to 0, nothing to train");
            return Ok(None);
        }

        let net = ConvNet::new(
            self.hyperparameters.clone(),
            self.architecture.unwrap_or(Architecture::Residual),
        )?;
        let mut options = net.fit_options(self.seed);
        let config = SessionConfig {
            inter_op_threads: count,
            ..SessionConfig::gpu()
        };
        let mut session = self.engine.open_session(&config, self.seed)?;

        let mut model = if count == 1 {
            net.build_model(&mut session, &data.x, &data.y, Device::Gpu(0))?
        } else {
            options.batch_size *= count;
            let model = net.build_model(&mut session, &data.x, &data.y, Device::Cpu(0))?;
            session.replicate(model, count, self.merge)?
        };
        info!("Model summary:\n{}", session.graph(&model).summary());
        net.compile_model(&mut session, &mut model)?;
        let history = net.fit_model(
            &mut session,
            &mut model,
            &data.x,
            &data.y,
            &options,
            data.validation(),
        )?;

        let model_path = self.persist(&session, &model, count)?;
        Ok(Some(TrainingReport {
            device_count: count,
            history,
            model_path,
            model,
        }))
    }

    fn persist(
        &self,
        session: &E::Session,
        model: &ModelOf<E>,
        device_count: usize,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;
        let path = model_path(&self.output_dir, device_count);
        session.save(model, &path)?;
        info!("Saved model to {}", path.display());
        Ok(path)
    }
}

/// Runs the driver described by a loaded configuration
pub fn train_conv_net<E: Engine>(
    engine: &E,
    data: &TrainingData,
    config: &RunConfig,
) -> Result<Option<TrainingReport<ModelOf<E>>>> {
    let mut trainer = Trainer::new(engine, config.hyperparameters.clone())
        .seed(config.driver.seed)
        .output_dir(&config.driver.output_dir)
        .merge_strategy(config.driver.merge);
    if let Some(architecture) = config.driver.architecture {
        trainer = trainer.architecture(architecture);
    }
    trainer.train(data, config.driver.strategy)
}
