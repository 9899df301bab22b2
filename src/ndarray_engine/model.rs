use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use log::{debug, log, Level};
use ndarray::{concatenate, s, Array2, ArrayD, ArrayView2, Axis, Ix2, Slice};
use rand::rngs::StdRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;

use super::program::Program;
use crate::engine::{Device, EpochMetrics, FitOptions, History, MergeStrategy};
use crate::error::{Error, Result};
use crate::graph::LayerGraph;
use crate::hyperparameters::DataFormat;
use crate::loss::Loss;
use crate::optimizer::{Optimizer, OptimizerSpec};

#[derive(Debug)]
struct Compiled {
    optimizer: Optimizer,
    loss: Loss,
    metrics: Vec<Loss>,
}

/// A graph bound to executable layers on a device, optionally replicated
/// across accelerators for data-parallel training.
#[derive(Debug)]
pub struct NdArrayModel {
    graph: LayerGraph,
    master: Program,
    replicas: Vec<Program>,
    merge: Option<MergeStrategy>,
    /// Runs replica shards; sized by the session's inter-op threads
    pool: Option<ThreadPool>,
    compiled: Option<Compiled>,
}

impl NdArrayModel {
    pub(crate) fn new(graph: LayerGraph, device: Device, rng: &mut StdRng) -> Result<Self> {
        let master = Program::instantiate(&graph, device, rng)?;
        Ok(NdArrayModel {
            graph,
            master,
            replicas: Vec::new(),
            merge: None,
            pool: None,
            compiled: None,
        })
    }

    pub fn graph(&self) -> &LayerGraph {
        &self.graph
    }

    /// Device holding the master weights
    pub fn device(&self) -> Device {
        self.master.device
    }

    pub fn replica_devices(&self) -> Vec<Device> {
        self.replicas.iter().map(|replica| replica.device).collect()
    }

    pub fn merge_strategy(&self) -> Option<MergeStrategy> {
        self.merge
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Current weights of the named node, if it has any
    pub fn weights(&self, name: &str) -> Option<&ArrayD<f32>> {
        let id = self.graph.nodes().iter().position(|node| node.name == name)?;
        self.master
            .layer(id)
            .and_then(|layer| layer.params())
            .map(|params| &params.weights)
    }

    pub(crate) fn replicate(
        mut self,
        devices: Vec<Device>,
        merge: MergeStrategy,
        threads: usize,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| Error::engine(format!("failed to build replica thread pool: {}", e)))?;
        self.replicas = devices
            .into_iter()
            .map(|device| self.master.replica(device, rng))
            .collect();
        self.merge = Some(merge);
        self.pool = Some(pool);
        self.compiled = None;
        Ok(self)
    }

    pub(crate) fn compile(
        &mut self,
        optimizer: &OptimizerSpec,
        loss: Loss,
        metrics: &[Loss],
    ) -> Result<()> {
        if optimizer.learning_rate <= 0.0 || !optimizer.learning_rate.is_finite() {
            return Err(Error::invalid_hyperparameter("learning rate must be positive"));
        }
        self.compiled = Some(Compiled {
            optimizer: optimizer.build(),
            loss,
            metrics: metrics.to_vec(),
        });
        Ok(())
    }

    pub(crate) fn fit(
        &mut self,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        options: &FitOptions,
        validation: Option<(&ArrayD<f32>, &ArrayD<f32>)>,
    ) -> Result<History> {
        let (loss, metrics) = match &self.compiled {
            Some(compiled) => (compiled.loss, compiled.metrics.clone()),
            None => return Err(Error::NotCompiled),
        };
        if options.batch_size == 0 || options.epochs == 0 {
            return Err(Error::invalid_hyperparameter("batch_size and epochs must be positive"));
        }

        let inputs = self.to_internal(x)?;
        let examples = inputs.shape()[0];
        if examples == 0 {
            return Err(Error::invalid_shape("cannot fit on an empty dataset"));
        }
        let targets = self.targets(y, examples)?;
        let validation = match validation {
            Some((val_x, val_y)) => {
                let val_inputs = self.to_internal(val_x)?;
                let val_targets = self.targets(val_y, val_inputs.shape()[0])?;
                Some((val_inputs, val_targets))
            }
            None => None,
        };

        let level = if options.verbose > 0 { Level::Info } else { Level::Debug };
        let mut shuffler = fastrand::Rng::with_seed(options.seed);
        let mut order: Vec<usize> = (0..examples).collect();
        let mut history = History {
            batch_size: options.batch_size,
            epochs: Vec::with_capacity(options.epochs),
        };

        for epoch in 0..options.epochs {
            if options.shuffle {
                shuffler.shuffle(&mut order);
            }

            let mut loss_sum = 0.0;
            let mut metric_sums = vec![0.0; metrics.len()];
            for batch in order.chunks(options.batch_size) {
                let batch_x = inputs.select(Axis(0), batch);
                let batch_y = targets.select(Axis(0), batch);
                let predictions = self.train_step(&batch_x, batch_y.view())?;

                let weight = batch.len() as f32;
                loss_sum += loss.calculate(&predictions, &batch_y) * weight;
                for (sum, metric) in metric_sums.iter_mut().zip(&metrics) {
                    *sum += metric.calculate(&predictions, &batch_y) * weight;
                }
            }

            let val_loss = match &validation {
                Some((val_inputs, val_targets)) => {
                    let predictions = self.infer(val_inputs, options.batch_size)?;
                    Some(loss.calculate(&predictions, val_targets))
                }
                None => None,
            };

            let record = EpochMetrics {
                epoch,
                loss: loss_sum / examples as f32,
                val_loss,
                metrics: metrics
                    .iter()
                    .zip(&metric_sums)
                    .map(|(metric, sum)| (metric.name().to_string(), sum / examples as f32))
                    .collect(),
            };
            log!(
                level,
                "Epoch {}/{} - loss: {:.6}{}",
                epoch + 1,
                options.epochs,
                record.loss,
                record
                    .val_loss
                    .map(|val| format!(" - val_loss: {:.6}", val))
                    .unwrap_or_default()
            );
            history.epochs.push(record);
        }

        Ok(history)
    }

    pub(crate) fn predict(&mut self, x: &ArrayD<f32>, batch_size: usize) -> Result<Array2<f32>> {
        let inputs = self.to_internal(x)?;
        self.infer(&inputs, batch_size.max(1))
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = Vec::new();
        for (id, node) in self.graph.nodes().iter().enumerate() {
            let Some(layer) = self.master.layer(id) else {
                continue;
            };
            if let Some(params) = layer.params() {
                tensors.push(SavedTensor::new(&node.name, "weights", &params.weights));
                tensors.push(SavedTensor::new(&node.name, "bias", &params.bias));
            }
            for (index, buffer) in layer.buffers().into_iter().enumerate() {
                tensors.push(SavedTensor::new(&node.name, BUFFER_NAMES[index.min(1)], buffer));
            }
        }

        let saved = SavedModel {
            graph: &self.graph,
            device: self.master.device,
            replicas: self.replicas.len(),
            tensors,
        };
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(writer, &saved)?;
        debug!("Saved {} to {}", self.master.device, path.display());
        Ok(())
    }

    /// One optimizer step over a mini-batch, returning the batch predictions
    fn train_step(&mut self, x: &ArrayD<f32>, y: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let loss = self.compiled.as_ref().ok_or(Error::NotCompiled)?.loss;
        let rows = x.shape()[0];

        let predictions = if self.replicas.is_empty() {
            self.master.zero_grads();
            self.master.train_shard(&self.graph, x.view(), y, loss)?
        } else {
            let shards = shard_bounds(rows, self.replicas.len());
            for replica in &mut self.replicas[..shards.len()] {
                replica.sync_from(&self.master);
                replica.zero_grads();
            }

            let graph = &self.graph;
            let pool = self
                .pool
                .as_ref()
                .ok_or_else(|| Error::engine("replicated model has no thread pool"))?;
            let outputs = pool.install(|| {
                self.replicas[..shards.len()]
                    .par_iter_mut()
                    .zip(shards.par_iter())
                    .map(|(replica, &(start, end))| {
                        let shard_x = x.slice_axis(Axis(0), Slice::from(start..end));
                        let shard_y = y.slice(s![start..end, ..]);
                        replica.train_shard(graph, shard_x, shard_y, loss)
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            // Merge weighted by shard size so the step matches a single-device batch
            let merge_device = match self.merge {
                Some(MergeStrategy { cpu_merge: false, .. }) => Device::Gpu(0),
                _ => self.master.device,
            };
            debug!("Merging {} replica gradients on {}", shards.len(), merge_device);
            self.master.zero_grads();
            self.master.clear_buffers();
            for (replica, &(start, end)) in self.replicas.iter().zip(&shards) {
                self.master
                    .accumulate_from(replica, (end - start) as f32 / rows as f32);
            }

            let views: Vec<_> = outputs.iter().map(|output| output.view()).collect();
            concatenate(Axis(0), &views)?
        };

        if let Some(compiled) = self.compiled.as_mut() {
            compiled.optimizer.update(self.master.slots());
        }
        Ok(predictions)
    }

    fn infer(&mut self, inputs: &ArrayD<f32>, batch_size: usize) -> Result<Array2<f32>> {
        let examples = inputs.shape()[0];
        let mut outputs = Vec::new();
        let mut start = 0;
        while start < examples {
            let end = (start + batch_size).min(examples);
            let batch = inputs.slice_axis(Axis(0), Slice::from(start..end)).to_owned();
            let output = self.master.forward(&self.graph, &batch, false)?;
            outputs.push(output.into_dimensionality::<Ix2>()?);
            start = end;
        }
        if outputs.is_empty() {
            return Ok(Array2::zeros((0, self.graph.output_shape().len())));
        }
        let views: Vec<_> = outputs.iter().map(|output| output.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    /// Validates a batch of examples and converts it to channels-first order
    fn to_internal(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        let expected = self.graph.input_shape().dims(self.graph.data_format());
        if x.ndim() != 4 || x.shape()[1..] != expected[..] {
            return Err(Error::invalid_shape(format!(
                "expected examples of shape {:?}, got array of shape {:?}",
                expected,
                x.shape()
            )));
        }
        Ok(match self.graph.data_format() {
            DataFormat::ChannelsFirst => x.to_owned(),
            DataFormat::ChannelsLast => x
                .view()
                .permuted_axes(vec![0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
        })
    }

    /// Targets as an (examples, outputs) matrix
    fn targets(&self, y: &ArrayD<f32>, examples: usize) -> Result<Array2<f32>> {
        let outputs = self.graph.output_shape().len();
        let matrix = match y.ndim() {
            1 => y.to_shape((y.len(), 1))?.into_owned(),
            2 => y.view().into_dimensionality::<Ix2>()?.to_owned(),
            rank => {
                return Err(Error::invalid_shape(format!(
                    "targets must have rank 1 or 2, got rank {}",
                    rank
                )))
            }
        };
        if matrix.dim() != (examples, outputs) {
            return Err(Error::invalid_shape(format!(
                "expected targets of shape ({}, {}), got {:?}",
                examples,
                outputs,
                y.shape()
            )));
        }
        Ok(matrix)
    }
}

const BUFFER_NAMES: [&str; 2] = ["moving_mean", "moving_variance"];

#[derive(Serialize)]
struct SavedTensor {
    node: String,
    name: &'static str,
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl SavedTensor {
    fn new(node: &str, name: &'static str, array: &ArrayD<f32>) -> Self {
        SavedTensor {
            node: node.to_string(),
            name,
            shape: array.shape().to_vec(),
            values: array.iter().copied().collect(),
        }
    }
}

#[derive(Serialize)]
struct SavedModel<'a> {
    graph: &'a LayerGraph,
    device: Device,
    replicas: usize,
    tensors: Vec<SavedTensor>,
}

/// Splits `rows` into at most `parts` contiguous, near-equal ranges
fn shard_bounds(rows: usize, parts: usize) -> Vec<(usize, usize)> {
    let parts = parts.min(rows).max(1);
    let base = rows / parts;
    let extra = rows % parts;
    let mut bounds = Vec::with_capacity(parts);
    let mut start = 0;
    for part in 0..parts {
        let len = base + usize::from(part < extra);
        bounds.push((start, start + len));
        start += len;
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::graph::GraphBuilder;
    use crate::hyperparameters::PoolingType;
    use crate::optimizer::OptimizerType;
    use approx::assert_abs_diff_eq;
    use ndarray::IxDyn;
    use rand::SeedableRng;

    fn small_graph(format: DataFormat) -> LayerGraph {
        let mut builder = GraphBuilder::new(format);
        let dims = format.join(2, 4, 4);
        let input = builder.input("input", dims).unwrap();
        let conv = builder.conv2d("conv", input, 3, 3).unwrap();
        let act = builder.activation("relu", conv, Activation::ReLU).unwrap();
        let pool = builder.pool2d("pool", act, PoolingType::Mean).unwrap();
        let flat = builder.flatten("flatten", pool).unwrap();
        let dense = builder.dense("dense", flat, 1).unwrap();
        let out = builder.activation("out", dense, Activation::Sigmoid).unwrap();
        builder.finish(out).unwrap()
    }

    fn cpu_model(format: DataFormat, rng: &mut StdRng) -> NdArrayModel {
        NdArrayModel::new(small_graph(format), Device::Cpu(0), rng).unwrap()
    }

    fn dataset(examples: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let x = ArrayD::from_shape_fn(IxDyn(&[examples, 2, 4, 4]), |idx| {
            ((idx[0] * 7 + idx[1] * 3 + idx[2] * 5 + idx[3]) % 11) as f32 / 11.0
        });
        let y = ArrayD::from_shape_fn(IxDyn(&[examples]), |idx| (idx[0] % 2) as f32);
        (x, y)
    }

    fn options(batch_size: usize, epochs: usize) -> FitOptions {
        FitOptions {
            batch_size,
            epochs,
            verbose: 0,
            shuffle: false,
            seed: 0,
        }
    }

    #[test]
    fn test_shard_bounds() {
        assert_eq!(shard_bounds(10, 3), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(shard_bounds(1, 4), vec![(0, 1)]);
    }

    #[test]
    fn test_fit_requires_compile() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = cpu_model(DataFormat::ChannelsFirst, &mut rng);
        let (x, y) = dataset(4);
        assert!(matches!(model.fit(&x, &y, &options(2, 1), None), Err(Error::NotCompiled)));
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut model = cpu_model(DataFormat::ChannelsFirst, &mut rng);
        model
            .compile(
                &OptimizerSpec::new(OptimizerType::Adam, 0.01),
                Loss::MeanSquaredError,
                &[Loss::MeanAbsoluteError],
            )
            .unwrap();

        let (x, y) = dataset(8);
        let history = model.fit(&x, &y, &options(4, 30), None).unwrap();
        let first = history.epochs[0].loss;
        let last = history.final_loss().unwrap();
        assert!(last < first, "loss went from {} to {}", first, last);
        assert_eq!(history.epochs[0].metrics[0].0, "mae");
    }

    #[test]
    fn test_replicated_step_matches_single_device() {
        let spec = OptimizerSpec::new(OptimizerType::SgdMomentum, 0.1);
        let (x, y) = dataset(6);

        let mut rng = StdRng::seed_from_u64(21);
        let mut single = cpu_model(DataFormat::ChannelsFirst, &mut rng);
        single.compile(&spec, Loss::MeanSquaredError, &[]).unwrap();
        single.fit(&x, &y, &options(6, 1), None).unwrap();

        let mut rng = StdRng::seed_from_u64(21);
        let model = cpu_model(DataFormat::ChannelsFirst, &mut rng);
        let devices = vec![Device::Gpu(0), Device::Gpu(1)];
        let mut replicated = model
            .replicate(devices, MergeStrategy::default(), 2, &mut rng)
            .unwrap();
        replicated.compile(&spec, Loss::MeanSquaredError, &[]).unwrap();
        replicated.fit(&x, &y, &options(6, 1), None).unwrap();

        let expected = single.weights("dense").unwrap();
        let actual = replicated.weights("dense").unwrap();
        for (a, b) in expected.iter().zip(actual.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_replica_pool_size_does_not_change_step() {
        let spec = OptimizerSpec::new(OptimizerType::Adam, 0.01);
        let (x, y) = dataset(7);
        let devices = vec![Device::Gpu(0), Device::Gpu(1), Device::Gpu(2)];

        let weights: Vec<ArrayD<f32>> = [1, 3]
            .into_iter()
            .map(|threads| {
                let mut rng = StdRng::seed_from_u64(8);
                let model = cpu_model(DataFormat::ChannelsFirst, &mut rng);
                let mut model = model
                    .replicate(devices.clone(), MergeStrategy::default(), threads, &mut rng)
                    .unwrap();
                assert_eq!(model.pool.as_ref().unwrap().current_num_threads(), threads);
                model.compile(&spec, Loss::MeanSquaredError, &[]).unwrap();
                model.fit(&x, &y, &options(7, 2), None).unwrap();
                model.weights("conv").unwrap().clone()
            })
            .collect();

        for (a, b) in weights[0].iter().zip(weights[1].iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_predict_channels_last() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = cpu_model(DataFormat::ChannelsLast, &mut rng);
        let x = ArrayD::from_elem(IxDyn(&[5, 4, 4, 2]), 3.0);
        let predictions = model.predict(&x, 2).unwrap();
        assert_eq!(predictions.dim(), (5, 1));
        assert!(predictions.iter().all(|&p| (0.0..=1.0).contains(&p)));

        let wrong = ArrayD::zeros(IxDyn(&[5, 2, 4, 4]));
        assert!(model.predict(&wrong, 2).is_err());
    }

    #[test]
    fn test_target_shapes() {
        let mut rng = StdRng::seed_from_u64(2);
        let model = cpu_model(DataFormat::ChannelsFirst, &mut rng);
        assert_eq!(model.targets(&ArrayD::zeros(IxDyn(&[3])), 3).unwrap().dim(), (3, 1));
        assert!(model.targets(&ArrayD::zeros(IxDyn(&[3, 2])), 3).is_err());
        assert!(model.targets(&ArrayD::zeros(IxDyn(&[4])), 3).is_err());
    }
}
