use std::path::Path;

use log::{debug, info, warn};
use ndarray::{Array2, ArrayD};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::model::NdArrayModel;
use crate::engine::{Device, Engine, FitOptions, History, MergeStrategy, Session, SessionConfig};
use crate::error::{Error, Result};
use crate::graph::LayerGraph;
use crate::loss::Loss;
use crate::optimizer::OptimizerSpec;

/// Runs graphs on the host with ndarray. Accelerators are virtual: they are
/// placement targets that execute on host threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NdArrayEngine {
    accelerators: usize,
}

impl NdArrayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_virtual_accelerators(accelerators: usize) -> Self {
        NdArrayEngine { accelerators }
    }
}

impl Engine for NdArrayEngine {
    type Session = NdArraySession;

    fn open_session(&self, config: &SessionConfig, seed: u64) -> Result<NdArraySession> {
        if config.intra_op_threads == 0 || config.inter_op_threads == 0 {
            return Err(Error::engine("session thread counts must be positive"));
        }
        info!(
            "Session: intra-op {}, inter-op {}, soft placement {}, memory growth {}, seed {}",
            config.intra_op_threads,
            config.inter_op_threads,
            config.allow_soft_placement,
            config.allow_memory_growth,
            seed
        );
        Ok(NdArraySession {
            config: *config,
            accelerators: self.accelerators,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn accelerator_count(&self) -> usize {
        self.accelerators
    }
}

/// Device session. Released when dropped.
#[derive(Debug)]
pub struct NdArraySession {
    config: SessionConfig,
    accelerators: usize,
    seed: u64,
    rng: StdRng,
}

impl NdArraySession {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn resolve(&self, device: Device) -> Result<Device> {
        let available = match device {
            Device::Cpu(index) => index == 0,
            Device::Gpu(index) => index < self.accelerators,
        };
        if available {
            return Ok(device);
        }
        if self.config.allow_soft_placement {
            warn!("{} is not available, placing on /cpu:0 instead", device);
            return Ok(Device::Cpu(0));
        }
        Err(Error::Placement {
            device: device.to_string(),
            reason: format!("session sees 1 cpu and {} accelerators", self.accelerators),
        })
    }
}

impl Session for NdArraySession {
    type Model = NdArrayModel;

    fn build(&mut self, graph: LayerGraph, device: Device) -> Result<NdArrayModel> {
        let device = self.resolve(device)?;
        debug!("Building {} nodes on {}", graph.len(), device);
        NdArrayModel::new(graph, device, &mut self.rng)
    }

    fn replicate(
        &mut self,
        model: NdArrayModel,
        device_count: usize,
        merge: MergeStrategy,
    ) -> Result<NdArrayModel> {
        if device_count == 0 {
            return Err(Error::invalid_hyperparameter("cannot replicate onto zero devices"));
        }
        if device_count > self.accelerators {
            return Err(Error::Placement {
                device: Device::Gpu(device_count - 1).to_string(),
                reason: format!("only {} accelerators available", self.accelerators),
            });
        }
        let devices: Vec<Device> = (0..device_count).map(Device::Gpu).collect();
        info!(
            "Replicating model over {} devices (cpu merge {}, cpu relocation {})",
            device_count, merge.cpu_merge, merge.cpu_relocation
        );
        model.replicate(devices, merge, self.config.inter_op_threads, &mut self.rng)
    }

    fn compile(
        &mut self,
        model: &mut NdArrayModel,
        optimizer: &OptimizerSpec,
        loss: Loss,
        metrics: &[Loss],
    ) -> Result<()> {
        model.compile(optimizer, loss, metrics)
    }

    fn fit(
        &mut self,
        model: &mut NdArrayModel,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        options: &FitOptions,
        validation: Option<(&ArrayD<f32>, &ArrayD<f32>)>,
    ) -> Result<History> {
        model.fit(x, y, options, validation)
    }

    fn predict(
        &mut self,
        model: &mut NdArrayModel,
        x: &ArrayD<f32>,
        batch_size: usize,
    ) -> Result<Array2<f32>> {
        model.predict(x, batch_size)
    }

    fn save(&self, model: &NdArrayModel, path: &Path) -> Result<()> {
        model.save(path)
    }

    fn graph<'m>(&self, model: &'m NdArrayModel) -> &'m LayerGraph {
        model.graph()
    }
}

impl Drop for NdArraySession {
    fn drop(&mut self) {
        debug!("Closing session (seed {})", self.seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::graph::GraphBuilder;
    use crate::hyperparameters::DataFormat;

    fn tiny_graph() -> LayerGraph {
        let mut builder = GraphBuilder::new(DataFormat::ChannelsFirst);
        let input = builder.input("input", [1, 2, 2]).unwrap();
        let flat = builder.flatten("flatten", input).unwrap();
        let dense = builder.dense("dense", flat, 1).unwrap();
        let out = builder.activation("out", dense, Activation::Sigmoid).unwrap();
        builder.finish(out).unwrap()
    }

    #[test]
    fn test_strict_placement_rejects_missing_accelerator() {
        let engine = NdArrayEngine::new();
        let mut session = engine.open_session(&SessionConfig::gpu(), 0).unwrap();
        let result = session.build(tiny_graph(), Device::Gpu(0));
        assert!(matches!(result, Err(Error::Placement { .. })));
    }

    #[test]
    fn test_soft_placement_falls_back_to_cpu() {
        let engine = NdArrayEngine::new();
        let mut session = engine.open_session(&SessionConfig::default(), 0).unwrap();
        let model = session.build(tiny_graph(), Device::Gpu(1)).unwrap();
        assert_eq!(model.device(), Device::Cpu(0));
    }

    #[test]
    fn test_replicate_uses_virtual_accelerators() {
        let engine = NdArrayEngine::with_virtual_accelerators(2);
        let mut session = engine.open_session(&SessionConfig::gpu(), 0).unwrap();
        let model = session.build(tiny_graph(), Device::Cpu(0)).unwrap();
        let model = session.replicate(model, 2, MergeStrategy::default()).unwrap();
        assert_eq!(model.replica_devices(), vec![Device::Gpu(0), Device::Gpu(1)]);
        assert!(!model.is_compiled());

        let model = session.build(tiny_graph(), Device::Cpu(0)).unwrap();
        assert!(session.replicate(model, 3, MergeStrategy::default()).is_err());
    }

    #[test]
    fn test_same_seed_builds_same_weights() {
        let engine = NdArrayEngine::new();
        let build = || {
            let mut session = engine.open_session(&SessionConfig::cpu(1), 42).unwrap();
            session.build(tiny_graph(), Device::Cpu(0)).unwrap()
        };
        let (first, second) = (build(), build());
        assert_eq!(first.weights("dense"), second.weights("dense"));
    }
}
