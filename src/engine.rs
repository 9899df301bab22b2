//! Collaborator contract for whatever executes a [`LayerGraph`].
//!
//! Network construction and the training driver only talk to an [`Engine`] and
//! the [`Session`] it opens. A session owns device resources for the duration of
//! one training run and releases them when dropped. [`crate::NdArrayEngine`] is
//! the in-crate implementation.

use std::fmt;
use std::path::Path;

use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::LayerGraph;
use crate::loss::Loss;
use crate::optimizer::OptimizerSpec;

/// A logical device a model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu(usize),
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu(index) => write!(f, "/cpu:{}", index),
            Device::Gpu(index) => write!(f, "/gpu:{}", index),
        }
    }
}

/// Resource policy a session is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub intra_op_threads: usize,
    pub inter_op_threads: usize,
    /// Fall back to another device when the requested one is unavailable
    pub allow_soft_placement: bool,
    pub allow_memory_growth: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            intra_op_threads: 1,
            inter_op_threads: 1,
            allow_soft_placement: true,
            allow_memory_growth: false,
        }
    }
}

impl SessionConfig {
    /// Single-threaded kernels, `processors` concurrent ops, strict placement
    pub fn cpu(processors: usize) -> Self {
        SessionConfig {
            intra_op_threads: 1,
            inter_op_threads: processors.max(1),
            allow_soft_placement: false,
            allow_memory_growth: false,
        }
    }

    /// Strict placement with on-demand accelerator memory
    pub fn gpu() -> Self {
        SessionConfig {
            allow_soft_placement: false,
            allow_memory_growth: true,
            ..SessionConfig::default()
        }
    }
}

/// Where replica weights are merged and where variables live between steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStrategy {
    pub cpu_merge: bool,
    pub cpu_relocation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitOptions {
    pub batch_size: usize,
    pub epochs: usize,
    pub verbose: u8,
    pub shuffle: bool,
    /// Seeds the per-epoch shuffle
    pub seed: u64,
}

/// Losses recorded at the end of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub val_loss: Option<f32>,
    /// `(metric name, value)` in the order the metrics were compiled
    pub metrics: Vec<(String, f32)>,
}

/// Record of a completed fit call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    /// Batch size the fit call was run with
    pub batch_size: usize,
    pub epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|epoch| epoch.loss)
    }
}

pub trait Engine {
    type Session: Session;

    /// Opens a session. `seed` drives all engine-side randomness.
    fn open_session(&self, config: &SessionConfig, seed: u64) -> Result<Self::Session>;

    /// Accelerators available to sessions of this engine
    fn accelerator_count(&self) -> usize;
}

pub trait Session {
    type Model;

    fn build(&mut self, graph: LayerGraph, device: Device) -> Result<Self::Model>;

    /// Spreads `model` over `device_count` accelerators. The returned model
    /// supersedes the one passed in and must be compiled again.
    fn replicate(
        &mut self,
        model: Self::Model,
        device_count: usize,
        merge: MergeStrategy,
    ) -> Result<Self::Model>;

    fn compile(
        &mut self,
        model: &mut Self::Model,
        optimizer: &OptimizerSpec,
        loss: Loss,
        metrics: &[Loss],
    ) -> Result<()>;

    fn fit(
        &mut self,
        model: &mut Self::Model,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
        options: &FitOptions,
        validation: Option<(&ArrayD<f32>, &ArrayD<f32>)>,
    ) -> Result<History>;

    fn predict(
        &mut self,
        model: &mut Self::Model,
        x: &ArrayD<f32>,
        batch_size: usize,
    ) -> Result<Array2<f32>>;

    fn save(&self, model: &Self::Model, path: &Path) -> Result<()>;

    fn graph<'m>(&self, model: &'m Self::Model) -> &'m LayerGraph;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(Device::Cpu(0).to_string(), "/cpu:0");
        assert_eq!(Device::Gpu(3).to_string(), "/gpu:3");
    }

    #[test]
    fn test_session_presets() {
        let cpu = SessionConfig::cpu(8);
        assert_eq!(cpu.intra_op_threads, 1);
        assert_eq!(cpu.inter_op_threads, 8);
        assert!(!cpu.allow_soft_placement);

        let gpu = SessionConfig::gpu();
        assert!(gpu.allow_memory_growth);
        assert!(!gpu.allow_soft_placement);
    }

    #[test]
    fn test_merge_strategy_defaults_off() {
        let merge = MergeStrategy::default();
        assert!(!merge.cpu_merge);
        assert!(!merge.cpu_relocation);

        let merge: MergeStrategy =
            serde_json::from_str(r#"{"cpu_merge": false, "cpu_relocation": false}"#).unwrap();
        assert_eq!(merge, MergeStrategy::default());
    }
}
