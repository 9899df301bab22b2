use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::MergeStrategy;
use crate::error::{Error, Result};
use crate::hyperparameters::ConvNetHyperparameters;
use crate::network::Architecture;
use crate::training::DeviceStrategy;

/// Settings for the training driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub strategy: DeviceStrategy,

    /// Seeds weight initialization, dropout and shuffling
    #[serde(default)]
    pub seed: u64,

    /// Directory the trained model is written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub merge: MergeStrategy,

    /// Defaults to standard on the host and residual on accelerators
    #[serde(default)]
    pub architecture: Option<Architecture>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// A complete training run: network hyperparameters plus driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub hyperparameters: ConvNetHyperparameters,
    pub driver: DriverConfig,
}

/// Loads a run configuration from a JSON file.
///
/// Missing hyperparameters take their defaults. The result is validated
/// before it is returned.
///
/// # Examples
///
/// ```no_run
/// use goes16ci::config::load_config;
///
/// let config = load_config("config/goes16_cpu.json").unwrap();
/// println!("{:?}", config.driver.strategy);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<RunConfig> {
    let contents = fs::read_to_string(path)?;
    let config: RunConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &RunConfig) -> Result<()> {
    config.hyperparameters.validate()?;

    if let DeviceStrategy::Cpu { processors: 0 } = config.driver.strategy {
        return Err(Error::invalid_hyperparameter("processors must be positive"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::PoolingType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "hyperparameters": {{"min_filters": 8, "pooling": "max"}},
                "driver": {{"strategy": {{"kind": "cpu", "processors": 4}}, "seed": 7}}
            }}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.hyperparameters.min_filters, 8);
        assert_eq!(config.hyperparameters.pooling, PoolingType::Max);
        assert_eq!(config.hyperparameters.filter_width, 5);
        assert_eq!(config.driver.seed, 7);
        assert_eq!(config.driver.output_dir, PathBuf::from("."));
        assert_eq!(config.driver.architecture, None);
        assert!(!config.driver.merge.cpu_merge && !config.driver.merge.cpu_relocation);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "hyperparameters": {{"filter_width": 4}},
                "driver": {{"strategy": {{"kind": "accelerators", "count": 1}}}}
            }}"#
        )
        .unwrap();
        assert!(matches!(load_config(file.path()), Err(Error::InvalidHyperparameter(_))));
    }

    #[test]
    fn test_zero_processors_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"driver": {{"strategy": {{"kind": "cpu", "processors": 0}}}}}}"#
        )
        .unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
