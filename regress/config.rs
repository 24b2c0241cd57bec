//! Run configuration, stored as TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::preprocess::PreprocessConfig;
use crate::regression::DEFAULT_CHUNK;
use crate::strategy::{DEFAULT_MAX_CANDIDATES, MAX_CANDIDATES_LIMIT, RegressionMethod};

pub const DEFAULT_NUM_BOOTSTRAPS: usize = 2;
pub const DEFAULT_BASE_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionSettings {
    pub method: RegressionMethod,
    /// Responses per unit of parallel work.
    pub chunk_size: usize,
    /// Candidate predictors considered by best-subset selection.
    pub max_candidates: usize,
}

impl Default for RegressionSettings {
    fn default() -> Self {
        Self {
            method: RegressionMethod::default(),
            chunk_size: DEFAULT_CHUNK,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSettings {
    pub num_bootstraps: usize,
    pub base_seed: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            num_bootstraps: DEFAULT_NUM_BOOTSTRAPS,
            base_seed: DEFAULT_BASE_SEED,
        }
    }
}

/// Everything needed to reproduce a bootstrap regression run.
///
/// Missing sections and keys take their defaults, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegnetConfig {
    /// Worker threads for the per-response sweep; 0 uses the global rayon pool.
    pub threads: usize,
    pub preprocess: PreprocessConfig,
    pub regression: RegressionSettings,
    pub bootstrap: BootstrapSettings,
}

impl RegnetConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap.num_bootstraps == 0 {
            return Err(ConfigError::Invalid(
                "bootstrap.num_bootstraps must be at least 1".to_string(),
            ));
        }
        if self.regression.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "regression.chunk_size must be at least 1".to_string(),
            ));
        }
        if self.regression.max_candidates == 0
            || self.regression.max_candidates > MAX_CANDIDATES_LIMIT
        {
            return Err(ConfigError::Invalid(format!(
                "regression.max_candidates must be between 1 and {MAX_CANDIDATES_LIMIT}, got {}",
                self.regression.max_candidates
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::PreprocessMode;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regnet.toml");

        let mut config = RegnetConfig::default();
        config.preprocess.mode = PreprocessMode::RemoveCircularity;
        config.regression.method = RegressionMethod::PriorOls;
        config.bootstrap.base_seed = 7;
        config.threads = 3;
        config.save(&path).unwrap();

        assert_eq!(RegnetConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_files_take_defaults() {
        let config: RegnetConfig = toml::from_str(
            r#"
            [preprocess]
            mode = "remove_circularity"

            [bootstrap]
            num_bootstraps = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.preprocess.mode, PreprocessMode::RemoveCircularity);
        assert_eq!(config.preprocess.ddof, 1);
        assert_eq!(config.bootstrap.num_bootstraps, 5);
        assert_eq!(config.bootstrap.base_seed, DEFAULT_BASE_SEED);
        assert_eq!(config.regression, RegressionSettings::default());
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let mut config = RegnetConfig::default();
        assert!(config.validate().is_ok());

        config.bootstrap.num_bootstraps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config = RegnetConfig::default();
        config.regression.max_candidates = MAX_CANDIDATES_LIMIT + 1;
        assert!(config.validate().is_err());

        config = RegnetConfig::default();
        config.regression.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_method_fails_to_parse() {
        let parsed: Result<RegnetConfig, _> = toml::from_str("[regression]\nmethod = \"lasso\"\n");
        assert!(parsed.is_err());
    }
}
