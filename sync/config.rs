//! Analysis configuration, persisted as TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::atlas::AtlasStrategy;
use crate::group::GroupSyncOptions;
use crate::parallel::WorkerPool;
use crate::stats::covariates::CovariateColumns;
use crate::stats::{CompareOptions, PermutationOptions};
use crate::types::{SyncError, available_memory_bytes};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Keep only the first `time_points` samples of every subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_points: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    pub strategy: AtlasStrategy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Worker threads; zero uses every logical CPU.
    pub workers: usize,
}

/// Everything an analysis run needs besides its input files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Upper bound on the in-memory cohort. Defaults to available memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_budget_bytes: Option<usize>,
    /// Test every subject, including the ones flagged for the atlas.
    pub test_all: bool,
    pub normalization: NormalizationConfig,
    pub group_sync: GroupSyncOptions,
    pub atlas: AtlasConfig,
    pub permutation: PermutationOptions,
    pub compare: CompareOptions,
    pub parallel: ParallelConfig,
    pub covariates: CovariateColumns,
}

impl AnalysisConfig {
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let group = &self.group_sync;
        if !(group.tolerance.is_finite() && group.tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "group_sync.tolerance must be positive, got {}",
                group.tolerance
            )));
        }
        if group.max_sweeps == 0 {
            return Err(ConfigError::Invalid("group_sync.max_sweeps must be at least 1".into()));
        }
        if let Some(limit) = group.time_limit_secs {
            if !(limit.is_finite() && limit >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "group_sync.time_limit_secs must be a non-negative number, got {}",
                    limit
                )));
            }
        }
        if self.normalization.time_points == Some(0) {
            return Err(ConfigError::Invalid("normalization.time_points must be at least 1".into()));
        }
        if self.permutation.permutations == 0 {
            return Err(ConfigError::Invalid("permutation.permutations must be at least 1".into()));
        }
        if self.memory_budget_bytes == Some(0) {
            return Err(ConfigError::Invalid("memory_budget_bytes must be positive".into()));
        }
        Ok(())
    }

    pub fn worker_pool(&self) -> Result<WorkerPool, SyncError> {
        WorkerPool::new(self.parallel.workers)
    }

    /// Configured budget, or the memory the operating system reports as
    /// available.
    pub fn memory_budget(&self) -> usize {
        self.memory_budget_bytes.unwrap_or_else(available_memory_bytes)
    }
}
