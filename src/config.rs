use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONTAMINATION, DEFAULT_MAX_SAMPLES, DEFAULT_MAX_WORKERS, DEFAULT_N_TREES, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_SEED, FEATURE_COLUMNS,
};
use crate::error::{PipelineError, Result};
use crate::pipeline::ingestion::IngestionSettings;
use crate::pipeline::processing::scoring::{AnomalyScorer, IsolationForest, IsolationForestParams};
use crate::pipeline::storage::InvalidationPolicy;

pub const STUDY_ROOT_ENV: &str = "SITE_RISK_STUDY_ROOT";
pub const CACHE_DB_ENV: &str = "SITE_RISK_CACHE_DB";
pub const OUTPUT_DIR_ENV: &str = "SITE_RISK_OUTPUT_DIR";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub ingestion: IngestionConfig,
    pub cache: CacheConfig,
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding one folder per study
    pub study_root: PathBuf,
    pub cache_db: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            study_root: PathBuf::from("data"),
            cache_db: PathBuf::from("cache/site_metrics.db"),
            output_dir: PathBuf::from("output"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub max_workers: usize,
    pub read_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub invalidation: InvalidationPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub contamination: f64,
    pub seed: u64,
    pub n_trees: usize,
    pub max_samples: usize,
    pub features: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            contamination: DEFAULT_CONTAMINATION,
            seed: DEFAULT_SEED,
            n_trees: DEFAULT_N_TREES,
            max_samples: DEFAULT_MAX_SAMPLES,
            features: FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load `config_path` if it exists (defaults otherwise), then apply env overrides
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut config = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).map_err(|e| {
                PipelineError::Config(format!("Failed to read config file '{}': {}", config_path.display(), e))
            })?;
            Self::from_toml(&config_content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Override paths from the environment; `lookup` is `std::env::var` outside tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(STUDY_ROOT_ENV) {
            self.paths.study_root = PathBuf::from(v);
        }
        if let Some(v) = lookup(CACHE_DB_ENV) {
            self.paths.cache_db = PathBuf::from(v);
        }
        if let Some(v) = lookup(OUTPUT_DIR_ENV) {
            self.paths.output_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring;
        if !(scoring.contamination > 0.0 && scoring.contamination <= 0.5) {
            return Err(PipelineError::Config(format!(
                "scoring.contamination must be in (0, 0.5], got {}",
                scoring.contamination
            )));
        }
        if scoring.n_trees == 0 || scoring.max_samples == 0 {
            return Err(PipelineError::Config(
                "scoring.n_trees and scoring.max_samples must be at least 1".to_string(),
            ));
        }
        if scoring.features.is_empty() {
            return Err(PipelineError::Config("scoring.features must name at least one column".to_string()));
        }
        if self.ingestion.max_workers == 0 {
            return Err(PipelineError::Config("ingestion.max_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn ingestion_settings(&self) -> IngestionSettings {
        IngestionSettings {
            max_workers: self.ingestion.max_workers,
            read_timeout: Duration::from_secs(self.ingestion.read_timeout_secs),
        }
    }

    pub fn forest_params(&self) -> IsolationForestParams {
        IsolationForestParams {
            n_trees: self.scoring.n_trees,
            max_samples: self.scoring.max_samples,
            contamination: self.scoring.contamination,
            seed: self.scoring.seed,
        }
    }

    pub fn scorer(&self) -> AnomalyScorer {
        AnomalyScorer::new(
            Box::new(IsolationForest::new(self.forest_params())),
            self.scoring.features.clone(),
        )
    }
}
