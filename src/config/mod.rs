//! Study configuration with YAML schema and validation.
//!
//! Implements Poka-Yoke (mistake-proofing) through:
//! - Type-safe configuration structs with `deny_unknown_fields`
//! - Schema validation via `validator`
//! - Runtime semantic validation (factor levels, model admissibility)
//!
//! ```yaml
//! study:
//!   name: cfa-fit-indices
//! factors:
//!   sample_size: [100, 200, 500, 1000]
//!   model_type: [true, misspecified]
//!   data_type: [normal, non_normal]
//! replications: 500
//! reproducibility:
//!   seed: 42
//! retry:
//!   max_retries_per_replication: 0
//! execution:
//!   parallelism: by-condition
//! persistence:
//!   state_path: results/state.json
//!   output_csv: results/summary.csv
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::design::{ConditionGrid, FactorLevels};
use crate::domains::cfa::PopulationModel;
use crate::engine::{EngineConfig, Parallelism};
use crate::error::{SimError, SimResult};

/// Study file schema version this crate reads.
pub const SCHEMA_VERSION: &str = "1.0";

/// Top-level study configuration.
///
/// Loaded from YAML files with full schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StudyConfig {
    /// Schema version; only [`SCHEMA_VERSION`] is accepted.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Study metadata.
    #[serde(default)]
    pub study: StudyMeta,

    /// Factor levels spanning the condition grid.
    #[serde(default)]
    pub factors: FactorLevels,

    /// Replications per condition.
    #[validate(range(min = 1))]
    #[serde(default = "default_replications")]
    pub replications: u32,

    /// Reproducibility settings.
    #[serde(default)]
    pub reproducibility: ReproducibilityConfig,

    /// Retry policy for failed replications.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Thread layout.
    #[validate(nested)]
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// State file and exports.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Population model of the surrogate backend.
    #[validate(nested)]
    #[serde(default)]
    pub population: PopulationModel,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

const fn default_replications() -> u32 {
    500
}

impl StudyConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - YAML parsing fails
    /// - Validation fails
    pub fn load<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails.
    pub fn from_yaml(yaml: &str) -> SimResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Create a builder for configuration.
    #[must_use]
    pub fn builder() -> StudyConfigBuilder {
        StudyConfigBuilder::default()
    }

    /// Run schema and semantic validation.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate_all(&self) -> SimResult<()> {
        self.validate()?;
        self.validate_semantic()
    }

    /// Validate semantic constraints beyond schema.
    fn validate_semantic(&self) -> SimResult<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(SimError::config(format!(
                "unsupported schema_version '{}' (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        self.factors.check()?;

        if !self.population.is_admissible() {
            return Err(SimError::config(format!(
                "population model is not admissible: loading {} with cross-loading {} \
                 and factor correlation {} leaves no residual variance",
                self.population.loading,
                self.population.cross_loading,
                self.population.factor_correlation
            )));
        }

        let indicators = self.population.indicators();
        if let Some(n) = self.factors.sample_size.iter().find(|&&n| n as usize <= indicators) {
            return Err(SimError::config(format!(
                "sample size {n} must exceed the {indicators} observed indicators"
            )));
        }

        Ok(())
    }

    /// Build the condition grid.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid factor levels.
    pub fn grid(&self) -> SimResult<ConditionGrid> {
        ConditionGrid::build(&self.factors)
    }

    /// Engine settings for this study.
    ///
    /// # Errors
    ///
    /// Returns error if the population model cannot be encoded into the
    /// study context.
    pub fn engine_config(&self) -> SimResult<EngineConfig> {
        Ok(EngineConfig {
            replications: self.replications,
            base_seed: self.reproducibility.seed,
            max_retries: self.retry.max_retries_per_replication,
            parallelism: self.execution.parallelism,
            workers: self.execution.workers,
            resume: self.persistence.resume,
            state_path: self.persistence.state_path.clone(),
            context: self.context()?,
        })
    }

    /// Backend description folded into the state fingerprint.
    fn context(&self) -> SimResult<String> {
        Ok(format!("surrogate-cfa {}", serde_json::to_string(&self.population)?))
    }
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            study: StudyMeta::default(),
            factors: FactorLevels::default(),
            replications: default_replications(),
            reproducibility: ReproducibilityConfig::default(),
            retry: RetryConfig::default(),
            execution: ExecutionConfig::default(),
            persistence: PersistenceConfig::default(),
            population: PopulationModel::default(),
        }
    }
}

/// Configuration builder for programmatic construction.
#[derive(Debug, Default)]
pub struct StudyConfigBuilder {
    seed: Option<u64>,
    replications: Option<u32>,
    factors: Option<FactorLevels>,
    max_retries: Option<u32>,
    parallelism: Option<Parallelism>,
    workers: Option<usize>,
    state_path: Option<PathBuf>,
    resume: bool,
}

impl StudyConfigBuilder {
    /// Set the base seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set replications per condition.
    #[must_use]
    pub const fn replications(mut self, replications: u32) -> Self {
        self.replications = Some(replications);
        self
    }

    /// Set the factor levels.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // FactorLevels owns Vecs
    pub fn factors(mut self, factors: FactorLevels) -> Self {
        self.factors = Some(factors);
        self
    }

    /// Set retries per replication.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the thread layout.
    #[must_use]
    pub const fn parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Persist progress to `path`.
    #[must_use]
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Resume from the state file.
    #[must_use]
    pub const fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> StudyConfig {
        let mut config = StudyConfig::default();

        if let Some(seed) = self.seed {
            config.reproducibility.seed = seed;
        }
        if let Some(replications) = self.replications {
            config.replications = replications;
        }
        if let Some(factors) = self.factors {
            config.factors = factors;
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries_per_replication = max_retries;
        }
        if let Some(parallelism) = self.parallelism {
            config.execution.parallelism = parallelism;
        }
        if self.workers.is_some() {
            config.execution.workers = self.workers;
        }
        if self.state_path.is_some() {
            config.persistence.state_path = self.state_path;
        }
        config.persistence.resume = self.resume;

        config
    }
}

/// Study metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyMeta {
    /// Study name.
    #[serde(default)]
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}

/// Reproducibility settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReproducibilityConfig {
    /// Base seed every condition seed derives from.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

const fn default_seed() -> u64 {
    42
}

impl Default for ReproducibilityConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
        }
    }
}

/// Retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Fresh-draw retries after a recoverable replication failure.
    #[serde(default)]
    pub max_retries_per_replication: u32,
}

/// Thread layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Parallelism mode.
    #[serde(default)]
    pub parallelism: Parallelism,
    /// Worker threads (defaults to available parallelism).
    #[validate(range(min = 1, max = 1024))]
    #[serde(default)]
    pub workers: Option<usize>,
}

/// State file and export locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// Per-condition state file; unset keeps progress in memory.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Replay completed conditions from the state file.
    #[serde(default)]
    pub resume: bool,
    /// CSV export of the results table.
    #[serde(default)]
    pub output_csv: Option<PathBuf>,
    /// JSON export of the results table.
    #[serde(default)]
    pub output_json: Option<PathBuf>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::design::{DataType, ModelType};

    #[test]
    fn test_config_defaults() {
        let config = StudyConfig::default();

        assert_eq!(config.schema_version, "1.0");
        assert_eq!(config.reproducibility.seed, 42);
        assert_eq!(config.replications, 500);
        assert_eq!(config.retry.max_retries_per_replication, 0);
        assert_eq!(config.execution.parallelism, Parallelism::Sequential);
        assert_eq!(config.grid().unwrap().len(), 16);
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StudyConfig::builder()
            .seed(12345)
            .replications(20)
            .max_retries(2)
            .parallelism(Parallelism::ByCondition)
            .workers(3)
            .state_path("out/state.json")
            .resume(true)
            .build();

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.base_seed, 12345);
        assert_eq!(engine.replications, 20);
        assert_eq!(engine.max_retries, 2);
        assert_eq!(engine.parallelism, Parallelism::ByCondition);
        assert_eq!(engine.workers, Some(3));
        assert_eq!(engine.state_path, Some(PathBuf::from("out/state.json")));
        assert!(engine.resume);
        assert!(engine.context.starts_with("surrogate-cfa"));
    }

    #[test]
    fn test_config_yaml_parse() {
        let yaml = r"
study:
  name: smoke
factors:
  sample_size: [100, 200]
  model_type: [true, misspecified]
  data_type: [normal]
replications: 50
reproducibility:
  seed: 7
execution:
  parallelism: by-replication
  workers: 2
persistence:
  state_path: results/state.json
  output_csv: results/summary.csv
";
        let config = StudyConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.study.name, "smoke");
        assert_eq!(config.replications, 50);
        assert_eq!(config.reproducibility.seed, 7);
        assert_eq!(config.execution.parallelism, Parallelism::ByReplication);

        let grid = config.grid().unwrap();
        assert_eq!(grid.len(), 4);
        assert_eq!(grid.get(1).unwrap().model_type, ModelType::Misspecified);
        assert_eq!(grid.get(3).unwrap().data_type, DataType::Normal);
    }

    #[test]
    fn test_partial_factors_use_defaults() {
        let config = StudyConfig::from_yaml("factors:\n  sample_size: [300]\n").unwrap();
        assert_eq!(config.grid().unwrap().len(), 4);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = StudyConfig::from_yaml("replicates: 10\n");
        assert!(matches!(result, Err(SimError::YamlParse(_))));
    }

    #[test]
    fn test_schema_version_checked() {
        let config = StudyConfig::from_yaml("schema_version: \"1.0\"\n").unwrap();
        assert_eq!(config.schema_version, SCHEMA_VERSION);

        let err = StudyConfig::from_yaml("schema_version: \"2.0\"\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unsupported schema_version '2.0'"));
    }

    #[test]
    fn test_zero_replications_rejected() {
        let result = StudyConfig::from_yaml("replications: 0\n");
        assert!(matches!(result, Err(SimError::Validation(_))));
    }

    #[test]
    fn test_empty_factor_rejected() {
        let err = StudyConfig::from_yaml("factors:\n  data_type: []\n").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("data_type"));
    }

    #[test]
    fn test_sample_size_must_exceed_indicators() {
        let err = StudyConfig::from_yaml("factors:\n  sample_size: [6, 100]\n").unwrap_err();
        assert!(err.to_string().contains("sample size 6"));
    }

    #[test]
    fn test_inadmissible_population_rejected() {
        let yaml = r"
population:
  loading: 0.9
  cross_loading: 0.8
  factor_correlation: 0.9
";
        let err = StudyConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("not admissible"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = StudyConfig::from_yaml("execution:\n  workers: 0\n");
        assert!(matches!(result, Err(SimError::Validation(_))));
    }

    #[test]
    fn test_context_tracks_population() {
        let a = StudyConfig::default().engine_config().unwrap();
        let mut changed = StudyConfig::default();
        changed.population.loading = 0.6;
        let b = changed.engine_config().unwrap();
        assert_ne!(a.context, b.context);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.yaml");
        std::fs::write(&path, "replications: 12\n").unwrap();
        assert_eq!(StudyConfig::load(&path).unwrap().replications, 12);
        assert!(StudyConfig::load(dir.path().join("missing.yaml")).is_err());
    }
}
