use crate::core::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default prefix under which plan states are stored in a key-value table.
pub const DEFAULT_STATE_KEY_PREFIX: &str = "upgrader.state+";

/// Settings for [`BatchTransformer`](crate::batch::BatchTransformer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of records per batched write.
    pub batch_size: usize,

    /// Upper bound of concurrently transformed records when the store allows it.
    pub max_workers: usize,

    /// Never fan out, even on stores that tolerate concurrent writers.
    pub force_sequential: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_workers: 4,
            force_sequential: false,
        }
    }
}

impl BatchConfig {
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn force_sequential(mut self, force_sequential: bool) -> Self {
        self.force_sequential = force_sequential;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrationError::Configuration(
                "batch_size must be >= 1".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(MigrationError::Configuration(
                "max_workers must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Migration engine configuration
///
/// Loadable from JSON; every field has a default so partial documents work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Persist the reached state after every committed step instead of once
    /// at the end of the run, so a crash resumes from the last committed step.
    pub commit_each_step: bool,

    /// Per-step timeout; an expired step is rolled back and reported as failed.
    pub step_timeout_ms: Option<u64>,

    /// Key prefix used by the key-value state store.
    pub state_key_prefix: String,

    pub batch: BatchConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            commit_each_step: false,
            step_timeout_ms: None,
            state_key_prefix: DEFAULT_STATE_KEY_PREFIX.to_string(),
            batch: BatchConfig::default(),
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-step state persistence
    pub fn commit_each_step(mut self, enabled: bool) -> Self {
        self.commit_each_step = enabled;
        self
    }

    /// Set step timeout
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set key-value state prefix
    pub fn state_key_prefix(mut self, prefix: &str) -> Self {
        self.state_key_prefix = prefix.to_string();
        self
    }

    /// Set batch settings
    pub fn batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn step_timeout_duration(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_ms == Some(0) {
            return Err(MigrationError::Configuration(
                "step_timeout_ms must be >= 1 when set".to_string(),
            ));
        }
        self.batch.validate()
    }

    /// Parse and validate a JSON document.
    ///
    /// # Examples
    ///
    /// ```
    /// # use rustmigrator::MigrationConfig;
    /// let config = MigrationConfig::from_json_str(
    ///     r#"{ "commit_each_step": true, "batch": { "batch_size": 250 } }"#
    /// ).unwrap();
    /// assert!(config.commit_each_step);
    /// assert_eq!(config.batch.batch_size, 250);
    /// assert_eq!(config.batch.max_workers, 4);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            MigrationError::Io(format!("Failed to read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&json)
    }
}
