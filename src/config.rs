//! Worker-side pipeline options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::SourceError;

/// Options handed to every Source call.
///
/// Sources may read these (e.g. to size their splits) but must not
/// rely on any field beyond what is documented here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Number of workers expected to run this pipeline.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Initial splits requested per worker when fanning out an
    /// unbounded source.
    #[serde(default = "default_initial_splits_per_worker")]
    pub initial_splits_per_worker: usize,

    /// Bundle size used when a split request does not carry one.
    #[serde(default)]
    pub desired_bundle_size_bytes: Option<u64>,

    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Path of a SQLite database used to persist checkpoint marks.
    /// Checkpoints are kept in memory when unset.
    #[serde(default)]
    pub checkpoint_db: Option<PathBuf>,
}

fn default_num_workers() -> usize {
    1
}

fn default_initial_splits_per_worker() -> usize {
    2
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            initial_splits_per_worker: default_initial_splits_per_worker(),
            desired_bundle_size_bytes: None,
            log_level: None,
            checkpoint_db: None,
        }
    }
}

impl PipelineOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|err| SourceError::Config(format!("can't parse pipeline options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Override fields from `FLOWSOURCE_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self, SourceError> {
        if let Ok(workers) = std::env::var("FLOWSOURCE_NUM_WORKERS") {
            self.num_workers = workers.parse().map_err(|err| {
                SourceError::Config(format!("FLOWSOURCE_NUM_WORKERS={workers:?}: {err}"))
            })?;
        }
        if let Ok(level) = std::env::var("FLOWSOURCE_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Ok(path) = std::env::var("FLOWSOURCE_CHECKPOINT_DB") {
            self.checkpoint_db = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.num_workers == 0 {
            return Err(SourceError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.initial_splits_per_worker == 0 {
            return Err(SourceError::Config(
                "initial_splits_per_worker must be at least 1".to_string(),
            ));
        }
        if self.desired_bundle_size_bytes == Some(0) {
            return Err(SourceError::Config(
                "desired_bundle_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Fan-out hint for [`crate::bundles::generate_initial_splits`].
    pub fn desired_num_splits(&self) -> usize {
        (self.num_workers * self.initial_splits_per_worker).max(1)
    }
}
