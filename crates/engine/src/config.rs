//! Engine configuration.
//!
//! Every section has defaults, so a JSON document only needs the settings it changes:
//!
//! ```json
//! {
//!   "workers": 4,
//!   "error_policy": "route",
//!   "commit": { "max_batch_events": 10000 },
//!   "persistence": { "snapshot_interval": 100, "recovery": { "at": 42 } }
//! }
//! ```

use crate::logging::LoggingConfig;
use ripple_core::{Error, Result, Timestamp};
use ripple_incremental::{ErrorPolicy, EvaluatorConfig, MultiplicityPolicy};
use ripple_storage::RecoveryMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// When commits are cut.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Cut a commit automatically once this many pushed events are pending.
    /// Input read by a `Runner` is cut at reader commit markers instead.
    pub max_batch_events: Option<usize>,
}

/// Snapshot and recovery settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Snapshot every this many commits; 0 snapshots only at graceful shutdown.
    pub snapshot_interval: u64,
    /// Number of snapshots kept.
    pub retained_snapshots: usize,
    /// Which snapshot to resume from on startup.
    pub recovery: RecoveryMode,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 0,
            retained_snapshots: 2,
            recovery: RecoveryMode::Latest,
        }
    }
}

/// Configuration of one computation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub error_policy: ErrorPolicy,
    pub multiplicity: MultiplicityPolicy,
    pub iteration_limit: u32,
    pub commit: CommitConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let evaluator = EvaluatorConfig::default();
        Self {
            workers: evaluator.workers,
            error_policy: evaluator.error_policy,
            multiplicity: evaluator.multiplicity,
            iteration_limit: evaluator.iteration_limit,
            commit: CommitConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.iteration_limit == 0 {
            return Err(Error::config("iteration_limit must be at least 1"));
        }
        if self.commit.max_batch_events == Some(0) {
            return Err(Error::config("commit.max_batch_events must be at least 1"));
        }
        if self.persistence.retained_snapshots == 0 {
            return Err(Error::config("persistence.retained_snapshots must be at least 1"));
        }
        Ok(())
    }

    /// Settings handed to the evaluator.
    pub fn evaluator(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            workers: self.workers,
            error_policy: self.error_policy,
            multiplicity: self.multiplicity,
            iteration_limit: self.iteration_limit,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_multiplicity(mut self, policy: MultiplicityPolicy) -> Self {
        self.multiplicity = policy;
        self
    }

    pub fn with_iteration_limit(mut self, limit: u32) -> Self {
        self.iteration_limit = limit;
        self
    }

    pub fn with_max_batch_events(mut self, events: usize) -> Self {
        self.commit.max_batch_events = Some(events);
        self
    }

    pub fn with_snapshot_interval(mut self, commits: u64) -> Self {
        self.persistence.snapshot_interval = commits;
        self
    }

    pub fn with_retained_snapshots(mut self, count: usize) -> Self {
        self.persistence.retained_snapshots = count;
        self
    }

    pub fn with_recovery(mut self, mode: RecoveryMode) -> Self {
        self.persistence.recovery = mode;
        self
    }

    /// Resumes from the snapshot taken at `time`.
    pub fn with_recovery_at(self, time: Timestamp) -> Self {
        self.with_recovery(RecoveryMode::At(time))
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }
}
