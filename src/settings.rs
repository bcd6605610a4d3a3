//! Run Settings
//!
//! Everything that shapes a run besides the rules themselves. Settings come
//! from three layers, later ones winning:
//!
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A YAML settings file (`--config FILE`)
//! 3. Command line flags
//!
//! # Example YAML Format
//!
//! ```yaml
//! executor: local
//! resources:
//!   cores: 8
//!   max_jobs: 4
//!   limits:
//!     mem_mb: 16000
//!     gpu: 1
//!   default_resources:
//!     mem_mb: 500
//! scheduling:
//!   dispatch_order: most_downstream
//!   ambiguity: error
//! execution:
//!   retries: 2
//!   freshness: checksum
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::workflow::model::ResourceValue;

/// Upper bound on retries per job.
pub const MAX_RETRIES: u32 = 100;

/// Capacity settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ResourceSettings {
    /// Cores available to jobs. Required by the local executor.
    pub cores: Option<usize>,

    /// Maximum number of concurrently dispatched units
    pub max_jobs: Option<usize>,

    /// Capacity of named resources. Undeclared resources are unlimited.
    pub limits: BTreeMap<String, u64>,

    /// Resources applied to rules that do not declare them
    pub default_resources: BTreeMap<String, ResourceValue>,
}

/// Secondary ordering among ready jobs of equal priority.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    /// Jobs that unblock more downstream work first
    #[default]
    MostDownstream,
    /// Jobs closer to the targets first
    FewestDownstream,
    /// Graph insertion order
    Declaration,
}

/// How to pick a producer when several rules match a path.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Only `ruleorder` breaks ties; anything else is an error
    #[default]
    Error,
    /// Fall back to rule file order after `ruleorder`
    RuleOrder,
    /// Fall back to rule priority after `ruleorder`
    Priority,
}

/// How a group unit's demand is derived from its members.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupResources {
    /// Members run one after another; the unit needs the largest demand
    #[default]
    Max,
    /// The unit reserves the sum of all member demands
    Sum,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SchedulingSettings {
    pub dispatch_order: DispatchOrder,
    pub ambiguity: AmbiguityPolicy,
    pub group_resources: GroupResources,
}

/// How to decide whether existing outputs are up to date.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Outputs older than any input are stale
    #[default]
    Mtime,
    /// Inputs whose content changed since the last run make outputs stale
    Checksum,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Extra attempts after the first failure
    pub retries: u32,

    /// Cancel everything after the first permanent failure
    pub halt_on_failure: bool,

    pub freshness: Freshness,

    /// Time to wait for outputs to appear after a job succeeded
    pub latency_wait_ms: u64,

    /// Targets whose producing jobs always run
    pub force_targets: Vec<String>,

    /// Every job runs
    pub force_all: bool,

    /// Directory relative paths are resolved against
    pub working_dir: Option<PathBuf>,

    /// While this file exists, no new jobs are dispatched
    pub pause_flag: Option<PathBuf>,

    /// Enforce memory limits with `ulimit -v` in the local executor
    pub enforce_memory: bool,

    /// How long the scheduler blocks waiting for executor events
    pub poll_interval_ms: u64,

    /// Depth at which target resolution is considered unbounded
    pub max_resolution_depth: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            retries: 0,
            halt_on_failure: false,
            freshness: Freshness::Mtime,
            latency_wait_ms: 0,
            force_targets: Vec::new(),
            force_all: false,
            working_dir: None,
            pause_flag: None,
            enforce_memory: false,
            poll_interval_ms: 100,
            max_resolution_depth: 1000,
        }
    }
}

/// All settings for a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub resources: ResourceSettings,
    pub scheduling: SchedulingSettings,
    pub execution: ExecutionSettings,

    /// Name of the executor backend
    pub executor: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resources: ResourceSettings::default(),
            scheduling: SchedulingSettings::default(),
            execution: ExecutionSettings::default(),
            executor: "local".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading settings from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_yaml::from_str(&content)?;
        debug!("Settings: {:?}", settings);
        Ok(settings)
    }

    /// Checks the settings and fills in defaults that depend on the executor.
    ///
    /// `host_cores` is used when cores are not given for executors that
    /// never run commands.
    pub fn validate(&mut self, host_cores: usize) -> std::result::Result<(), ConfigError> {
        match self.resources.cores {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "resources.cores".to_string(),
                    reason: "must be at least 1".to_string(),
                })
            }
            Some(_) => {}
            None if self.executor == "local" => return Err(ConfigError::CoresRequired),
            None => {
                debug!(
                    "No cores given for '{}' executor, using {} host cores",
                    self.executor, host_cores
                );
                self.resources.cores = Some(host_cores.max(1));
            }
        }

        if self.resources.max_jobs == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "resources.max_jobs".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.execution.retries > MAX_RETRIES {
            return Err(ConfigError::InvalidValue {
                key: "execution.retries".to_string(),
                reason: format!("must be at most {}", MAX_RETRIES),
            });
        }

        if self.execution.max_resolution_depth == 0 {
            return Err(ConfigError::InvalidValue {
                key: "execution.max_resolution_depth".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Cores after validation.
    pub fn cores(&self) -> usize {
        self.resources.cores.unwrap_or(1)
    }

    /// Resolves `path` against the working directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.execution.working_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Parses `cores` given as a number or `all`.
    pub fn parse_cores(value: &str, host_cores: usize) -> std::result::Result<usize, ConfigError> {
        if value == "all" {
            return Ok(host_cores.max(1));
        }
        match value.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(ConfigError::CoresRequired),
        }
    }

    /// Parses a `NAME=AMOUNT` resource limit.
    pub fn parse_limit(value: &str) -> std::result::Result<(String, u64), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key: "resource".to_string(),
            reason: format!("'{}': {}", value, reason),
        };

        let (name, amount) = value.split_once('=').ok_or_else(|| invalid("expected NAME=AMOUNT"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("empty resource name"));
        }
        let amount = amount
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid("amount must be a non-negative integer"))?;
        Ok((name.to_string(), amount))
    }
}
