//! Executor Backends
//!
//! The scheduler talks to an [`Executor`] instead of spawning processes
//! itself. Backends are selected by name through the [`ExecutorRegistry`]:
//!
//! - `local`: runs commands as subprocesses on this machine
//! - `dryrun`: reports success without running anything
//! - `touch`: bumps output timestamps without running commands
//!
//! Tests register their own backends that record what was submitted.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::dag::job::Job;
use crate::dag::storage::Storage;
use crate::error::ExecutorError;
use crate::settings::Settings;

use super::dryrun::DryRunExecutor;
use super::local::LocalExecutor;
use super::touch::TouchExecutor;

/// Identifies one submitted unit within an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle {}", self.0)
    }
}

/// Final result of a submitted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
    Cancelled,
}

/// Snapshot of the work handed to a backend.
///
/// A unit is one job or the members of a group in dependency order. Members
/// run one after another; the first failure fails the unit.
#[derive(Debug, Clone)]
pub struct Submission {
    pub jobs: Vec<Job>,
    /// Starts at 1
    pub attempt: u32,
}

impl Submission {
    pub fn label(&self) -> String {
        self.jobs
            .iter()
            .map(|j| j.label())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// What a backend does with submitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorCapabilities {
    /// Runs commands on this machine
    pub local_exec: bool,
    /// Runs nothing; outputs are not verified and state is not persisted
    pub dryrun_exec: bool,
    /// Only touches outputs
    pub touch_exec: bool,
    /// Jobs do not share this machine's file system
    pub implies_no_shared_fs: bool,
}

/// Interface every backend implements.
///
/// `submit` must not block beyond validating the request. Outcomes are
/// collected through `poll`, which waits at most `wait` for the first one.
pub trait Executor: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ExecutorCapabilities;

    fn submit(&mut self, submission: Submission) -> Result<JobHandle, ExecutorError>;

    fn poll(&mut self, wait: Duration) -> Vec<(JobHandle, Outcome)>;

    /// Best effort. The unit still reports an outcome through `poll`.
    fn cancel(&mut self, handle: JobHandle) -> Result<(), ExecutorError>;

    /// Releases every backend resource. Safe to call more than once.
    fn shutdown(&mut self);
}

/// Everything a backend constructor gets.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub settings: Settings,
    pub storage: Arc<dyn Storage>,
    pub working_dir: PathBuf,
}

type Constructor = Box<dyn Fn(&ExecutorContext) -> Result<Box<dyn Executor>, ExecutorError> + Send + Sync>;

/// Maps backend names to constructors.
pub struct ExecutorRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with `local`, `dryrun` and `touch`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("local", |ctx| Ok(Box::new(LocalExecutor::new(ctx)) as Box<dyn Executor>));
        registry.register("dryrun", |ctx| Ok(Box::new(DryRunExecutor::new(ctx)) as Box<dyn Executor>));
        registry.register("touch", |ctx| Ok(Box::new(TouchExecutor::new(ctx)) as Box<dyn Executor>));
        registry
    }

    /// Adds or replaces a backend.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&ExecutorContext) -> Result<Box<dyn Executor>, ExecutorError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Box::new(constructor));
    }

    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn create(&self, name: &str, ctx: &ExecutorContext) -> Result<Box<dyn Executor>, ExecutorError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownBackend {
                name: name.to_string(),
                available: self.names(),
            })?;
        constructor(ctx)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("backends", &self.names())
            .finish()
    }
}
