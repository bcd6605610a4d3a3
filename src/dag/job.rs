//! Jobs
//!
//! A job is one rule applied to one wildcard binding. Jobs are identified by
//! (rule, binding); requesting the same pair twice yields the same job.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::format_binding;
use crate::execution::command::CommandTemplate;
use crate::workflow::model::CORES_RESOURCE;
use crate::workflow::wildcards::{Pattern, Wildcards};

/// Index of a job in its graph. Stable across graph versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a job during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for dependencies
    Pending,
    /// Dependencies done, waiting for resources
    Ready,
    /// Dispatched to the executor
    Running,
    Completed,
    /// Retries exhausted
    Failed,
    /// Never run because an upstream job failed or the run was aborted
    Skipped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a job has to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "path", rename_all = "snake_case")]
pub enum NeedRunReason {
    Forced,
    MissingOutput(String),
    /// A previous run started the job but never finished it
    IncompleteOutput(String),
    UpstreamUpdated,
    NewerInput(String),
    ChangedInput(String),
    /// Jobs with a command but no outputs always run
    NoOutputs,
}

impl fmt::Display for NeedRunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced"),
            Self::MissingOutput(p) => write!(f, "missing output {}", p),
            Self::IncompleteOutput(p) => write!(f, "incomplete output {}", p),
            Self::UpstreamUpdated => write!(f, "updated input from upstream job"),
            Self::NewerInput(p) => write!(f, "input {} is newer than outputs", p),
            Self::ChangedInput(p) => write!(f, "content of input {} changed", p),
            Self::NoOutputs => write!(f, "no outputs"),
        }
    }
}

/// A checkpoint input waiting for its checkpoint job to finish.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredInput {
    pub checkpoint: JobId,
    /// Glob with the job's own wildcards already substituted
    pub glob: Pattern,
    /// Template producing the concrete input for each discovered binding
    pub expand: Pattern,
}

/// A concrete unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub rule: String,
    pub wildcards: Wildcards,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub logs: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub threads: u64,

    /// Resolved demand per resource, including `_cores`
    pub resources: BTreeMap<String, u64>,

    pub priority: i64,
    pub group: Option<String>,
    pub checkpoint: bool,
    pub localrule: bool,
    pub command: Option<CommandTemplate>,

    /// Per-rule retry override
    pub retries: Option<u32>,

    #[serde(skip)]
    pub deferred: Vec<DeferredInput>,

    /// Result of the freshness analysis
    pub needrun: bool,
    pub reasons: Vec<NeedRunReason>,
}

impl Job {
    /// Human readable identity, e.g. `align[sample=a]`.
    pub fn label(&self) -> String {
        if self.wildcards.is_empty() {
            self.rule.clone()
        } else {
            format!("{}[{}]", self.rule, format_binding(&self.wildcards))
        }
    }

    /// Demand for `resource`, zero if not requested.
    pub fn demand(&self, resource: &str) -> u64 {
        self.resources.get(resource).copied().unwrap_or(0)
    }

    pub fn cores(&self) -> u64 {
        self.demand(CORES_RESOURCE)
    }

    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }

    /// True while checkpoint inputs are still unresolved.
    pub fn is_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.label())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal job for unit tests.
    pub(crate) fn job(id: usize, rule: &str) -> Job {
        let mut resources = BTreeMap::new();
        resources.insert(CORES_RESOURCE.to_string(), 1);
        Job {
            id: JobId(id),
            rule: rule.to_string(),
            wildcards: Wildcards::new(),
            inputs: Vec::new(),
            outputs: vec![format!("{}.out", rule)],
            logs: Vec::new(),
            params: BTreeMap::new(),
            threads: 1,
            resources,
            priority: 0,
            group: None,
            checkpoint: false,
            localrule: false,
            command: Some(CommandTemplate::Shell("true".to_string())),
            retries: None,
            deferred: Vec::new(),
            needrun: true,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn test_label() {
        let mut j = job(0, "align");
        assert_eq!(j.label(), "align");
        j.wildcards.insert("sample".into(), "a".into());
        assert_eq!(j.label(), "align[sample=a]");
        assert_eq!(j.to_string(), "#0 align[sample=a]");
    }

    #[test]
    fn test_demand() {
        let j = job(0, "x");
        assert_eq!(j.cores(), 1);
        assert_eq!(j.demand("mem_mb"), 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Skipped.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert_eq!(JobState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(
            NeedRunReason::MissingOutput("a.txt".into()).to_string(),
            "missing output a.txt"
        );
    }
}
