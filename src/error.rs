//! Error Types
//!
//! Every failure the engine can report, grouped by the phase that raises it:
//!
//! - [`PatternError`]: wildcard pattern parsing, matching and resolution
//! - [`GraphError`]: job graph construction (fatal before any execution)
//! - [`JobError`]: per-job execution outcomes (recoverable through retries)
//! - [`ExecutorError`]: backend faults (submission, polling, cancellation)
//! - [`ConfigError`]: settings validation
//!
//! [`Error`] wraps all of them for the public API.

use std::collections::BTreeMap;

use thiserror::Error;

/// Renders a wildcard binding as `name=value, ...` for error messages.
pub(crate) fn format_binding(binding: &BTreeMap<String, String>) -> String {
    if binding.is_empty() {
        return "-".to_string();
    }
    binding
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from wildcard patterns.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("path '{path}' does not match pattern '{pattern}'")]
    NoMatch { pattern: String, path: String },

    #[error("rule '{rule}': wildcard '{{{wildcard}}}' in '{pattern}' has no binding")]
    AmbiguousWildcards {
        rule: String,
        wildcard: String,
        pattern: String,
    },
}

/// Errors raised while deriving the job graph.
///
/// All of these abort the run before anything is dispatched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("missing input '{path}'{}: no rule produces it and it does not exist", required_by_suffix(.required_by))]
    MissingProducer {
        path: String,
        required_by: Option<String>,
    },

    #[error("ambiguous rules for '{path}': {} could all produce it", .candidates.join(", "))]
    AmbiguousRule { path: String, candidates: Vec<String> },

    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("rule '{rule}' ({}) requests {requested} of '{resource}' but only {capacity} is available", format_binding(.wildcards))]
    ResourceUnsatisfiable {
        rule: String,
        wildcards: BTreeMap<String, String>,
        resource: String,
        requested: u64,
        capacity: u64,
    },

    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("rule '{rule}': cannot evaluate resource '{resource}': {reason}")]
    ResourceExpression {
        rule: String,
        resource: String,
        reason: String,
    },

    #[error("storage error on '{path}': {reason}")]
    Storage { path: String, reason: String },

    #[error(transparent)]
    Pattern(#[from] PatternError),
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(job) => format!(" (required by {})", job),
        None => String::new(),
    }
}

/// Why a single job did not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("execution failed: {reason}")]
    ExecutionFailure { reason: String },

    #[error("job reported success but outputs are missing: {}", .paths.join(", "))]
    OutputNotProduced { paths: Vec<String> },

    #[error("cancelled")]
    Cancelled,

    #[error("executor fault: {0}")]
    Executor(String),

    #[error("unit requests {requested} of '{resource}' but only {capacity} is available")]
    ResourceUnsatisfiable {
        resource: String,
        requested: u64,
        capacity: u64,
    },
}

impl JobError {
    /// Cancellation and unsatisfiable demands are terminal; everything else
    /// may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::ResourceUnsatisfiable { .. })
    }
}

/// Faults inside an executor backend.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("unknown executor '{name}' (available: {})", .available.join(", "))]
    UnknownBackend { name: String, available: Vec<String> },

    #[error("unknown job handle {0}")]
    UnknownHandle(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("cores have to be specified for local execution (use --cores N with N >= 1, or 'all')")]
    CoresRequired,

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("{0}")]
    Pattern(#[from] PatternError),

    #[error("{0}")]
    Executor(#[from] ExecutorError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("run aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_producer_message() {
        let err = GraphError::MissingProducer {
            path: "x.txt".to_string(),
            required_by: Some("align[sample=a]".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "missing input 'x.txt' (required by align[sample=a]): no rule produces it and it does not exist"
        );
    }

    #[test]
    fn test_cycle_message() {
        let err = GraphError::CyclicDependency {
            cycle: vec!["a.txt".into(), "b.txt".into(), "a.txt".into()],
        };
        assert!(err.to_string().contains("a.txt -> b.txt -> a.txt"));
    }

    #[test]
    fn test_resource_message_names_binding() {
        let mut wildcards = BTreeMap::new();
        wildcards.insert("sample".to_string(), "s1".to_string());
        let err = GraphError::ResourceUnsatisfiable {
            rule: "sort".into(),
            wildcards,
            resource: "mem_mb".into(),
            requested: 64000,
            capacity: 8000,
        };
        let msg = err.to_string();
        assert!(msg.contains("sample=s1"));
        assert!(msg.contains("64000"));
    }

    #[test]
    fn test_job_error_retryable() {
        assert!(JobError::ExecutionFailure { reason: "exit 1".into() }.is_retryable());
        assert!(JobError::OutputNotProduced { paths: vec![] }.is_retryable());
        assert!(!JobError::Cancelled.is_retryable());
        assert!(!JobError::ResourceUnsatisfiable {
            resource: "_cores".into(),
            requested: 4,
            capacity: 2
        }
        .is_retryable());
    }
}
