//! Run Report
//!
//! Final state of every job after a run, plus the overall status the CLI
//! turns into an exit code.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use colored::Colorize;
use serde::Serialize;

use crate::dag::graph::JobGraph;
use crate::dag::job::{JobId, JobState, NeedRunReason};

/// Outcome of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every job was already up to date
    NothingToDo,
    Success,
    /// At least one job failed or was skipped
    CompletedWithFailures,
}

impl RunStatus {
    /// Exit code of the command line tool.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::CompletedWithFailures => 1,
            Self::NothingToDo => 3,
        }
    }
}

/// Final record of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: JobId,
    pub rule: String,
    pub label: String,
    pub wildcards: BTreeMap<String, String>,
    pub state: JobState,
    /// Dispatches, including retries. Zero if the job never ran.
    pub attempts: u32,
    pub error: Option<String>,
    pub reasons: Vec<NeedRunReason>,
    /// Completed without being dispatched
    pub short_circuited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub jobs: Vec<JobReport>,
    pub graph_version: u64,
    #[serde(skip)]
    pub elapsed: Duration,
    /// Unit dispatches handed to the executor
    pub dispatched: usize,
    pub aborted: bool,
}

impl RunReport {
    /// Builds the report from the final graph and per-job bookkeeping.
    pub fn from_run(
        graph: &JobGraph,
        states: &[JobState],
        attempts: &[u32],
        errors: &BTreeMap<JobId, String>,
        elapsed: Duration,
        dispatched: usize,
        aborted: bool,
    ) -> Self {
        let jobs: Vec<JobReport> = graph
            .jobs()
            .iter()
            .map(|job| {
                let state = states.get(job.id.0).copied().unwrap_or(JobState::Pending);
                let attempts = attempts.get(job.id.0).copied().unwrap_or(0);
                JobReport {
                    id: job.id,
                    rule: job.rule.clone(),
                    label: job.label(),
                    wildcards: job.wildcards.clone(),
                    state,
                    attempts,
                    error: errors.get(&job.id).cloned(),
                    reasons: job.reasons.clone(),
                    short_circuited: state == JobState::Completed && !job.needrun,
                }
            })
            .collect();

        let failed = jobs
            .iter()
            .any(|j| matches!(j.state, JobState::Failed | JobState::Skipped));
        let status = if failed || aborted {
            RunStatus::CompletedWithFailures
        } else if jobs.iter().all(|j| j.short_circuited) {
            RunStatus::NothingToDo
        } else {
            RunStatus::Success
        };

        Self {
            status,
            jobs,
            graph_version: graph.version,
            elapsed,
            dispatched,
            aborted,
        }
    }

    pub fn job(&self, id: JobId) -> Option<&JobReport> {
        self.jobs.get(id.0)
    }

    /// Jobs in `state`.
    pub fn in_state(&self, state: JobState) -> Vec<&JobReport> {
        self.jobs.iter().filter(|j| j.state == state).collect()
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.status != RunStatus::CompletedWithFailures
    }

    /// Terminal summary listing every failed and skipped job.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out);

        let headline = match self.status {
            RunStatus::NothingToDo => "Nothing to be done".green().bold(),
            RunStatus::Success => "Workflow completed successfully".green().bold(),
            RunStatus::CompletedWithFailures if self.aborted => "Workflow aborted".red().bold(),
            RunStatus::CompletedWithFailures => "Workflow completed with failures".red().bold(),
        };
        let _ = writeln!(out, "{}", headline);
        let _ = writeln!(
            out,
            "  {} completed ({} up to date), {} failed, {} skipped",
            self.count(JobState::Completed),
            self.jobs.iter().filter(|j| j.short_circuited).count(),
            self.count(JobState::Failed),
            self.count(JobState::Skipped)
        );
        let _ = writeln!(out, "Total execution time: {:.2?}", self.elapsed);

        for job in self.in_state(JobState::Failed) {
            let _ = writeln!(
                out,
                "  {} {} after {} attempt(s): {}",
                "FAILED".red(),
                job.label,
                job.attempts,
                job.error.as_deref().unwrap_or("unknown error")
            );
        }
        for job in self.in_state(JobState::Skipped) {
            let _ = writeln!(
                out,
                "  {} {}: {}",
                "SKIPPED".yellow(),
                job.label,
                job.error.as_deref().unwrap_or("upstream job failed")
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::job;

    fn graph(n: usize) -> JobGraph {
        let mut graph = JobGraph::new();
        for i in 0..n {
            graph.add_job(job(0, &format!("r{}", i)));
        }
        graph
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(RunStatus::CompletedWithFailures.exit_code(), 1);
        assert_eq!(RunStatus::NothingToDo.exit_code(), 3);
    }

    #[test]
    fn test_failures_in_summary() {
        let graph = graph(3);
        let mut errors = BTreeMap::new();
        errors.insert(JobId(1), "exit code 2".to_string());
        errors.insert(JobId(2), "upstream job r1 failed".to_string());
        let report = RunReport::from_run(
            &graph,
            &[JobState::Completed, JobState::Failed, JobState::Skipped],
            &[1, 3, 0],
            &errors,
            Duration::from_secs(1),
            4,
            false,
        );
        assert_eq!(report.status, RunStatus::CompletedWithFailures);
        let summary = report.summary();
        assert!(summary.contains("r1 after 3 attempt(s): exit code 2"));
        assert!(summary.contains("r2: upstream job r1 failed"));
    }

    #[test]
    fn test_nothing_to_do() {
        let mut graph = graph(2);
        for id in [JobId(0), JobId(1)] {
            graph.job_mut(id).needrun = false;
        }
        let report = RunReport::from_run(
            &graph,
            &[JobState::Completed, JobState::Completed],
            &[0, 0],
            &BTreeMap::new(),
            Duration::ZERO,
            0,
            false,
        );
        assert_eq!(report.status, RunStatus::NothingToDo);
        assert!(report.jobs.iter().all(|j| j.short_circuited));
    }
}
