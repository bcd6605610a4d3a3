//! Freshness Analysis
//!
//! Decides which jobs have to run. A job needs to run when:
//!
//! - it is forced (`force_all`, or a target listed in `force_targets`)
//! - one of its outputs is missing
//! - one of its outputs is marked incomplete by a previous run
//! - an upstream job runs
//! - its outputs are stale according to the [`Freshness`] policy
//!
//! Jobs with a command but no outputs always run. Jobs with neither only
//! run when something upstream does.

use std::collections::BTreeSet;
use std::time::SystemTime;

use log::debug;

use crate::settings::{ExecutionSettings, Freshness};
use crate::workflow::state::RunState;

use super::graph::JobGraph;
use super::job::{Job, JobId, NeedRunReason};
use super::storage::Storage;

/// Runs the analysis over `only` (or every job), in dependency order.
///
/// Jobs outside `only` keep their current verdict and are consulted as
/// upstream jobs. Returns the number of analysed jobs that need to run.
pub fn analyse(
    graph: &mut JobGraph,
    storage: &dyn Storage,
    state: &RunState,
    settings: &ExecutionSettings,
    only: Option<&BTreeSet<JobId>>,
) -> usize {
    let order = match graph.topological_order() {
        Some(order) => order,
        None => graph.ids().collect(),
    };

    let mut count = 0;
    for id in order {
        if only.is_some_and(|set| !set.contains(&id)) {
            continue;
        }

        let upstream = graph
            .dependencies(id)
            .iter()
            .any(|&dep| graph.job(dep).needrun);
        let reasons = reasons_for(graph.job(id), upstream, storage, state, settings);

        let job = graph.job_mut(id);
        job.needrun = !reasons.is_empty();
        if job.needrun {
            count += 1;
            debug!("{} needs to run: {}", job.label(), describe(&reasons));
        }
        job.reasons = reasons;
    }
    count
}

/// Joins reasons for display.
pub fn describe(reasons: &[NeedRunReason]) -> String {
    reasons
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn reasons_for(
    job: &Job,
    upstream: bool,
    storage: &dyn Storage,
    state: &RunState,
    settings: &ExecutionSettings,
) -> Vec<NeedRunReason> {
    let mut reasons = Vec::new();

    let forced = settings.force_all
        || settings.force_targets.iter().any(|t| t == &job.rule || job.outputs.contains(t));
    if forced {
        reasons.push(NeedRunReason::Forced);
    }

    if job.outputs.is_empty() && job.has_command() {
        reasons.push(NeedRunReason::NoOutputs);
    }

    for output in &job.outputs {
        if !storage.exists(output) {
            reasons.push(NeedRunReason::MissingOutput(output.clone()));
        } else if state.is_incomplete(output) {
            reasons.push(NeedRunReason::IncompleteOutput(output.clone()));
        }
    }

    if upstream {
        reasons.push(NeedRunReason::UpstreamUpdated);
    }

    // Staleness only matters when nothing else forces the job already.
    if reasons.is_empty() && !job.outputs.is_empty() {
        if let Some(reason) = stale_input(job, storage, state, settings.freshness) {
            reasons.push(reason);
        }
    }

    reasons
}

fn stale_input(job: &Job, storage: &dyn Storage, state: &RunState, freshness: Freshness) -> Option<NeedRunReason> {
    if freshness == Freshness::Checksum {
        let record = job.outputs.first().and_then(|o| state.record(o));
        if let Some(record) = record.filter(|r| !r.input_checksums.is_empty()) {
            for input in &job.inputs {
                let changed = match (record.input_checksums.get(input), storage.content_hash(input)) {
                    (Some(old), Ok(current)) => *old != current,
                    _ => true,
                };
                if changed {
                    return Some(NeedRunReason::ChangedInput(input.clone()));
                }
            }
            return None;
        }
    }

    let oldest_output: SystemTime = job.outputs.iter().filter_map(|o| storage.mtime(o)).min()?;
    job.inputs
        .iter()
        .find(|input| storage.mtime(input).is_some_and(|t| t > oldest_output))
        .map(|input| NeedRunReason::NewerInput(input.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::dag::job::tests::job;
    use crate::dag::storage::MemoryStorage;

    fn two_step() -> JobGraph {
        let mut graph = JobGraph::new();
        let mut a = job(0, "a");
        a.inputs = vec!["in.txt".into()];
        let mut b = job(0, "b");
        b.inputs = vec!["a.out".into()];
        let a = graph.add_job(a);
        let b = graph.add_job(b);
        graph.add_edge(a, b);
        graph
    }

    fn run(graph: &mut JobGraph, storage: &MemoryStorage, state: &RunState, settings: &ExecutionSettings) -> usize {
        analyse(graph, storage, state, settings, None)
    }

    #[test]
    fn test_missing_outputs() {
        let storage = MemoryStorage::new();
        storage.add_file("in.txt", "");
        let mut graph = two_step();
        let n = run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default());
        assert_eq!(n, 2);
        assert_eq!(graph.job(JobId(0)).reasons, vec![NeedRunReason::MissingOutput("a.out".into())]);
        assert!(graph.job(JobId(1)).reasons.contains(&NeedRunReason::UpstreamUpdated));
    }

    #[test]
    fn test_up_to_date() {
        let storage = MemoryStorage::new();
        storage.add_file("in.txt", "");
        storage.add_file("a.out", "");
        storage.add_file("b.out", "");
        let mut graph = two_step();
        let n = run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default());
        assert_eq!(n, 0);
        assert!(!graph.job(JobId(1)).needrun);
    }

    #[test]
    fn test_newer_input() {
        let storage = MemoryStorage::new();
        storage.add_file("a.out", "");
        storage.add_file("b.out", "");
        storage.add_file("in.txt", "");
        let mut graph = two_step();
        run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default());
        assert_eq!(graph.job(JobId(0)).reasons, vec![NeedRunReason::NewerInput("in.txt".into())]);
        assert!(graph.job(JobId(1)).needrun);
    }

    #[test]
    fn test_incomplete_marker() {
        let storage = MemoryStorage::new();
        storage.add_file("in.txt", "");
        storage.add_file("a.out", "");
        storage.add_file("b.out", "");
        let mut state = RunState::in_memory("t");
        state.mark_incomplete(&["b.out".to_string()]);
        let mut graph = two_step();
        assert_eq!(run(&mut graph, &storage, &state, &ExecutionSettings::default()), 1);
        assert_eq!(
            graph.job(JobId(1)).reasons,
            vec![NeedRunReason::IncompleteOutput("b.out".into())]
        );
    }

    #[test]
    fn test_forced() {
        let storage = MemoryStorage::new();
        storage.add_file("in.txt", "");
        storage.add_file("a.out", "");
        storage.add_file("b.out", "");
        let settings = ExecutionSettings {
            force_targets: vec!["b.out".into()],
            ..ExecutionSettings::default()
        };
        let mut graph = two_step();
        assert_eq!(run(&mut graph, &storage, &RunState::in_memory("t"), &settings), 1);
        assert_eq!(graph.job(JobId(1)).reasons, vec![NeedRunReason::Forced]);
    }

    #[test]
    fn test_checksum_policy() {
        let storage = MemoryStorage::new();
        storage.add_file("a.out", "");
        storage.add_file("b.out", "");
        // Input rewritten with identical content after the outputs.
        storage.add_file("in.txt", "same");

        let mut checksums = BTreeMap::new();
        checksums.insert("in.txt".to_string(), blake3::hash(b"same").to_hex().to_string());
        let mut state = RunState::in_memory("t");
        state.mark_complete("a", &["a.out".to_string()], checksums);

        let settings = ExecutionSettings {
            freshness: Freshness::Checksum,
            ..ExecutionSettings::default()
        };
        let mut graph = two_step();
        assert_eq!(run(&mut graph, &storage, &state, &settings), 0);

        // Changed content.
        storage.add_file("in.txt", "different");
        let mut graph = two_step();
        run(&mut graph, &storage, &state, &settings);
        assert_eq!(graph.job(JobId(0)).reasons, vec![NeedRunReason::ChangedInput("in.txt".into())]);
    }

    #[test]
    fn test_aggregate_job_without_command() {
        let storage = MemoryStorage::new();
        storage.add_file("in.txt", "");
        storage.add_file("a.out", "");
        let mut graph = JobGraph::new();
        let mut a = job(0, "a");
        a.inputs = vec!["in.txt".into()];
        let mut all = job(0, "all");
        all.outputs.clear();
        all.command = None;
        all.inputs = vec!["a.out".into()];
        let a = graph.add_job(a);
        let all = graph.add_job(all);
        graph.add_edge(a, all);

        assert_eq!(run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default()), 0);

        storage.remove("a.out").unwrap();
        assert_eq!(run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default()), 2);
    }

    #[test]
    fn test_command_without_outputs_always_runs() {
        let storage = MemoryStorage::new();
        let mut graph = JobGraph::new();
        let mut j = job(0, "report");
        j.outputs.clear();
        graph.add_job(j);
        run(&mut graph, &storage, &RunState::in_memory("t"), &ExecutionSettings::default());
        assert_eq!(graph.job(JobId(0)).reasons, vec![NeedRunReason::NoOutputs]);
    }
}
