//! Job Graph
//!
//! Jobs plus their dependency edges. An edge `a -> b` means `b` consumes an
//! output of `a`. The graph only ever grows: checkpoint re-evaluation
//! appends jobs and edges to a copy and bumps [`JobGraph::version`], so job
//! ids stay valid across versions.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::workflow::wildcards::Wildcards;

use super::job::{Job, JobId};

/// Position to roll back to when a speculative resolution fails.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GraphMark {
    jobs: usize,
    sources: usize,
}

#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    pub version: u64,
    jobs: Vec<Job>,
    /// Direct dependencies of each job
    deps: Vec<BTreeSet<JobId>>,
    /// Direct dependents of each job
    dependents: Vec<BTreeSet<JobId>>,
    /// Output path -> producing job
    producers: HashMap<String, JobId>,
    /// (rule, binding) -> job
    index: HashMap<(String, Wildcards), JobId>,
    /// Existing files no rule needs to produce, in discovery order
    sources: Vec<String>,
    source_set: BTreeSet<String>,
    /// Jobs requested directly
    targets: Vec<JobId>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job, assigning its id. Outputs are registered as produced by it.
    pub fn add_job(&mut self, mut job: Job) -> JobId {
        let id = JobId(self.jobs.len());
        job.id = id;
        for output in &job.outputs {
            self.producers.insert(output.clone(), id);
        }
        self.index.insert((job.rule.clone(), job.wildcards.clone()), id);
        self.jobs.push(job);
        self.deps.push(BTreeSet::new());
        self.dependents.push(BTreeSet::new());
        id
    }

    /// Records that `to` depends on `from`.
    pub fn add_edge(&mut self, from: JobId, to: JobId) {
        if from == to {
            return;
        }
        self.deps[to.0].insert(from);
        self.dependents[from.0].insert(to);
    }

    pub fn add_source(&mut self, path: &str) {
        if self.source_set.insert(path.to_string()) {
            self.sources.push(path.to_string());
        }
    }

    pub fn add_target(&mut self, id: JobId) {
        if !self.targets.contains(&id) {
            self.targets.push(id);
        }
    }

    pub(crate) fn mark(&self) -> GraphMark {
        GraphMark {
            jobs: self.jobs.len(),
            sources: self.sources.len(),
        }
    }

    /// Drops every job and source added after `mark`.
    pub(crate) fn rollback(&mut self, mark: GraphMark) {
        for job in self.jobs.drain(mark.jobs..) {
            for output in &job.outputs {
                self.producers.remove(output);
            }
            self.index.remove(&(job.rule, job.wildcards));
        }
        self.deps.truncate(mark.jobs);
        self.dependents.truncate(mark.jobs);
        for set in self.deps.iter_mut().chain(self.dependents.iter_mut()) {
            set.retain(|id| id.0 < mark.jobs);
        }
        for source in self.sources.drain(mark.sources..) {
            self.source_set.remove(&source);
        }
        self.targets.retain(|id| id.0 < mark.jobs);
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id.0]
    }

    pub fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.jobs[id.0]
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id.0)
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn ids(&self) -> impl Iterator<Item = JobId> {
        (0..self.jobs.len()).map(JobId)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn dependencies(&self, id: JobId) -> &BTreeSet<JobId> {
        &self.deps[id.0]
    }

    pub fn dependents(&self, id: JobId) -> &BTreeSet<JobId> {
        &self.dependents[id.0]
    }

    pub fn producer_of(&self, path: &str) -> Option<JobId> {
        self.producers.get(path).copied()
    }

    pub fn find(&self, rule: &str, wildcards: &Wildcards) -> Option<JobId> {
        self.index.get(&(rule.to_string(), wildcards.clone())).copied()
    }

    pub fn is_source(&self, path: &str) -> bool {
        self.source_set.contains(path)
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn targets(&self) -> &[JobId] {
        &self.targets
    }

    /// All edges as (dependency, dependent).
    pub fn edges(&self) -> Vec<(JobId, JobId)> {
        self.ids()
            .flat_map(|to| self.deps[to.0].iter().map(move |&from| (from, to)))
            .collect()
    }

    /// Kahn's algorithm; ties broken by id. `None` if the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<JobId>> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut queue: VecDeque<JobId> = self.ids().filter(|id| in_degree[id.0] == 0).collect();
        let mut order = Vec::with_capacity(self.jobs.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in &self.dependents[id.0] {
                in_degree[next.0] -= 1;
                if in_degree[next.0] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() == self.jobs.len() {
            Some(order)
        } else {
            None
        }
    }

    pub fn is_acyclic(&self) -> bool {
        self.topological_order().is_some()
    }

    /// Every job reachable from `id` through dependent edges.
    pub fn descendants(&self, id: JobId) -> BTreeSet<JobId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<JobId> = self.dependents[id.0].iter().copied().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.dependents[next.0].iter().copied());
            }
        }
        seen
    }

    /// Number of transitive dependents of every job.
    pub fn downstream_counts(&self) -> Vec<usize> {
        self.ids().map(|id| self.descendants(id).len()).collect()
    }
}

/// Removes edges implied by longer paths.
///
/// `edges` are `(from, to)` pairs over nodes `0..n`; the result keeps only
/// edges with no alternative path.
pub fn transitive_reduction(n: usize, edges: &BTreeSet<(usize, usize)>) -> BTreeSet<(usize, usize)> {
    let mut adjacency = vec![BTreeSet::new(); n];
    for &(from, to) in edges {
        adjacency[from].insert(to);
    }

    edges
        .iter()
        .filter(|&&(from, to)| {
            // Is `to` reachable from `from` without the direct edge?
            let mut seen = BTreeSet::new();
            let mut stack: Vec<usize> = adjacency[from].iter().copied().filter(|&v| v != to).collect();
            while let Some(v) = stack.pop() {
                if v == to {
                    return false;
                }
                if seen.insert(v) {
                    stack.extend(adjacency[v].iter().copied());
                }
            }
            true
        })
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::job;

    fn chain() -> JobGraph {
        let mut graph = JobGraph::new();
        let a = graph.add_job(job(0, "a"));
        let b = graph.add_job(job(0, "b"));
        let c = graph.add_job(job(0, "c"));
        graph.add_edge(a, b);
        graph.add_edge(b, c);
        graph.add_edge(a, c);
        graph
    }

    #[test]
    fn test_add_job_assigns_ids() {
        let graph = chain();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.job(JobId(2)).rule, "c");
        assert_eq!(graph.producer_of("b.out"), Some(JobId(1)));
        assert_eq!(graph.find("a", &Wildcards::new()), Some(JobId(0)));
    }

    #[test]
    fn test_topological_order() {
        let graph = chain();
        assert_eq!(graph.topological_order().unwrap(), vec![JobId(0), JobId(1), JobId(2)]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = chain();
        graph.add_edge(JobId(2), JobId(0));
        assert!(!graph.is_acyclic());
    }

    #[test]
    fn test_downstream_counts() {
        let graph = chain();
        assert_eq!(graph.downstream_counts(), vec![2, 1, 0]);
    }

    #[test]
    fn test_rollback() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(job(0, "a"));
        graph.add_source("in.txt");
        let mark = graph.mark();

        let b = graph.add_job(job(0, "b"));
        graph.add_edge(a, b);
        graph.add_source("other.txt");
        graph.add_target(b);

        graph.rollback(mark);
        assert_eq!(graph.len(), 1);
        assert!(graph.dependents(a).is_empty());
        assert!(graph.producer_of("b.out").is_none());
        assert!(graph.is_source("in.txt"));
        assert!(!graph.is_source("other.txt"));
        assert!(graph.targets().is_empty());
    }

    #[test]
    fn test_transitive_reduction() {
        let edges: BTreeSet<(usize, usize)> = [(0, 1), (1, 2), (0, 2)].into_iter().collect();
        let reduced = transitive_reduction(3, &edges);
        assert_eq!(reduced, [(0, 1), (1, 2)].into_iter().collect());
    }
}
