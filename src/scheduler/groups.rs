//! Scheduling Units
//!
//! The scheduler dispatches units, not jobs. A unit is a single job, or a
//! connected set of jobs sharing a `group` name that runs as one submission
//! under one allocation. A group unit's demand is the per-resource max or
//! sum of its members' demands.
//!
//! A group whose members are connected only through a job outside the
//! group cannot run as one submission; its members are scheduled alone.
//! So are jobs still waiting for checkpoint inputs: they join their group
//! once the units are rebuilt after the checkpoint.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::dag::graph::JobGraph;
use crate::dag::job::JobId;
use crate::settings::GroupResources;
use crate::workflow::model::JOBS_RESOURCE;

use super::pool::Demand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub usize);

#[derive(Debug, Clone)]
pub struct Unit {
    pub id: UnitId,
    /// Members in dependency order
    pub jobs: Vec<JobId>,
    pub group: Option<String>,
    pub demand: Demand,
    pub priority: i64,
    /// Extra attempts after the first failure
    pub retries: u32,
}

impl Unit {
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains(&id)
    }
}

/// Partitions `candidates` into units. Ids are taken from `next_id`.
pub fn build_units(
    graph: &JobGraph,
    candidates: &BTreeSet<JobId>,
    policy: GroupResources,
    default_retries: u32,
    next_id: &mut usize,
) -> Vec<Unit> {
    let position: BTreeMap<JobId, usize> = graph
        .topological_order()
        .unwrap_or_else(|| graph.ids().collect())
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();

    let mut by_group: BTreeMap<&str, BTreeSet<JobId>> = BTreeMap::new();
    let mut members: Vec<Vec<JobId>> = Vec::new();
    for &id in candidates {
        let job = graph.job(id);
        match job.group.as_deref() {
            Some(group) if !job.is_deferred() => {
                by_group.entry(group).or_default().insert(id);
            }
            _ => members.push(vec![id]),
        }
    }

    for (group, ids) in by_group {
        for component in components(graph, &ids) {
            if component.len() > 1 && !is_convex(graph, &component) {
                warn!(
                    "Group '{}' depends on itself through jobs outside the group, scheduling its jobs separately",
                    group
                );
                members.extend(component.into_iter().map(|id| vec![id]));
            } else {
                members.push(component.into_iter().collect());
            }
        }
    }

    let mut units: Vec<Unit> = members
        .into_iter()
        .map(|mut jobs| {
            jobs.sort_by_key(|id| position.get(id).copied().unwrap_or(id.0));
            let id = UnitId(*next_id);
            *next_id += 1;
            make_unit(graph, id, jobs, policy, default_retries)
        })
        .collect();
    units.sort_by_key(|u| u.jobs[0]);
    units
}

fn make_unit(graph: &JobGraph, id: UnitId, jobs: Vec<JobId>, policy: GroupResources, default_retries: u32) -> Unit {
    let mut demand = Demand::new();
    for &job in &jobs {
        for (name, &amount) in &graph.job(job).resources {
            let entry = demand.entry(name.clone()).or_insert(0);
            *entry = match policy {
                GroupResources::Max => (*entry).max(amount),
                GroupResources::Sum => *entry + amount,
            };
        }
    }
    demand.insert(JOBS_RESOURCE.to_string(), 1);

    let first = graph.job(jobs[0]);
    Unit {
        id,
        group: if jobs.len() > 1 { first.group.clone() } else { None },
        priority: jobs.iter().map(|&j| graph.job(j).priority).max().unwrap_or(0),
        retries: jobs
            .iter()
            .map(|&j| graph.job(j).retries.unwrap_or(default_retries))
            .max()
            .unwrap_or(default_retries),
        demand,
        jobs,
    }
}

/// Connected components of `ids` through edges among them.
fn components(graph: &JobGraph, ids: &BTreeSet<JobId>) -> Vec<BTreeSet<JobId>> {
    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    for &start in ids {
        if seen.contains(&start) {
            continue;
        }
        let mut component = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            component.insert(id);
            let neighbours = graph.dependencies(id).iter().chain(graph.dependents(id));
            stack.extend(neighbours.copied().filter(|n| ids.contains(n) && !seen.contains(n)));
        }
        result.push(component);
    }
    result
}

/// False if a path leaves `component` and comes back into it.
fn is_convex(graph: &JobGraph, component: &BTreeSet<JobId>) -> bool {
    let mut stack: Vec<JobId> = component
        .iter()
        .flat_map(|&id| graph.dependents(id).iter().copied())
        .filter(|id| !component.contains(id))
        .collect();
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if component.contains(&id) {
            return false;
        }
        if seen.insert(id) {
            stack.extend(graph.dependents(id).iter().copied());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::job;

    fn grouped(rule: &str, group: Option<&str>, cores: u64) -> crate::dag::job::Job {
        let mut j = job(0, rule);
        j.group = group.map(String::from);
        j.resources.insert("_cores".into(), cores);
        j
    }

    fn all(graph: &JobGraph) -> BTreeSet<JobId> {
        graph.ids().collect()
    }

    #[test]
    fn test_singletons_without_groups() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(grouped("a", None, 1));
        let b = graph.add_job(grouped("b", None, 2));
        graph.add_edge(a, b);

        let mut next = 0;
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 1, &mut next);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].demand["_cores"], 2);
        assert_eq!(units[1].demand["_jobs"], 1);
        assert_eq!(units[0].retries, 1);
        assert_eq!(next, 2);
    }

    #[test]
    fn test_connected_group_is_one_unit() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(grouped("a", Some("g"), 1));
        let b = graph.add_job(grouped("b", Some("g"), 3));
        graph.add_edge(a, b);

        let mut next = 0;
        let max = build_units(&graph, &all(&graph), GroupResources::Max, 0, &mut next);
        assert_eq!(max.len(), 1);
        assert_eq!(max[0].jobs, vec![a, b]);
        assert_eq!(max[0].demand["_cores"], 3);
        assert_eq!(max[0].group.as_deref(), Some("g"));

        let sum = build_units(&graph, &all(&graph), GroupResources::Sum, 0, &mut next);
        assert_eq!(sum[0].demand["_cores"], 4);
    }

    #[test]
    fn test_disconnected_group_members() {
        let mut graph = JobGraph::new();
        graph.add_job(grouped("a", Some("g"), 1));
        graph.add_job(grouped("b", Some("g"), 1));

        let mut next = 0;
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 0, &mut next);
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_group_through_outside_job_is_split() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(grouped("a", Some("g"), 1));
        let x = graph.add_job(grouped("x", None, 1));
        let c = graph.add_job(grouped("c", Some("g"), 1));
        graph.add_edge(a, x);
        graph.add_edge(x, c);
        graph.add_edge(a, c);

        let mut next = 0;
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 0, &mut next);
        assert_eq!(units.len(), 3);
    }

    #[test]
    fn test_deferred_member_is_scheduled_alone() {
        use crate::dag::job::DeferredInput;
        use crate::workflow::wildcards::Pattern;

        let mut graph = JobGraph::new();
        let mut split = grouped("split", Some("g"), 1);
        split.checkpoint = true;
        let split = graph.add_job(split);
        let mut merge = grouped("merge", Some("g"), 1);
        merge.deferred.push(DeferredInput {
            checkpoint: split,
            glob: Pattern::parse("chunks/{i}.txt").unwrap(),
            expand: Pattern::parse("chunks/{i}.txt").unwrap(),
        });
        let merge = graph.add_job(merge);
        graph.add_edge(split, merge);

        let mut next = 0;
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 0, &mut next);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].jobs, vec![split]);
        assert_eq!(units[1].jobs, vec![merge]);

        graph.job_mut(merge).deferred.clear();
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 0, &mut next);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].jobs, vec![split, merge]);
    }

    #[test]
    fn test_priority_and_retries_from_members() {
        let mut graph = JobGraph::new();
        let mut a = grouped("a", Some("g"), 1);
        a.priority = 5;
        a.retries = Some(3);
        let a = graph.add_job(a);
        let b = graph.add_job(grouped("b", Some("g"), 1));
        graph.add_edge(a, b);

        let mut next = 0;
        let units = build_units(&graph, &all(&graph), GroupResources::Max, 1, &mut next);
        assert_eq!(units[0].priority, 5);
        assert_eq!(units[0].retries, 3);
    }
}
