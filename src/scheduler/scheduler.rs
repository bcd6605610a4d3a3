//! Coordinator Loop
//!
//! The [`Scheduler`] is the single writer of job state and resource
//! allocation. Each round it:
//!
//! 1. Completes command-less jobs whose dependencies are done
//! 2. Marks units whose external dependencies completed as ready
//! 3. Orders ready units and admits those that fit the [`ResourcePool`]
//! 4. Submits admitted units to the [`Executor`]
//! 5. Waits for outcomes, releasing resources and updating job states
//!
//! A permanently failed job takes all of its transitive dependents with it
//! (they end up skipped). Independent branches keep running unless
//! `halt_on_failure` is set, in which case the whole run is aborted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::dag::builder::DagBuilder;
use crate::dag::graph::JobGraph;
use crate::dag::job::{JobId, JobState};
use crate::dag::needrun::{analyse, describe};
use crate::dag::storage::Storage;
use crate::error::JobError;
use crate::execution::executor::{Executor, JobHandle, Outcome, Submission};
use crate::execution::report::RunReport;
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::settings::{Freshness, Settings};
use crate::workflow::state::RunState;

use super::groups::{build_units, Unit, UnitId};
use super::pool::ResourcePool;
use super::selector::{admit, dispatch_order};

/// Interval for checking the pause flag file while nothing is running.
pub const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Interval for re-checking outputs during the latency wait.
const LATENCY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Drives a job graph to completion on one executor.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ruleflow::dag::{JobGraph, MemoryStorage};
/// use ruleflow::execution::{DryRunExecutor, ExecutorContext};
/// use ruleflow::scheduler::Scheduler;
/// use ruleflow::settings::Settings;
/// use ruleflow::workflow::RunState;
///
/// let settings = Settings::default();
/// let storage = Arc::new(MemoryStorage::new());
/// let ctx = ExecutorContext {
///     settings: settings.clone(),
///     storage: storage.clone(),
///     working_dir: ".".into(),
/// };
/// let mut state = RunState::in_memory("rules.yaml");
/// let mut executor = DryRunExecutor::new(&ctx);
///
/// let mut scheduler = Scheduler::new(JobGraph::new(), &settings, storage, &mut state);
/// let report = scheduler.run(&mut executor);
/// println!("{}", report.summary());
/// ```
pub struct Scheduler<'a> {
    graph: JobGraph,
    settings: &'a Settings,
    storage: Arc<dyn Storage>,
    state: &'a mut RunState,
    builder: Option<&'a DagBuilder<'a>>,
    abort: Arc<AtomicBool>,

    pool: ResourcePool,
    states: Vec<JobState>,
    attempts: Vec<u32>,
    errors: BTreeMap<JobId, String>,
    units: BTreeMap<UnitId, Unit>,
    running: HashMap<JobHandle, UnitId>,
    downstream: Vec<usize>,
    resolved_checkpoints: BTreeSet<JobId>,
    next_unit: usize,
    dispatched: usize,

    verify: bool,
    persist: bool,
    paused: bool,
    aborting: bool,
    timeline: ExecutionTimeline,
}

impl<'a> Scheduler<'a> {
    /// Creates a scheduler for an analysed graph (see [`analyse`]).
    pub fn new(graph: JobGraph, settings: &'a Settings, storage: Arc<dyn Storage>, state: &'a mut RunState) -> Self {
        let n = graph.len();
        let downstream = graph.downstream_counts();
        Self {
            graph,
            settings,
            storage,
            state,
            builder: None,
            abort: Arc::new(AtomicBool::new(false)),
            pool: ResourcePool::from_settings(settings),
            states: vec![JobState::Pending; n],
            attempts: vec![0; n],
            errors: BTreeMap::new(),
            units: BTreeMap::new(),
            running: HashMap::new(),
            downstream,
            resolved_checkpoints: BTreeSet::new(),
            next_unit: 0,
            dispatched: 0,
            verify: true,
            persist: true,
            paused: false,
            aborting: false,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Builder used to resolve checkpoint inputs once a checkpoint completes.
    pub fn with_builder(mut self, builder: &'a DagBuilder<'a>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Shared flag that aborts the run when set.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    /// Current graph snapshot.
    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    pub fn states(&self) -> &[JobState] {
        &self.states
    }

    /// Runs every job to a terminal state and reports the result.
    ///
    /// The executor is shut down before this returns.
    pub fn run(&mut self, executor: &mut dyn Executor) -> RunReport {
        let start = Instant::now();
        let caps = executor.capabilities();
        self.verify = !caps.dryrun_exec;
        self.persist = !caps.dryrun_exec;

        info!(
            "Scheduling {} job(s) on '{}' executor (resources: {:?})",
            self.graph.len(),
            executor.name(),
            self.pool.capacities()
        );

        self.resolve_fresh_checkpoints(executor);
        let all: Vec<JobId> = self.graph.ids().collect();
        self.short_circuit(&all);
        self.rebuild_units(executor);

        let poll_interval = Duration::from_millis(self.settings.execution.poll_interval_ms);
        loop {
            if !self.aborting && self.abort.load(Ordering::SeqCst) {
                self.abort_run(executor, "run aborted by user");
            }

            self.complete_commandless(executor);
            self.refresh_ready();

            if !self.aborting {
                self.update_pause();
                if !self.paused {
                    self.dispatch(executor);
                }
            }

            if self.running.is_empty() {
                if self.paused && !self.aborting && self.has_waiting_units() {
                    thread::sleep(PAUSE_CHECK_INTERVAL);
                    continue;
                }
                break;
            }

            for (handle, outcome) in executor.poll(poll_interval) {
                self.handle_outcome(handle, outcome, executor);
            }
        }

        executor.shutdown();
        self.skip_leftovers();
        self.save_state();

        RunReport::from_run(
            &self.graph,
            &self.states,
            &self.attempts,
            &self.errors,
            start.elapsed(),
            self.dispatched,
            self.aborting,
        )
    }

    /// Marks pending jobs that do not need to run as completed.
    fn short_circuit(&mut self, ids: &[JobId]) {
        for &id in ids {
            let job = self.graph.job(id);
            if self.states[id.0] == JobState::Pending && !job.needrun && !job.is_deferred() {
                debug!("{} is up to date", job.label());
                self.states[id.0] = JobState::Completed;
            }
        }
    }

    /// Re-enters the builder for checkpoints that are already up to date.
    fn resolve_fresh_checkpoints(&mut self, executor: &mut dyn Executor) {
        loop {
            let fresh: Vec<JobId> = self
                .graph
                .ids()
                .filter(|&id| {
                    let job = self.graph.job(id);
                    job.checkpoint
                        && !job.needrun
                        && !self.resolved_checkpoints.contains(&id)
                        && self.has_deferred_dependents(id)
                })
                .collect();
            if fresh.is_empty() {
                break;
            }
            for id in fresh {
                debug!("Checkpoint {} is up to date", self.graph.job(id).label());
                self.update_checkpoint(id, executor);
            }
        }
    }

    fn has_deferred_dependents(&self, checkpoint: JobId) -> bool {
        self.graph
            .jobs()
            .iter()
            .any(|job| job.deferred.iter().any(|d| d.checkpoint == checkpoint))
    }

    /// Swaps in the graph version produced after `checkpoint` completed.
    fn update_checkpoint(&mut self, checkpoint: JobId, executor: &mut dyn Executor) {
        self.resolved_checkpoints.insert(checkpoint);
        if !self.has_deferred_dependents(checkpoint) {
            return;
        }

        let waiting: Vec<JobId> = self
            .graph
            .ids()
            .filter(|&id| self.graph.job(id).deferred.iter().any(|d| d.checkpoint == checkpoint))
            .collect();

        let Some(builder) = self.builder else {
            let reason = format!(
                "inputs depending on checkpoint {} cannot be resolved without a graph builder",
                self.graph.job(checkpoint).label()
            );
            self.fail_jobs(&waiting, &reason, executor);
            return;
        };

        let next = match builder.update_after_checkpoint(&self.graph, checkpoint) {
            Ok(next) => next,
            Err(e) => {
                error!("Re-evaluation after checkpoint {} failed: {}", self.graph.job(checkpoint).label(), e);
                self.fail_jobs(&waiting, &e.to_string(), executor);
                return;
            }
        };

        let added = next.len() - self.graph.len();
        self.graph = next;
        self.states.resize(self.graph.len(), JobState::Pending);
        self.attempts.resize(self.graph.len(), 0);
        self.downstream = self.graph.downstream_counts();

        let open: BTreeSet<JobId> = self
            .graph
            .ids()
            .filter(|id| matches!(self.states[id.0], JobState::Pending | JobState::Ready))
            .collect();
        let needrun = analyse(
            &mut self.graph,
            self.storage.as_ref(),
            &*self.state,
            &self.settings.execution,
            Some(&open),
        );
        info!(
            "Graph version {}: {} new job(s), {} job(s) to run",
            self.graph.version, added, needrun
        );

        let open: Vec<JobId> = open.into_iter().collect();
        self.short_circuit(&open);
        self.rebuild_units(executor);
    }

    /// Regroups every job that still has to be dispatched into units.
    ///
    /// Units with running members are kept as they are.
    fn rebuild_units(&mut self, executor: &mut dyn Executor) {
        let busy: BTreeSet<UnitId> = self.running.values().copied().collect();
        self.units.retain(|id, _| busy.contains(id));
        let taken: BTreeSet<JobId> = self.units.values().flat_map(|u| u.jobs.iter().copied()).collect();

        let candidates: BTreeSet<JobId> = self
            .graph
            .ids()
            .filter(|id| !taken.contains(id))
            .filter(|id| matches!(self.states[id.0], JobState::Pending | JobState::Ready))
            .filter(|&id| {
                let job = self.graph.job(id);
                job.needrun && job.has_command()
            })
            .collect();
        for id in &candidates {
            self.states[id.0] = JobState::Pending;
        }

        let units = build_units(
            &self.graph,
            &candidates,
            self.settings.scheduling.group_resources,
            self.settings.execution.retries,
            &mut self.next_unit,
        );

        for unit in units {
            if let Some((resource, requested, capacity)) = self.pool.unsatisfiable(&unit.demand) {
                let err = JobError::ResourceUnsatisfiable {
                    resource,
                    requested,
                    capacity,
                };
                error!("Cannot schedule {}: {}", self.unit_label(&unit), err);
                self.fail_jobs(&unit.jobs, &err.to_string(), executor);
                continue;
            }
            self.units.insert(unit.id, unit);
        }
        debug!("{} unit(s) waiting for dispatch", self.units.len() - busy.len());
    }

    fn unit_label(&self, unit: &Unit) -> String {
        let labels: Vec<String> = unit.jobs.iter().map(|&j| self.graph.job(j).label()).collect();
        match &unit.group {
            Some(group) => format!("group '{}' ({})", group, labels.join(", ")),
            None => labels.join(", "),
        }
    }

    /// True when every dependency outside `members` completed.
    fn dependencies_done(&self, id: JobId, members: &[JobId]) -> bool {
        self.graph
            .dependencies(id)
            .iter()
            .all(|dep| members.contains(dep) || self.states[dep.0] == JobState::Completed)
    }

    /// Completes command-less jobs as soon as their dependencies are done.
    fn complete_commandless(&mut self, executor: &mut dyn Executor) {
        loop {
            let ready: Vec<JobId> = self
                .graph
                .ids()
                .filter(|&id| {
                    let job = self.graph.job(id);
                    self.states[id.0] == JobState::Pending
                        && !job.has_command()
                        && !job.is_deferred()
                        && self.dependencies_done(id, &[])
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            for id in ready {
                match self.verify_outputs(id) {
                    Ok(()) => {
                        self.complete_job(id);
                        if self.graph.job(id).checkpoint {
                            self.update_checkpoint(id, executor);
                        }
                    }
                    Err(e) => self.fail_jobs(&[id], &e.to_string(), executor),
                }
            }
        }
    }

    /// Promotes units whose external dependencies completed to ready.
    fn refresh_ready(&mut self) {
        let mut ready = Vec::new();
        for unit in self.units.values() {
            let waiting = unit.jobs.iter().all(|&j| self.states[j.0] == JobState::Pending);
            let unblocked = unit.jobs.iter().all(|&j| {
                !self.graph.job(j).is_deferred() && self.dependencies_done(j, &unit.jobs)
            });
            if waiting && unblocked {
                ready.extend(unit.jobs.iter().copied());
            }
        }
        for id in ready {
            debug!("{} is ready", self.graph.job(id).label());
            self.states[id.0] = JobState::Ready;
        }
    }

    fn has_waiting_units(&self) -> bool {
        self.units
            .values()
            .any(|u| u.jobs.iter().all(|&j| matches!(self.states[j.0], JobState::Pending | JobState::Ready)))
    }

    fn update_pause(&mut self) {
        let paused = match &self.settings.execution.pause_flag {
            Some(flag) => self.settings.resolve_path(flag).exists(),
            None => false,
        };
        if paused != self.paused {
            if paused {
                info!("Execution paused - waiting for resume signal");
            } else {
                info!("Resumed");
            }
            self.paused = paused;
        }
    }

    /// Admits and submits ready units.
    fn dispatch(&mut self, executor: &mut dyn Executor) {
        let states = &self.states;
        let ready: Vec<&Unit> = self
            .units
            .values()
            .filter(|u| u.jobs.iter().all(|&j| states[j.0] == JobState::Ready))
            .collect();
        if ready.is_empty() {
            return;
        }

        let downstream = &self.downstream;
        let ordered = dispatch_order(ready, self.settings.scheduling.dispatch_order, |unit| {
            unit.jobs.iter().map(|j| downstream[j.0]).max().unwrap_or(0)
        });
        let admitted: Vec<Unit> = admit(ordered, &mut self.pool).into_iter().cloned().collect();

        for unit in admitted {
            for &id in &unit.jobs {
                self.attempts[id.0] += 1;
            }
            let attempt = self.attempts[unit.jobs[0].0];

            if self.persist {
                for &id in &unit.jobs {
                    self.state.mark_incomplete(&self.graph.job(id).outputs);
                }
                self.save_state();
            }

            let submission = Submission {
                jobs: unit.jobs.iter().map(|&id| self.graph.job(id).clone()).collect(),
                attempt,
            };
            let label = submission.label();

            match executor.submit(submission) {
                Ok(handle) => {
                    info!("Starting job: {} ({}, attempt {})", label, handle, attempt);
                    for &id in &unit.jobs {
                        let job = self.graph.job(id);
                        debug!("{} runs because: {}", job.label(), describe(&job.reasons));
                        self.states[id.0] = JobState::Running;
                        self.timeline.add_event(job.label(), EventType::Started);
                    }
                    self.running.insert(handle, unit.id);
                    self.dispatched += 1;
                }
                Err(e) => {
                    error!("Submission of {} failed: {}", label, e);
                    self.pool.release(&unit.demand);
                    self.fail_unit(&unit, JobError::Executor(e.to_string()), executor);
                }
            }
        }
    }

    fn handle_outcome(&mut self, handle: JobHandle, outcome: Outcome, executor: &mut dyn Executor) {
        let Some(unit_id) = self.running.remove(&handle) else {
            warn!("Ignoring outcome for unknown {}", handle);
            return;
        };
        let Some(unit) = self.units.get(&unit_id).cloned() else {
            return;
        };
        self.pool.release(&unit.demand);

        if self.aborting {
            for &id in &unit.jobs {
                self.states[id.0] = JobState::Skipped;
                self.errors.entry(id).or_insert_with(|| JobError::Cancelled.to_string());
                self.timeline.add_event(self.graph.job(id).label(), EventType::Cancelled);
            }
            self.units.remove(&unit_id);
            return;
        }

        match outcome {
            Outcome::Success => {
                if let Some(err) = unit.jobs.iter().find_map(|&id| self.verify_outputs(id).err()) {
                    self.fail_unit(&unit, err, executor);
                    return;
                }
                self.units.remove(&unit_id);
                for &id in &unit.jobs {
                    self.complete_job(id);
                }
                for &id in &unit.jobs {
                    if self.graph.job(id).checkpoint {
                        self.update_checkpoint(id, executor);
                    }
                }
            }
            Outcome::Failure(reason) => self.fail_unit(&unit, JobError::ExecutionFailure { reason }, executor),
            Outcome::Cancelled => self.fail_unit(&unit, JobError::Cancelled, executor),
        }
    }

    /// Checks that every output of `id` exists, waiting up to the latency
    /// wait for slow file systems.
    fn verify_outputs(&self, id: JobId) -> Result<(), JobError> {
        if !self.verify {
            return Ok(());
        }
        let job = self.graph.job(id);
        let missing = || -> Vec<String> {
            job.outputs
                .iter()
                .filter(|o| !self.storage.exists(o))
                .cloned()
                .collect()
        };

        let mut absent = missing();
        let wait = Duration::from_millis(self.settings.execution.latency_wait_ms);
        if !absent.is_empty() && !wait.is_zero() {
            info!("Waiting at most {:?} for missing output(s) of {}", wait, job.label());
            let deadline = Instant::now() + wait;
            while !absent.is_empty() && Instant::now() < deadline {
                thread::sleep(LATENCY_CHECK_INTERVAL.min(wait));
                absent = missing();
            }
        }

        if absent.is_empty() {
            Ok(())
        } else {
            Err(JobError::OutputNotProduced { paths: absent })
        }
    }

    fn complete_job(&mut self, id: JobId) {
        self.states[id.0] = JobState::Completed;
        let job = self.graph.job(id);

        if self.persist && !job.outputs.is_empty() {
            let checksums = if self.settings.execution.freshness == Freshness::Checksum {
                job.inputs
                    .iter()
                    .filter_map(|input| self.storage.content_hash(input).ok().map(|h| (input.clone(), h)))
                    .collect()
            } else {
                BTreeMap::new()
            };
            self.state.mark_complete(&job.rule, &job.outputs, checksums);
            self.save_state();
        }

        if job.has_command() {
            info!("Finished job: {}", job.label());
            self.timeline.add_event(job.label(), EventType::Completed);
        } else {
            debug!("Finished job: {} (no command)", job.label());
        }
    }

    /// Retries `unit` if it has attempts left, fails it otherwise.
    fn fail_unit(&mut self, unit: &Unit, err: JobError, executor: &mut dyn Executor) {
        let label = self.unit_label(unit);
        for &id in &unit.jobs {
            if self.states[id.0] == JobState::Running {
                self.timeline.add_event(self.graph.job(id).label(), EventType::Failed);
            }
        }

        let attempt = self.attempts[unit.jobs[0].0];
        if err.is_retryable() && attempt <= unit.retries {
            warn!(
                "{} failed (attempt {}/{}): {}, retrying",
                label,
                attempt,
                unit.retries + 1,
                err
            );
            for &id in &unit.jobs {
                self.states[id.0] = JobState::Pending;
            }
            return;
        }

        error!("{} failed: {}", label, err);
        self.units.remove(&unit.id);
        self.fail_jobs(&unit.jobs, &err.to_string(), executor);
    }

    /// Permanently fails `ids` and skips everything downstream of them.
    fn fail_jobs(&mut self, ids: &[JobId], reason: &str, executor: &mut dyn Executor) {
        for &id in ids {
            self.states[id.0] = JobState::Failed;
            self.errors.insert(id, reason.to_string());
        }

        for &id in ids {
            let label = self.graph.job(id).label();
            for dep in self.graph.descendants(id) {
                if !self.states[dep.0].is_terminal() && self.states[dep.0] != JobState::Running {
                    info!("Skipping {}: upstream job {} failed", self.graph.job(dep).label(), label);
                    self.states[dep.0] = JobState::Skipped;
                    self.errors
                        .entry(dep)
                        .or_insert_with(|| format!("upstream job {} failed", label));
                }
            }
        }

        if self.settings.execution.halt_on_failure {
            self.abort_run(executor, "a job failed and halt_on_failure is set");
        }
    }

    /// Cancels running units and skips everything not yet finished.
    fn abort_run(&mut self, executor: &mut dyn Executor, reason: &str) {
        if self.aborting {
            return;
        }
        self.aborting = true;
        warn!("Aborting run: {}", reason);

        for &handle in self.running.keys() {
            if let Err(e) = executor.cancel(handle) {
                warn!("Failed to cancel {}: {}", handle, e);
            }
        }

        for id in self.graph.ids() {
            let state = self.states[id.0];
            if !state.is_terminal() && state != JobState::Running {
                self.states[id.0] = JobState::Skipped;
                self.errors.entry(id).or_insert_with(|| format!("not started: {}", reason));
            }
        }
    }

    /// Skips jobs the loop could not bring to a terminal state.
    fn skip_leftovers(&mut self) {
        for id in self.graph.ids() {
            if !self.states[id.0].is_terminal() {
                let job = self.graph.job(id);
                let reason = if job.is_deferred() {
                    "checkpoint inputs were never resolved"
                } else {
                    "never became ready"
                };
                warn!("Skipping {}: {}", job.label(), reason);
                self.states[id.0] = JobState::Skipped;
                self.errors.entry(id).or_insert_with(|| reason.to_string());
            }
        }
    }

    fn save_state(&self) {
        if !self.persist {
            return;
        }
        if let Err(e) = self.state.save() {
            error!("Failed to save run state: {}", e);
        }
    }
}
