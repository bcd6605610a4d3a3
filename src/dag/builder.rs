//! DAG Builder
//!
//! Derives the job graph for a set of targets by working backwards from
//! each requested path:
//!
//! 1. A path already produced by a job in the graph reuses that job
//! 2. A path no rule can produce is a source file if it exists, otherwise
//!    the build fails with `MissingProducer`
//! 3. Otherwise the producing rule is selected (see ambiguity handling
//!    below), its inputs are resolved and a job is added
//!
//! Resolution runs on an explicit task stack rather than the call stack.
//! Cycles are detected with the paths currently being resolved, and chains
//! deeper than `max_resolution_depth` are reported as cycles as well.
//! An existing file whose producer cannot be derived is used as it is.
//!
//! When several rules match a path, each is tried first and rules whose
//! inputs cannot be resolved drop out. Among the rest `ruleorder` decides
//! if it ranks all of them. Otherwise the configured [`AmbiguityPolicy`]
//! applies; by default that is an `AmbiguousRule` error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info};

use crate::error::{GraphError, PatternError};
use crate::settings::{AmbiguityPolicy, Settings};
use crate::workflow::model::CORES_RESOURCE;
use crate::workflow::resources::{EvalContext, ResourceSpec};
use crate::workflow::ruleset::{CompiledInput, CompiledRule, RuleSet};
use crate::workflow::wildcards::{Pattern, Wildcards};

use super::graph::{GraphMark, JobGraph};
use super::job::{DeferredInput, Job, JobId};
use super::storage::Storage;

/// Number of stack entries shown when resolution exceeds the depth limit.
const DEPTH_CYCLE_CONTEXT: usize = 4;

/// The producing job of a path, or `None` for a source file.
type Resolution = Result<Option<JobId>, GraphError>;

type Candidate<'a> = (&'a CompiledRule, Wildcards);

/// A path a job still has to resolve.
#[derive(Debug)]
enum Request {
    Input(String),
    /// Output of the checkpoint job a checkpoint input waits for
    Checkpoint {
        output: String,
        glob: Pattern,
        expand: Pattern,
    },
    /// Input found by globbing an up-to-date checkpoint's files
    Discovered(String),
}

impl Request {
    fn path(&self) -> &str {
        match self {
            Self::Input(path) | Self::Discovered(path) => path,
            Self::Checkpoint { output, .. } => output,
        }
    }
}

/// Candidates tried one by one; each attempt is rolled back.
struct Trial<'a> {
    remaining: VecDeque<Candidate<'a>>,
    current: Option<Candidate<'a>>,
    survivors: Vec<Candidate<'a>>,
    /// First `MissingProducer` a candidate ran into
    missing: Option<GraphError>,
    mark: GraphMark,
}

enum PathPhase<'a> {
    Start,
    Trial(Trial<'a>),
    /// Building the selected producer. `mark` is set when the path exists.
    Build {
        rule: &'a CompiledRule,
        mark: Option<GraphMark>,
    },
}

struct PathTask<'a> {
    path: String,
    required_by: Option<String>,
    phase: PathPhase<'a>,
}

impl PathTask<'_> {
    fn new(path: &str, required_by: Option<String>) -> Self {
        Self {
            path: path.to_string(),
            required_by,
            phase: PathPhase::Start,
        }
    }
}

/// A job whose inputs are being resolved.
struct JobTask<'a> {
    rule: &'a CompiledRule,
    binding: Wildcards,
    label: String,
    /// Path the job was created for
    requested: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    logs: Vec<String>,
    params: BTreeMap<String, String>,
    deps: BTreeSet<JobId>,
    deferred: Vec<DeferredInput>,
    todo: VecDeque<Request>,
    awaiting: Option<Request>,
}

enum Task<'a> {
    Path(PathTask<'a>),
    Job(Box<JobTask<'a>>),
}

enum Step<'a> {
    Push(Task<'a>),
    /// The top task finished
    Done(Resolution),
}

enum PathNext<'a> {
    Done(Resolution),
    Launch(&'a CompiledRule, Wildcards),
}

enum Launch<'a> {
    Existing(JobId),
    Task(Box<JobTask<'a>>),
}

pub struct DagBuilder<'a> {
    rules: &'a RuleSet,
    storage: &'a dyn Storage,
    ambiguity: AmbiguityPolicy,
    max_depth: usize,
    default_resources: BTreeMap<String, ResourceSpec>,
    /// Declared capacity per resource; undeclared resources are unlimited
    capacity: BTreeMap<String, u64>,
}

impl<'a> DagBuilder<'a> {
    /// Creates a builder. `settings` must have been validated.
    pub fn new(rules: &'a RuleSet, storage: &'a dyn Storage, settings: &Settings) -> Result<Self, GraphError> {
        let mut default_resources = BTreeMap::new();
        for (name, value) in &settings.resources.default_resources {
            let spec = ResourceSpec::from_value(value).map_err(|reason| GraphError::ResourceExpression {
                rule: "default_resources".to_string(),
                resource: name.clone(),
                reason,
            })?;
            default_resources.insert(name.clone(), spec);
        }

        let mut capacity = settings.resources.limits.clone();
        capacity.insert(CORES_RESOURCE.to_string(), settings.cores() as u64);

        Ok(Self {
            rules,
            storage,
            ambiguity: settings.scheduling.ambiguity,
            max_depth: settings.execution.max_resolution_depth,
            default_resources,
            capacity,
        })
    }

    /// Builds the graph for `targets`.
    ///
    /// A target equal to a rule name requests that rule; its outputs must
    /// not contain wildcards.
    pub fn build(&self, targets: &[String]) -> Result<JobGraph, GraphError> {
        info!("Building job graph for {} target(s)", targets.len());
        let mut graph = JobGraph::new();

        for target in targets {
            if let Some(rule) = self.rules.get(target) {
                if !rule.wildcard_names().is_empty() {
                    return Err(GraphError::InvalidRule {
                        rule: rule.name().to_string(),
                        reason: "cannot be requested by name because its outputs contain wildcards".to_string(),
                    });
                }
                let resolved = match self.begin_job(&graph, rule, Wildcards::new(), target)? {
                    Launch::Existing(id) => Some(id),
                    Launch::Task(job) => self.drive(&mut graph, Task::Job(job))?,
                };
                if let Some(id) = resolved {
                    graph.add_target(id);
                }
                continue;
            }

            match self.require(&mut graph, target, None)? {
                Some(id) => graph.add_target(id),
                None => info!("Target '{}' is an existing file no rule produces", target),
            }
        }

        debug!(
            "Job graph: {} jobs, {} edges, {} source files",
            graph.len(),
            graph.edges().len(),
            graph.sources().len()
        );
        Ok(graph)
    }

    /// Resolves the checkpoint inputs waiting on `checkpoint`.
    ///
    /// Returns a new graph version; the given graph is left untouched. New
    /// jobs are appended, so existing ids remain valid.
    pub fn update_after_checkpoint(&self, graph: &JobGraph, checkpoint: JobId) -> Result<JobGraph, GraphError> {
        let mut next = graph.clone();
        next.version += 1;

        let waiting: Vec<JobId> = next
            .ids()
            .filter(|&id| next.job(id).deferred.iter().any(|d| d.checkpoint == checkpoint))
            .collect();

        for id in waiting {
            let job = next.job(id).clone();
            let rule = self.rule(&job.rule)?;
            let label = job.label();

            let (ready, still_deferred): (Vec<DeferredInput>, Vec<DeferredInput>) =
                job.deferred.into_iter().partition(|d| d.checkpoint == checkpoint);

            let mut inputs = job.inputs;
            for deferred in ready {
                for path in self.discover(rule, &deferred.glob, &deferred.expand, &job.wildcards)? {
                    if let Some(dep) = self.require(&mut next, &path, Some(label.clone()))? {
                        next.add_edge(dep, id);
                    }
                    if !inputs.contains(&path) {
                        inputs.push(path);
                    }
                }
            }

            let resources = self.resolve_resources(rule, &job.wildcards, &inputs)?;
            self.check_capacity(rule, &job.wildcards, &resources)?;

            let updated = next.job_mut(id);
            info!(
                "Checkpoint {} resolved {} input(s) for {}",
                checkpoint,
                inputs.len(),
                label
            );
            updated.inputs = inputs;
            updated.resources = resources;
            updated.deferred = still_deferred;

            if !next.is_acyclic() {
                return Err(GraphError::CyclicDependency {
                    cycle: vec![label, next.job(checkpoint).label()],
                });
            }
        }

        Ok(next)
    }

    fn rule(&self, name: &str) -> Result<&'a CompiledRule, GraphError> {
        self.rules.get(name).ok_or_else(|| GraphError::InvalidRule {
            rule: name.to_string(),
            reason: "rule not found".to_string(),
        })
    }

    /// Resolves `path` to its producing job, or `None` for a source file.
    fn require(&self, graph: &mut JobGraph, path: &str, required_by: Option<String>) -> Resolution {
        self.drive(graph, Task::Path(PathTask::new(path, required_by)))
    }

    /// Runs resolution tasks on an explicit stack until `root` is done.
    ///
    /// The stack grows with the dependency depth, so deep rule chains hit
    /// `max_resolution_depth` instead of exhausting the thread stack.
    fn drive(&self, graph: &mut JobGraph, root: Task<'a>) -> Resolution {
        let mut tasks: Vec<Task<'a>> = Vec::new();
        // Paths whose producing job is resolving its inputs
        let mut active: Vec<String> = Vec::new();
        let mut next = Step::Push(root);

        loop {
            let input = match next {
                Step::Push(task) => {
                    if let Task::Job(job) = &task {
                        active.push(job.requested.clone());
                    }
                    tasks.push(task);
                    None
                }
                Step::Done(result) => {
                    if let Some(Task::Job(_)) = tasks.pop() {
                        active.pop();
                    }
                    if tasks.is_empty() {
                        return result;
                    }
                    Some(result)
                }
            };

            next = match tasks.last_mut() {
                Some(Task::Path(task)) => self.step_path(graph, &active, task, input),
                Some(Task::Job(task)) => self.step_job(graph, task, input),
                None => unreachable!("resolution stack emptied without a result"),
            };
        }
    }

    /// Advances a path task. `input` is the outcome of the job it launched.
    fn step_path(
        &self,
        graph: &mut JobGraph,
        active: &[String],
        task: &mut PathTask<'a>,
        mut input: Option<Resolution>,
    ) -> Step<'a> {
        loop {
            let next = match input.take() {
                None => self.begin_path(graph, active, task),
                Some(result) => self.job_finished(graph, task, result),
            };
            let (rule, binding) = match next {
                PathNext::Done(result) => return Step::Done(result),
                PathNext::Launch(rule, binding) => (rule, binding),
            };
            match self.begin_job(graph, rule, binding, &task.path) {
                Ok(Launch::Task(job)) => return Step::Push(Task::Job(job)),
                Ok(Launch::Existing(id)) => input = Some(Ok(Some(id))),
                Err(e) => input = Some(Err(e)),
            }
        }
    }

    fn begin_path(&self, graph: &mut JobGraph, active: &[String], task: &mut PathTask<'a>) -> PathNext<'a> {
        let path = task.path.as_str();
        if let Some(pos) = active.iter().position(|p| p == path) {
            let mut cycle = active[pos..].to_vec();
            cycle.push(path.to_string());
            return PathNext::Done(Err(GraphError::CyclicDependency { cycle }));
        }

        if let Some(id) = graph.producer_of(path) {
            return PathNext::Done(Ok(Some(id)));
        }
        if graph.is_source(path) {
            return PathNext::Done(Ok(None));
        }

        if active.len() >= self.max_depth {
            let mut cycle = vec!["...".to_string()];
            cycle.extend(active.iter().rev().take(DEPTH_CYCLE_CONTEXT).rev().cloned());
            cycle.push(path.to_string());
            return PathNext::Done(Err(GraphError::CyclicDependency { cycle }));
        }

        let mut candidates = self.rules.producers(path);
        if candidates.is_empty() {
            if self.storage.exists(path) {
                graph.add_source(path);
                return PathNext::Done(Ok(None));
            }
            return PathNext::Done(Err(GraphError::MissingProducer {
                path: path.to_string(),
                required_by: task.required_by.clone(),
            }));
        }

        if candidates.len() == 1 {
            let (rule, binding) = candidates.remove(0);
            return self.build_with(graph, task, rule, binding);
        }

        // Several rules match: only those whose inputs resolve compete.
        let trial = Trial {
            remaining: candidates.into(),
            current: None,
            survivors: Vec::new(),
            missing: None,
            mark: graph.mark(),
        };
        self.next_trial(graph, task, trial)
    }

    fn build_with(
        &self,
        graph: &JobGraph,
        task: &mut PathTask<'a>,
        rule: &'a CompiledRule,
        binding: Wildcards,
    ) -> PathNext<'a> {
        // An existing file is used as it is if its producer cannot be derived.
        let mark = self.storage.exists(&task.path).then(|| graph.mark());
        task.phase = PathPhase::Build { rule, mark };
        PathNext::Launch(rule, binding)
    }

    fn next_trial(&self, graph: &mut JobGraph, task: &mut PathTask<'a>, mut trial: Trial<'a>) -> PathNext<'a> {
        if let Some((rule, binding)) = trial.remaining.pop_front() {
            trial.mark = graph.mark();
            trial.current = Some((rule, binding.clone()));
            task.phase = PathPhase::Trial(trial);
            return PathNext::Launch(rule, binding);
        }

        if trial.survivors.is_empty() {
            if self.storage.exists(&task.path) {
                debug!("Using existing '{}' as source: no matching rule can produce it", task.path);
                graph.add_source(&task.path);
                return PathNext::Done(Ok(None));
            }
            let err = trial.missing.unwrap_or_else(|| GraphError::MissingProducer {
                path: task.path.clone(),
                required_by: task.required_by.clone(),
            });
            return PathNext::Done(Err(err));
        }

        match self.select_producer(&task.path, trial.survivors) {
            Ok((rule, binding)) => self.build_with(graph, task, rule, binding),
            Err(e) => PathNext::Done(Err(e)),
        }
    }

    fn job_finished(&self, graph: &mut JobGraph, task: &mut PathTask<'a>, result: Resolution) -> PathNext<'a> {
        match std::mem::replace(&mut task.phase, PathPhase::Start) {
            PathPhase::Trial(mut trial) => {
                graph.rollback(trial.mark);
                let current = trial.current.take();
                match result {
                    Ok(_) => trial.survivors.extend(current),
                    Err(e @ GraphError::MissingProducer { .. }) => {
                        if let Some((rule, _)) = &current {
                            debug!("Rule '{}' cannot produce '{}': {}", rule.name(), task.path, e);
                        }
                        trial.missing.get_or_insert(e);
                    }
                    Err(e) => return PathNext::Done(Err(e)),
                }
                self.next_trial(graph, task, trial)
            }
            PathPhase::Build { rule, mark } => match (result, mark) {
                (Err(GraphError::MissingProducer { path: missing, .. }), Some(mark)) => {
                    debug!(
                        "Using existing '{}' as source: rule '{}' is missing '{}'",
                        task.path,
                        rule.name(),
                        missing
                    );
                    graph.rollback(mark);
                    graph.add_source(&task.path);
                    PathNext::Done(Ok(None))
                }
                (result, _) => PathNext::Done(result),
            },
            PathPhase::Start => PathNext::Done(result),
        }
    }

    /// Picks the producing rule among several matches.
    fn select_producer(
        &self,
        path: &str,
        mut candidates: Vec<(&'a CompiledRule, Wildcards)>,
    ) -> Result<(&'a CompiledRule, Wildcards), GraphError> {
        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }

        let ambiguous = |candidates: &[(&CompiledRule, Wildcards)]| GraphError::AmbiguousRule {
            path: path.to_string(),
            candidates: candidates.iter().map(|(r, _)| r.name().to_string()).collect(),
        };

        let rank = |rule: &CompiledRule| self.rules.rank(rule.name());
        let fully_ranked = candidates.iter().all(|(r, _)| rank(*r).is_some());

        let chosen = if fully_ranked {
            candidates.sort_by_key(|(r, _)| rank(*r));
            0
        } else {
            match self.ambiguity {
                AmbiguityPolicy::Error => return Err(ambiguous(&candidates)),
                AmbiguityPolicy::RuleOrder => {
                    candidates.sort_by_key(|(r, _)| (rank(*r).unwrap_or(usize::MAX), r.index));
                    0
                }
                AmbiguityPolicy::Priority => {
                    let key = |r: &CompiledRule| (rank(r).unwrap_or(usize::MAX), -r.rule.priority);
                    candidates.sort_by_key(|(r, _)| key(*r));
                    if key(candidates[0].0) == key(candidates[1].0) {
                        return Err(ambiguous(&candidates));
                    }
                    0
                }
            }
        };

        let (rule, binding) = candidates.swap_remove(chosen);
        debug!("Ambiguous producers for '{}' resolved to rule '{}'", path, rule.name());
        Ok((rule, binding))
    }

    /// Starts the job for `rule` under `binding`, or finds it in the graph.
    fn begin_job(
        &self,
        graph: &JobGraph,
        rule: &'a CompiledRule,
        binding: Wildcards,
        requested: &str,
    ) -> Result<Launch<'a>, GraphError> {
        if let Some(id) = graph.find(rule.name(), &binding) {
            return Ok(Launch::Existing(id));
        }

        let resolved = rule.resolve(&binding)?;
        let mut distinct = BTreeSet::new();
        for output in &resolved.outputs {
            if !distinct.insert(output.as_str()) {
                return Err(GraphError::InvalidRule {
                    rule: rule.name().to_string(),
                    reason: format!("outputs collapse to the same path '{}'", output),
                });
            }
        }

        let mut todo: VecDeque<Request> = resolved.inputs.iter().cloned().map(Request::Input).collect();
        for input in &rule.inputs {
            let CompiledInput::Checkpoint {
                checkpoint,
                glob,
                expand,
            } = input
            else {
                continue;
            };

            let cp_rule = self.rule(checkpoint)?;
            let mut cp_binding = Wildcards::new();
            for name in cp_rule.wildcard_names() {
                let value = binding.get(&name).ok_or_else(|| PatternError::AmbiguousWildcards {
                    rule: rule.name().to_string(),
                    wildcard: name.clone(),
                    pattern: glob.raw().to_string(),
                })?;
                cp_binding.insert(name, value.clone());
            }
            let output = match cp_rule.outputs.first() {
                Some(pattern) => cp_rule.apply(pattern, &cp_binding)?,
                None => {
                    return Err(GraphError::InvalidRule {
                        rule: cp_rule.name().to_string(),
                        reason: "checkpoint rules need at least one output".to_string(),
                    })
                }
            };

            todo.push_back(Request::Checkpoint {
                output,
                glob: glob.partially_apply(&binding),
                expand: expand.partially_apply(&binding),
            });
        }

        Ok(Launch::Task(Box::new(JobTask {
            rule,
            label: job_label(rule.name(), &binding),
            binding,
            requested: requested.to_string(),
            inputs: resolved.inputs,
            outputs: resolved.outputs,
            logs: resolved.logs,
            params: resolved.params,
            deps: BTreeSet::new(),
            deferred: Vec::new(),
            todo,
            awaiting: None,
        })))
    }

    /// Advances a job task. `input` is the resolution of the awaited path.
    fn step_job(&self, graph: &mut JobGraph, task: &mut JobTask<'a>, input: Option<Resolution>) -> Step<'a> {
        if let Some(result) = input {
            let dep = match result {
                Ok(dep) => dep,
                Err(e) => return Step::Done(Err(e)),
            };

            match task.awaiting.take() {
                Some(Request::Input(_)) => task.deps.extend(dep),
                Some(Request::Checkpoint { glob, expand, .. }) => match dep {
                    Some(cp_job) => {
                        task.deps.insert(cp_job);
                        task.deferred.push(DeferredInput {
                            checkpoint: cp_job,
                            glob,
                            expand,
                        });
                    }
                    None => {
                        // Checkpoint output exists and nothing rebuilds it.
                        match self.discover(task.rule, &glob, &expand, &task.binding) {
                            Ok(paths) => {
                                for path in paths.into_iter().rev() {
                                    task.todo.push_front(Request::Discovered(path));
                                }
                            }
                            Err(e) => return Step::Done(Err(e)),
                        }
                    }
                },
                Some(Request::Discovered(path)) => {
                    task.deps.extend(dep);
                    if !task.inputs.contains(&path) {
                        task.inputs.push(path);
                    }
                }
                None => {}
            }
        }

        if let Some(request) = task.todo.pop_front() {
            let child = PathTask::new(request.path(), Some(task.label.clone()));
            task.awaiting = Some(request);
            return Step::Push(Task::Path(child));
        }

        Step::Done(self.finish_job(graph, task).map(Some))
    }

    fn finish_job(&self, graph: &mut JobGraph, task: &mut JobTask<'a>) -> Result<JobId, GraphError> {
        let rule = task.rule;
        let binding = std::mem::take(&mut task.binding);
        let inputs = std::mem::take(&mut task.inputs);

        let resources = self.resolve_resources(rule, &binding, &inputs)?;
        self.check_capacity(rule, &binding, &resources)?;

        let job = Job {
            id: JobId(0),
            rule: rule.name().to_string(),
            wildcards: binding,
            inputs,
            outputs: std::mem::take(&mut task.outputs),
            logs: std::mem::take(&mut task.logs),
            params: std::mem::take(&mut task.params),
            threads: rule.rule.threads,
            resources,
            priority: rule.rule.priority,
            group: rule.rule.group.clone(),
            checkpoint: rule.rule.checkpoint,
            localrule: rule.rule.localrule,
            command: rule.rule.command(),
            retries: rule.rule.retries,
            deferred: std::mem::take(&mut task.deferred),
            needrun: false,
            reasons: Vec::new(),
        };

        let id = graph.add_job(job);
        for &dep in &task.deps {
            graph.add_edge(dep, id);
        }
        debug!("Added job {} {}", id, task.label);
        Ok(id)
    }

    /// Lists storage for files matching `glob` and expands each binding.
    fn discover(
        &self,
        rule: &CompiledRule,
        glob: &Pattern,
        expand: &Pattern,
        binding: &Wildcards,
    ) -> Result<Vec<String>, GraphError> {
        let matcher = glob.compile(&rule.rule.wildcard_constraints)?;
        let prefix = glob.literal_prefix();
        let files = self.storage.list_files(&prefix).map_err(|e| GraphError::Storage {
            path: prefix.clone(),
            reason: e.to_string(),
        })?;

        let mut paths = BTreeSet::new();
        for file in files {
            if let Ok(found) = matcher.match_path(&file) {
                let mut full = binding.clone();
                full.extend(found);
                paths.insert(rule.apply(expand, &full)?);
            }
        }

        debug!("Glob '{}' discovered {} file(s)", glob.raw(), paths.len());
        Ok(paths.into_iter().collect())
    }

    fn resolve_resources(
        &self,
        rule: &CompiledRule,
        binding: &Wildcards,
        inputs: &[String],
    ) -> Result<BTreeMap<String, u64>, GraphError> {
        let ctx = EvalContext {
            wildcards: binding,
            input_size: inputs.iter().filter_map(|p| self.storage.size(p)).sum(),
            threads: rule.rule.threads,
        };

        let mut resources = BTreeMap::new();
        resources.insert(CORES_RESOURCE.to_string(), rule.rule.threads);

        let declared = rule.resources.iter();
        let defaults = self
            .default_resources
            .iter()
            .filter(|(name, _)| !rule.resources.contains_key(*name));

        for (name, spec) in declared.chain(defaults) {
            let amount = spec.resolve(&ctx).map_err(|reason| GraphError::ResourceExpression {
                rule: rule.name().to_string(),
                resource: name.clone(),
                reason,
            })?;
            resources.insert(name.clone(), amount);
        }
        Ok(resources)
    }

    fn check_capacity(
        &self,
        rule: &CompiledRule,
        binding: &Wildcards,
        resources: &BTreeMap<String, u64>,
    ) -> Result<(), GraphError> {
        for (name, &requested) in resources {
            if let Some(&capacity) = self.capacity.get(name) {
                if requested > capacity {
                    return Err(GraphError::ResourceUnsatisfiable {
                        rule: rule.name().to_string(),
                        wildcards: binding.clone(),
                        resource: name.clone(),
                        requested,
                        capacity,
                    });
                }
            }
        }
        Ok(())
    }
}

fn job_label(rule: &str, binding: &Wildcards) -> String {
    if binding.is_empty() {
        rule.to_string()
    } else {
        format!("{}[{}]", rule, crate::error::format_binding(binding))
    }
}
