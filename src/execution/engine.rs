//! Workflow Execution Engine
//!
//! Ties the pieces of a run together:
//! - Rule validation and job graph derivation
//! - Freshness analysis against storage and the saved run state
//! - Scheduling on the configured executor backend
//! - Resource monitoring and the final report
//!
//! Also hosts the auxiliary operations of the command line: listing rules
//! and resources, output summaries, output deletion and metadata cleanup.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::dag::builder::DagBuilder;
use crate::dag::graph::JobGraph;
use crate::dag::needrun::{analyse, describe};
use crate::dag::storage::{LocalStorage, Storage};
use crate::error::Result;
use crate::monitoring::{HostCapacity, ResourceMonitor};
use crate::scheduler::Scheduler;
use crate::settings::Settings;
use crate::workflow::state::RunState;
use crate::workflow::validator::validate_workflow;
use crate::workflow::{RuleSet, Workflow};

use super::executor::{ExecutorContext, ExecutorRegistry};
use super::report::{RunReport, RunStatus};

/// Interval for resource monitoring samples.
const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Default rule file name, also used to name the state file.
pub const DEFAULT_RULES_FILE: &str = "rules.yaml";

/// Run-wide cancellation switch, safe to share across threads.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// State of one output as reported by [`Engine::summary`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutputSummary {
    pub path: String,
    pub rule: String,
    pub exists: bool,
    /// Why the producing job would run, `None` when it is up to date
    pub reason: Option<String>,
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use ruleflow::execution::Engine;
/// use ruleflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("rules.yaml")?;
///     let mut engine = Engine::new(workflow);
///     engine.settings_mut().resources.cores = Some(4);
///     engine.set_working_dir("/data/analysis");
///
///     let report = engine.run(&[])?;
///     std::process::exit(report.status.exit_code());
/// }
/// ```
pub struct Engine {
    workflow: Workflow,
    workflow_path: String,
    settings: Settings,
    registry: ExecutorRegistry,
    storage: Option<Arc<dyn Storage>>,
    abort: AbortHandle,
}

impl Engine {
    /// Creates an engine with default settings and the built-in backends.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            workflow_path: DEFAULT_RULES_FILE.to_string(),
            settings: Settings::default(),
            registry: ExecutorRegistry::with_builtins(),
            storage: None,
            abort: AbortHandle::default(),
        }
    }

    /// Sets the rule file path (used to name the state file).
    pub fn set_workflow_path(&mut self, path: impl Into<String>) {
        self.workflow_path = path.into();
    }

    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Sets the directory relative paths are resolved against.
    pub fn set_working_dir(&mut self, dir: impl Into<PathBuf>) {
        self.settings.execution.working_dir = Some(dir.into());
    }

    /// Sets the path for pause/resume signaling.
    pub fn set_pause_flag_path(&mut self, path: impl Into<PathBuf>) {
        self.settings.execution.pause_flag = Some(path.into());
    }

    /// Replaces the local file system with another storage backend.
    pub fn set_storage(&mut self, storage: Arc<dyn Storage>) {
        self.storage = Some(storage);
    }

    /// Backends available to [`run`](Self::run), for registering more.
    pub fn registry_mut(&mut self) -> &mut ExecutorRegistry {
        &mut self.registry
    }

    /// Handle that aborts a run in progress.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn working_dir(&self) -> PathBuf {
        match &self.settings.execution.working_dir {
            Some(dir) => dir.clone(),
            None => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    fn storage(&self) -> Arc<dyn Storage> {
        match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => Arc::new(LocalStorage::new(self.working_dir())),
        }
    }

    fn load_state(&self) -> RunState {
        RunState::load_or_new(&self.workflow_path, &self.working_dir())
    }

    /// Validated copy of the settings.
    ///
    /// Operations that never run commands fall back to host cores.
    fn prepare_settings(&self, for_execution: bool) -> Result<Settings> {
        let mut settings = self.settings.clone();
        let host = HostCapacity::detect();
        if !for_execution && settings.resources.cores.is_none() {
            settings.resources.cores = Some(host.cores);
        }
        settings.validate(host.cores)?;
        Ok(settings)
    }

    fn rules(&self) -> Result<RuleSet> {
        Ok(validate_workflow(&self.workflow)?)
    }

    fn resolve_targets(rules: &RuleSet, targets: &[String]) -> Vec<String> {
        if targets.is_empty() {
            rules.default_targets().to_vec()
        } else {
            targets.to_vec()
        }
    }

    /// Builds and analyses the job graph without running anything.
    pub fn build_graph(&self, targets: &[String]) -> Result<JobGraph> {
        let settings = self.prepare_settings(false)?;
        let rules = self.rules()?;
        let storage = self.storage();
        let state = self.load_state();

        let builder = DagBuilder::new(&rules, storage.as_ref(), &settings)?;
        let mut graph = builder.build(&Self::resolve_targets(&rules, targets))?;
        let needrun = analyse(&mut graph, storage.as_ref(), &state, &settings.execution, None);
        info!("{} of {} job(s) need to run", needrun, graph.len());
        Ok(graph)
    }

    /// Executes the workflow for `targets` (the default targets if empty).
    ///
    /// Graph construction errors are returned before anything runs. Job
    /// failures do not make this fail; they are part of the report.
    pub fn run(&mut self, targets: &[String]) -> Result<RunReport> {
        let start_time = Instant::now();
        let settings = self.prepare_settings(true)?;
        let rules = self.rules()?;
        let storage = self.storage();
        let mut state = self.load_state();
        let targets = Self::resolve_targets(&rules, targets);

        let builder = DagBuilder::new(&rules, storage.as_ref(), &settings)?;
        let mut graph = builder.build(&targets)?;
        let needrun = analyse(&mut graph, storage.as_ref(), &state, &settings.execution, None);

        let ctx = ExecutorContext {
            settings: settings.clone(),
            storage: Arc::clone(&storage),
            working_dir: self.working_dir(),
        };
        let mut executor = self.registry.create(&settings.executor, &ctx)?;

        info!(
            "Starting execution ({} of {} job(s) to run, cores: {}, executor: {})",
            needrun,
            graph.len(),
            settings.cores(),
            settings.executor
        );

        // Start resource monitoring
        let monitor_running = Arc::new(AtomicBool::new(true));
        let monitor_flag = Arc::clone(&monitor_running);
        let monitor_handle = thread::spawn(move || {
            let mut monitor = ResourceMonitor::new();
            while monitor_flag.load(Ordering::Relaxed) {
                monitor.sample();
                thread::sleep(MONITOR_SAMPLE_INTERVAL);
            }
            monitor
        });

        let mut scheduler = Scheduler::new(graph, &settings, Arc::clone(&storage), &mut state)
            .with_builder(&builder)
            .with_abort_flag(self.abort.flag());
        let report = scheduler.run(executor.as_mut());

        // Stop monitoring
        monitor_running.store(false, Ordering::Relaxed);
        let final_monitor = match monitor_handle.join() {
            Ok(monitor) => Some(monitor),
            Err(_) => {
                warn!("Monitor thread panicked");
                None
            }
        };

        println!("{}", report.summary());
        if report.status == RunStatus::NothingToDo {
            return Ok(report);
        }

        if report.dispatched > 0 {
            println!("{}", scheduler.timeline().gantt_chart());
        }
        if let Some(monitor) = final_monitor {
            println!("{}", monitor.get_summary());
        }
        info!("Run finished in {:.2?}", start_time.elapsed());

        Ok(report)
    }

    /// Rule names in declaration order.
    pub fn list_rules(&self) -> Vec<String> {
        self.workflow.rules.iter().map(|r| r.name.clone()).collect()
    }

    /// Resource names declared by rules, limits and default resources.
    pub fn list_resources(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .workflow
            .rules
            .iter()
            .flat_map(|r| r.resources.keys().cloned())
            .collect();
        names.extend(self.settings.resources.limits.keys().cloned());
        names.extend(self.settings.resources.default_resources.keys().cloned());
        names
    }

    /// Every output of the graph for `targets` with its status.
    pub fn summary(&self, targets: &[String]) -> Result<Vec<OutputSummary>> {
        let graph = self.build_graph(targets)?;
        let storage = self.storage();

        let mut rows = Vec::new();
        for job in graph.jobs() {
            let reason = job.needrun.then(|| describe(&job.reasons));
            for output in &job.outputs {
                rows.push(OutputSummary {
                    path: output.clone(),
                    rule: job.rule.clone(),
                    exists: storage.exists(output),
                    reason: reason.clone(),
                });
            }
        }
        Ok(rows)
    }

    /// Removes every existing output of the graph for `targets`.
    ///
    /// Returns the affected paths. With `dry_run` nothing is removed.
    pub fn delete_output(&self, targets: &[String], dry_run: bool) -> Result<Vec<String>> {
        let graph = self.build_graph(targets)?;
        let storage = self.storage();
        let mut state = self.load_state();

        let mut deleted = Vec::new();
        for output in graph.jobs().iter().flat_map(|j| j.outputs.iter()) {
            if !storage.exists(output) {
                continue;
            }
            if dry_run {
                println!("Would delete {}", output);
            } else {
                storage.remove(output)?;
                state.forget(output);
                info!("Deleted {}", output);
            }
            deleted.push(output.clone());
        }

        if !dry_run {
            state.save()?;
        }
        Ok(deleted)
    }

    /// Drops all persisted run state (incomplete markers and records).
    pub fn cleanup_metadata(&self) -> Result<()> {
        let state = self.load_state();
        state.delete()?;
        info!("Removed run metadata for {}", self.workflow_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use crate::dag::storage::MemoryStorage;
    use crate::workflow::Rule;

    fn create_test_workflow() -> Workflow {
        let mut workflow = Workflow::from_rules(vec![
            Rule::new("step1")
                .with_output("output1.txt")
                .with_shell("echo 'test1' > {output}"),
            Rule::new("step2")
                .with_input("output1.txt")
                .with_output("output2.txt")
                .with_shell("cat {input} > {output}"),
        ]);
        workflow.targets = vec!["output2.txt".to_string()];
        workflow
    }

    fn engine_in(dir: &std::path::Path) -> Engine {
        let mut engine = Engine::new(create_test_workflow());
        engine.set_working_dir(dir);
        engine.set_workflow_path(dir.join("rules.yaml").to_string_lossy());
        engine.settings_mut().resources.cores = Some(2);
        engine
    }

    #[test]
    fn test_engine_creation() {
        let engine = Engine::new(create_test_workflow());
        assert_eq!(engine.workflow_path, DEFAULT_RULES_FILE);
        assert_eq!(engine.settings().executor, "local");
        assert!(!engine.abort_handle().is_aborted());
    }

    #[test]
    fn test_engine_configuration() {
        let mut engine = Engine::new(create_test_workflow());
        engine.set_workflow_path("test.yaml");
        engine.set_pause_flag_path("/tmp/pause.flag");
        engine.settings_mut().resources.cores = Some(8);

        assert_eq!(engine.workflow_path, "test.yaml");
        assert_eq!(engine.settings().execution.pause_flag, Some(PathBuf::from("/tmp/pause.flag")));
        assert_eq!(engine.settings().resources.cores, Some(8));
    }

    #[test]
    fn test_local_run_requires_cores() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());
        engine.settings_mut().resources.cores = None;
        assert!(engine.run(&[]).is_err());
    }

    #[test]
    fn test_local_execution() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());

        let report = engine.run(&[]).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        let content = fs::read_to_string(temp_dir.path().join("output2.txt")).unwrap();
        assert_eq!(content.trim(), "test1");

        // Second run has nothing to do.
        let report = engine.run(&[]).unwrap();
        assert_eq!(report.status, RunStatus::NothingToDo);
        assert_eq!(report.dispatched, 0);
    }

    #[test]
    fn test_dry_run_execution() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());
        engine.settings_mut().executor = "dryrun".to_string();

        let report = engine.run(&[]).unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert!(!temp_dir.path().join("output1.txt").exists());
    }

    #[test]
    fn test_unknown_executor() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());
        engine.settings_mut().executor = "cluster".to_string();

        let err = engine.run(&[]).unwrap_err();
        assert!(err.to_string().contains("cluster"));
    }

    #[test]
    fn test_summary_and_delete_output() {
        let storage = Arc::new(MemoryStorage::new());
        storage.add_file("output1.txt", "x");
        let mut engine = Engine::new(create_test_workflow());
        engine.set_storage(storage.clone());

        let rows = engine.summary(&[]).unwrap();
        assert_eq!(rows.len(), 2);
        let first = rows.iter().find(|r| r.path == "output1.txt").unwrap();
        assert!(first.exists);
        assert!(first.reason.is_none());
        let second = rows.iter().find(|r| r.path == "output2.txt").unwrap();
        assert!(second.reason.as_deref().unwrap().contains("output2.txt"));

        let would = engine.delete_output(&[], true).unwrap();
        assert_eq!(would, vec!["output1.txt".to_string()]);
        assert!(storage.exists("output1.txt"));
    }

    #[test]
    fn test_list_rules_and_resources() {
        let mut workflow = create_test_workflow();
        workflow.rules[0].resources.insert("gpu".into(), 1.into());
        let mut engine = Engine::new(workflow);
        engine.settings_mut().resources.limits.insert("mem_mb".into(), 1000);

        assert_eq!(engine.list_rules(), vec!["step1", "step2"]);
        let resources: Vec<String> = engine.list_resources().into_iter().collect();
        assert_eq!(resources, vec!["gpu", "mem_mb"]);
    }

    #[test]
    fn test_cleanup_metadata() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());
        engine.run(&[]).unwrap();

        let state_file = RunState::state_file_path_for(&engine.workflow_path, temp_dir.path());
        assert!(state_file.exists());
        engine.cleanup_metadata().unwrap();
        assert!(!state_file.exists());
    }

    #[test]
    fn test_abort_before_run() {
        let temp_dir = tempdir().unwrap();
        let mut engine = engine_in(temp_dir.path());
        engine.abort_handle().abort();

        let report = engine.run(&[]).unwrap();
        assert!(report.aborted);
        assert_eq!(report.status, RunStatus::CompletedWithFailures);
    }
}
