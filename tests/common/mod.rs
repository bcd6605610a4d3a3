//! Shared fixtures for integration tests: an in-memory engine and a
//! scripted executor that records what it was asked to do.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use ruleflow::dag::{MemoryStorage, Storage};
use ruleflow::error::ExecutorError;
use ruleflow::execution::{Engine, Executor, ExecutorCapabilities, JobHandle, Outcome, Submission};
use ruleflow::workflow::{Rule, Workflow};

static INIT: Once = Once::new();

/// Initialise logging for tests. Enable levels with `RUST_LOG=debug`.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

/// What the fake executor saw.
#[derive(Debug, Default)]
pub struct FakeLog {
    /// Labels of every submission, in submission order
    pub submissions: Vec<Vec<String>>,
    /// Highest concurrent demand per resource
    pub peak: BTreeMap<String, u64>,
    /// Inputs that did not exist when their job was submitted
    pub violations: Vec<String>,
    pub cancelled: usize,
}

impl FakeLog {
    /// Job labels in submission order, flattened.
    pub fn started(&self) -> Vec<String> {
        self.submissions.iter().flatten().cloned().collect()
    }
}

/// Behaviour of the fake executor per rule.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    /// Rule name -> number of attempts that fail
    pub failures: BTreeMap<String, u32>,
    /// Rule name -> extra files written on success
    pub produces: BTreeMap<String, Vec<String>>,
}

impl FakeScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, rule: &str, times: u32) -> Self {
        self.failures.insert(rule.to_string(), times);
        self
    }

    pub fn producing(mut self, rule: &str, files: &[&str]) -> Self {
        self.produces
            .insert(rule.to_string(), files.iter().map(|f| f.to_string()).collect());
        self
    }
}

/// Completes one submission per poll, oldest first.
pub struct FakeExecutor {
    storage: Arc<dyn Storage>,
    script: FakeScript,
    log: Arc<Mutex<FakeLog>>,
    next: u64,
    in_flight: VecDeque<(JobHandle, Submission, BTreeMap<String, u64>)>,
    usage: BTreeMap<String, u64>,
}

impl FakeExecutor {
    pub fn new(storage: Arc<dyn Storage>, script: FakeScript, log: Arc<Mutex<FakeLog>>) -> Self {
        Self {
            storage,
            script,
            log,
            next: 0,
            in_flight: VecDeque::new(),
            usage: BTreeMap::new(),
        }
    }

    fn demand(submission: &Submission) -> BTreeMap<String, u64> {
        let mut demand = BTreeMap::new();
        for job in &submission.jobs {
            for (name, &amount) in &job.resources {
                let entry = demand.entry(name.clone()).or_insert(0);
                *entry = (*entry).max(amount);
            }
        }
        demand
    }

    fn outcome(&mut self, submission: &Submission) -> Outcome {
        for job in &submission.jobs {
            if let Some(left) = self.script.failures.get_mut(&job.rule) {
                if *left > 0 {
                    *left -= 1;
                    return Outcome::Failure(format!("{} failed on purpose", job.label()));
                }
            }
            let extra = self.script.produces.get(&job.rule).cloned().unwrap_or_default();
            for path in job.outputs.iter().chain(extra.iter()) {
                if let Err(e) = self.storage.touch(path) {
                    return Outcome::Failure(e.to_string());
                }
            }
        }
        Outcome::Success
    }
}

impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities::default()
    }

    fn submit(&mut self, submission: Submission) -> Result<JobHandle, ExecutorError> {
        let handle = JobHandle(self.next);
        self.next += 1;

        let demand = Self::demand(&submission);
        let mut log = self.log.lock().unwrap();
        for (name, amount) in &demand {
            let used = self.usage.entry(name.clone()).or_insert(0);
            *used += amount;
            let peak = log.peak.entry(name.clone()).or_insert(0);
            *peak = (*peak).max(*used);
        }
        for job in &submission.jobs {
            for input in &job.inputs {
                if !self.storage.exists(input) && !submission.jobs.iter().any(|j| j.outputs.contains(input)) {
                    log.violations.push(format!("{} started before {} existed", job.label(), input));
                }
            }
        }
        log.submissions
            .push(submission.jobs.iter().map(|j| j.label()).collect());
        drop(log);

        self.in_flight.push_back((handle, submission, demand));
        Ok(handle)
    }

    fn poll(&mut self, _wait: Duration) -> Vec<(JobHandle, Outcome)> {
        let Some((handle, submission, demand)) = self.in_flight.pop_front() else {
            return Vec::new();
        };
        for (name, amount) in &demand {
            if let Some(used) = self.usage.get_mut(name) {
                *used -= amount;
            }
        }
        vec![(handle, self.outcome(&submission))]
    }

    fn cancel(&mut self, _handle: JobHandle) -> Result<(), ExecutorError> {
        self.log.lock().unwrap().cancelled += 1;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.in_flight.clear();
    }
}

/// Engine on `storage` with the fake executor registered and selected.
///
/// Run state is kept below `state_dir`.
pub fn fake_engine(
    workflow: Workflow,
    storage: Arc<MemoryStorage>,
    state_dir: &Path,
    script: FakeScript,
) -> (Engine, Arc<MemoryStorage>, Arc<Mutex<FakeLog>>) {
    init_logging();

    let log = Arc::new(Mutex::new(FakeLog::default()));
    let mut engine = Engine::new(workflow);
    engine.set_storage(storage.clone());
    engine.set_working_dir(state_dir);
    engine.set_workflow_path("rules.yaml");

    let settings = engine.settings_mut();
    settings.executor = "fake".to_string();
    settings.resources.cores = Some(4);
    settings.execution.poll_interval_ms = 1;

    let shared = Arc::clone(&log);
    engine.registry_mut().register("fake", move |ctx| {
        Ok(Box::new(FakeExecutor::new(Arc::clone(&ctx.storage), script.clone(), Arc::clone(&shared)))
            as Box<dyn Executor>)
    });

    (engine, storage, log)
}

/// `name: inputs -> output` with a placeholder command.
pub fn rule(name: &str, inputs: &[&str], output: &str) -> Rule {
    let mut rule = Rule::new(name).with_output(output).with_shell("touch {output}");
    for input in inputs {
        rule = rule.with_input(*input);
    }
    rule
}
