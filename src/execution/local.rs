//! Local Executor
//!
//! Runs each submitted unit on its own worker thread. Every job becomes a
//! bash script executed in the working directory; the worker reports the
//! unit's outcome over a channel that [`LocalExecutor::poll`] drains.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::dag::job::Job;
use crate::error::ExecutorError;

use super::command::{create_job_script, ensure_output_directories, job_environment, MEMORY_RESOURCE};
use super::executor::{Executor, ExecutorCapabilities, ExecutorContext, JobHandle, Outcome, Submission};

/// How often a worker checks its child process and cancel flag.
const WAIT_INTERVAL: Duration = Duration::from_millis(50);

struct Worker {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Subprocess backend.
pub struct LocalExecutor {
    working_dir: PathBuf,
    enforce_memory: bool,
    next_handle: u64,
    workers: HashMap<JobHandle, Worker>,
    tx: Sender<(JobHandle, Outcome)>,
    rx: Receiver<(JobHandle, Outcome)>,
    shut_down: bool,
}

impl LocalExecutor {
    pub fn new(ctx: &ExecutorContext) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            working_dir: ctx.working_dir.clone(),
            enforce_memory: ctx.settings.execution.enforce_memory,
            next_handle: 0,
            workers: HashMap::new(),
            tx,
            rx,
            shut_down: false,
        }
    }

    /// Units still running.
    pub fn active(&self) -> usize {
        self.workers.len()
    }

    fn finish(&mut self, handle: JobHandle) {
        if let Some(mut worker) = self.workers.remove(&handle) {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("Worker for {} panicked", handle);
                }
            }
        }
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            local_exec: true,
            ..ExecutorCapabilities::default()
        }
    }

    fn submit(&mut self, submission: Submission) -> Result<JobHandle, ExecutorError> {
        if self.shut_down {
            return Err(ExecutorError::SubmissionRejected(
                "executor has been shut down".to_string(),
            ));
        }
        if submission.jobs.is_empty() {
            return Err(ExecutorError::SubmissionRejected("empty submission".to_string()));
        }

        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let tx = self.tx.clone();
        let working_dir = self.working_dir.clone();
        let enforce_memory = self.enforce_memory;

        let thread = thread::Builder::new()
            .name(format!("ruleflow-job-{}", handle.0))
            .spawn(move || {
                let outcome = run_unit(&submission, &working_dir, enforce_memory, &flag);
                // The receiver is gone only after shutdown.
                let _ = tx.send((handle, outcome));
            })?;

        self.workers.insert(
            handle,
            Worker {
                cancel,
                thread: Some(thread),
            },
        );
        Ok(handle)
    }

    fn poll(&mut self, wait: Duration) -> Vec<(JobHandle, Outcome)> {
        let mut events = Vec::new();
        match self.rx.recv_timeout(wait) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        events.extend(self.rx.try_iter());

        for (handle, _) in &events {
            self.finish(*handle);
        }
        events
    }

    fn cancel(&mut self, handle: JobHandle) -> Result<(), ExecutorError> {
        let worker = self
            .workers
            .get(&handle)
            .ok_or(ExecutorError::UnknownHandle(handle.0))?;
        worker.cancel.store(true, Ordering::SeqCst);
        debug!("Cancellation requested for {}", handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if !self.workers.is_empty() {
            info!("Stopping {} running job(s)", self.workers.len());
        }
        for worker in self.workers.values() {
            worker.cancel.store(true, Ordering::SeqCst);
        }
        let handles: Vec<JobHandle> = self.workers.keys().copied().collect();
        for handle in handles {
            self.finish(handle);
        }
        // Outcomes of cancelled units are no longer of interest.
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs the jobs of a unit in order, stopping at the first failure.
fn run_unit(submission: &Submission, working_dir: &Path, enforce_memory: bool, cancel: &AtomicBool) -> Outcome {
    for job in &submission.jobs {
        if cancel.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }
        let outcome = run_job(job, submission.attempt, working_dir, enforce_memory, cancel);
        if outcome != Outcome::Success {
            return outcome;
        }
    }
    Outcome::Success
}

fn run_job(job: &Job, attempt: u32, working_dir: &Path, enforce_memory: bool, cancel: &AtomicBool) -> Outcome {
    let label = job.label();

    if let Err(e) = ensure_output_directories(job, working_dir) {
        return Outcome::Failure(format!("cannot create output directories: {}", e));
    }

    let command = match &job.command {
        Some(template) => match template.render(job) {
            Ok(command) => command,
            Err(e) => return Outcome::Failure(e.to_string()),
        },
        None => return Outcome::Success,
    };
    debug!("Job {}: {}", label, command);

    let memory_limit = Some(job.demand(MEMORY_RESOURCE)).filter(|&mb| enforce_memory && mb > 0);
    let script_path = match create_job_script(job.id, attempt, &command, memory_limit) {
        Ok(path) => path,
        Err(e) => return Outcome::Failure(format!("cannot create job script: {}", e)),
    };
    let stdout_path = script_path.with_extension("stdout");
    let stderr_path = script_path.with_extension("stderr");

    let outcome = match execute_script(job, &script_path, &stdout_path, &stderr_path, working_dir, cancel) {
        Ok(None) => Outcome::Cancelled,
        Ok(Some(status)) if status.success() => {
            let stdout = fs::read_to_string(&stdout_path).unwrap_or_default();
            if !stdout.trim().is_empty() {
                debug!("Job '{}' output:\n{}", label, stdout);
            }
            Outcome::Success
        }
        Ok(Some(status)) => {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            error!("Job '{}' failed with exit code: {:?}", label, status.code());
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            let code = status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "terminated by signal".to_string());
            if detail.is_empty() {
                Outcome::Failure(code)
            } else {
                Outcome::Failure(format!("{}: {}", code, detail.trim()))
            }
        }
        Err(e) => Outcome::Failure(format!("cannot start job: {}", e)),
    };

    for path in [&script_path, &stdout_path, &stderr_path] {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to clean up {}: {}", path.display(), e);
        }
    }
    outcome
}

/// Runs the script to completion. `Ok(None)` if it was killed on request.
fn execute_script(
    job: &Job,
    script_path: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
    working_dir: &Path,
    cancel: &AtomicBool,
) -> std::io::Result<Option<ExitStatus>> {
    let mut command = Command::new("bash");
    command
        .arg(script_path)
        .current_dir(working_dir)
        .envs(job_environment(job))
        .stdin(Stdio::null())
        .stdout(File::create(stdout_path)?)
        .stderr(File::create(stderr_path)?);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn()?;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if cancel.load(Ordering::SeqCst) {
            warn!("Killing job '{}'", job.label());
            kill_process_group(&mut child)?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(WAIT_INTERVAL);
    }
}

/// Kills the script together with anything it started in the background.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let group = format!("-{}", child.id());
    match Command::new("kill").args(["-KILL", "--", group.as_str()]).stderr(Stdio::null()).status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => {
            debug!("kill {} exited with {}, killing the script only", group, status);
            child.kill()
        }
        Err(e) => {
            debug!("Could not run kill for {}: {}", group, e);
            child.kill()
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::job;
    use crate::dag::storage::MemoryStorage;
    use crate::execution::command::CommandTemplate;
    use crate::settings::Settings;
    use std::time::Instant;
    use tempfile::tempdir;

    fn executor(dir: &Path) -> LocalExecutor {
        LocalExecutor::new(&ExecutorContext {
            settings: Settings::default(),
            storage: Arc::new(MemoryStorage::new()),
            working_dir: dir.to_path_buf(),
        })
    }

    fn shell_job(id: usize, rule: &str, command: &str) -> Job {
        let mut j = job(id, rule);
        j.command = Some(CommandTemplate::Shell(command.to_string()));
        j
    }

    fn wait_for(executor: &mut LocalExecutor, handle: JobHandle) -> Outcome {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            for (h, outcome) in executor.poll(Duration::from_millis(100)) {
                if h == handle {
                    return outcome;
                }
            }
        }
        panic!("no outcome for {}", handle);
    }

    fn submit(executor: &mut LocalExecutor, jobs: Vec<Job>) -> JobHandle {
        executor.submit(Submission { jobs, attempt: 1 }).unwrap()
    }

    #[test]
    fn test_runs_command_in_working_dir() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let mut j = shell_job(0, "write", "echo $RULEFLOW_THREADS > {output}");
        j.outputs = vec!["nested/out.txt".into()];

        let handle = submit(&mut exec, vec![j]);
        assert_eq!(wait_for(&mut exec, handle), Outcome::Success);
        let content = fs::read_to_string(dir.path().join("nested/out.txt")).unwrap();
        assert_eq!(content.trim(), "1");
        assert_eq!(exec.active(), 0);
    }

    #[test]
    fn test_failure_reports_stderr() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let handle = submit(&mut exec, vec![shell_job(0, "bad", "echo boom >&2; exit 3")]);
        match wait_for(&mut exec, handle) {
            Outcome::Failure(reason) => {
                assert!(reason.contains("exit code 3"));
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pipefail() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let handle = submit(&mut exec, vec![shell_job(0, "pipe", "false | cat")]);
        assert!(matches!(wait_for(&mut exec, handle), Outcome::Failure(_)));
    }

    #[test]
    fn test_group_runs_in_order() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let handle = submit(
            &mut exec,
            vec![
                shell_job(0, "first", "echo a > {output}"),
                shell_job(1, "second", "cat first.out > {output}; echo b >> {output}"),
            ],
        );
        assert_eq!(wait_for(&mut exec, handle), Outcome::Success);
        let content = fs::read_to_string(dir.path().join("second.out")).unwrap();
        assert_eq!(content, "a\nb\n");
    }

    #[test]
    fn test_cancel_kills_job() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let handle = submit(&mut exec, vec![shell_job(0, "slow", "sleep 30")]);
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        exec.cancel(handle).unwrap();
        assert_eq!(wait_for(&mut exec, handle), Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    fn process_alive(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
            Err(_) => false,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_kills_background_processes() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        let handle = submit(
            &mut exec,
            vec![shell_job(0, "bg", "sleep 30 & echo $! > bg.pid; wait")],
        );
        let pid_file = dir.path().join("bg.pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(100));
        let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();

        exec.cancel(handle).unwrap();
        assert_eq!(wait_for(&mut exec, handle), Outcome::Cancelled);

        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(&pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!process_alive(&pid), "background sleep {} survived cancellation", pid);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let dir = tempdir().unwrap();
        let mut exec = executor(dir.path());
        exec.shutdown();
        let err = exec
            .submit(Submission {
                jobs: vec![shell_job(0, "x", "true")],
                attempt: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ExecutorError::SubmissionRejected(_)));
        assert!(matches!(exec.cancel(JobHandle(7)), Err(ExecutorError::UnknownHandle(7))));
    }
}
