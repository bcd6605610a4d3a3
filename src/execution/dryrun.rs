//! Dry-Run Executor
//!
//! Prints what would run and reports success without side effects.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::ExecutorError;

use super::executor::{Executor, ExecutorCapabilities, ExecutorContext, JobHandle, Outcome, Submission};

pub struct DryRunExecutor {
    next_handle: u64,
    finished: VecDeque<JobHandle>,
    submitted: usize,
}

impl DryRunExecutor {
    pub fn new(_ctx: &ExecutorContext) -> Self {
        Self {
            next_handle: 0,
            finished: VecDeque::new(),
            submitted: 0,
        }
    }

    /// Number of jobs previewed so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }
}

impl Executor for DryRunExecutor {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            dryrun_exec: true,
            ..ExecutorCapabilities::default()
        }
    }

    fn submit(&mut self, submission: Submission) -> Result<JobHandle, ExecutorError> {
        for job in &submission.jobs {
            println!();
            println!("[DRY RUN] Job: {}", job.label());
            if let Some(command) = &job.command {
                match command.render(job) {
                    Ok(rendered) => println!("  Command: {}", rendered),
                    Err(e) => println!("  Command: <{}>", e),
                }
            }
            println!("  Input: {:?}", job.inputs);
            println!("  Output: {:?}", job.outputs);
            println!("  Threads: {}", job.threads);
            if !job.reasons.is_empty() {
                println!("  Reason: {}", crate::dag::needrun::describe(&job.reasons));
            }
            self.submitted += 1;
        }

        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;
        self.finished.push_back(handle);
        Ok(handle)
    }

    fn poll(&mut self, _wait: Duration) -> Vec<(JobHandle, Outcome)> {
        self.finished.drain(..).map(|h| (h, Outcome::Success)).collect()
    }

    fn cancel(&mut self, handle: JobHandle) -> Result<(), ExecutorError> {
        if self.finished.contains(&handle) {
            Ok(())
        } else {
            Err(ExecutorError::UnknownHandle(handle.0))
        }
    }

    fn shutdown(&mut self) {
        self.finished.clear();
    }
}
