//! Touch Executor
//!
//! Marks outputs as fresh by bumping their modification time, creating
//! missing ones. Commands are never run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::dag::storage::Storage;
use crate::error::ExecutorError;

use super::executor::{Executor, ExecutorCapabilities, ExecutorContext, JobHandle, Outcome, Submission};

pub struct TouchExecutor {
    storage: Arc<dyn Storage>,
    next_handle: u64,
    finished: VecDeque<(JobHandle, Outcome)>,
}

impl TouchExecutor {
    pub fn new(ctx: &ExecutorContext) -> Self {
        Self {
            storage: Arc::clone(&ctx.storage),
            next_handle: 0,
            finished: VecDeque::new(),
        }
    }

    fn touch_all(&self, submission: &Submission) -> Outcome {
        for job in &submission.jobs {
            for output in &job.outputs {
                if let Err(e) = self.storage.touch(output) {
                    return Outcome::Failure(format!("cannot touch '{}': {}", output, e));
                }
            }
            info!("Touched outputs of {}", job.label());
        }
        Outcome::Success
    }
}

impl Executor for TouchExecutor {
    fn name(&self) -> &str {
        "touch"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            touch_exec: true,
            ..ExecutorCapabilities::default()
        }
    }

    fn submit(&mut self, submission: Submission) -> Result<JobHandle, ExecutorError> {
        let handle = JobHandle(self.next_handle);
        self.next_handle += 1;
        let outcome = self.touch_all(&submission);
        self.finished.push_back((handle, outcome));
        Ok(handle)
    }

    fn poll(&mut self, _wait: Duration) -> Vec<(JobHandle, Outcome)> {
        self.finished.drain(..).collect()
    }

    fn cancel(&mut self, handle: JobHandle) -> Result<(), ExecutorError> {
        if self.finished.iter().any(|(h, _)| *h == handle) {
            Ok(())
        } else {
            Err(ExecutorError::UnknownHandle(handle.0))
        }
    }

    fn shutdown(&mut self) {
        self.finished.clear();
    }
}
