//! Workflow Execution Module
//!
//! Runs jobs through pluggable executor backends and reports the outcome.
//!
//! # Architecture
//!
//! - [`executor`]: The backend interface and the backend registry
//! - [`local`]: Runs job commands in bash subprocesses
//! - [`dryrun`]: Previews jobs without running anything
//! - [`touch`]: Marks outputs as up to date
//! - [`command`]: Command template rendering and job scripts
//! - [`engine`]: Main entry point orchestrating a whole run
//! - [`report`]: Per-job outcome of a run

pub mod command;
pub mod dryrun;
pub mod engine;
pub mod executor;
pub mod local;
pub mod report;
pub mod touch;

pub use command::CommandTemplate;
pub use dryrun::DryRunExecutor;
pub use engine::{AbortHandle, Engine, OutputSummary};
pub use executor::{
    Executor, ExecutorCapabilities, ExecutorContext, ExecutorRegistry, JobHandle, Outcome, Submission,
};
pub use local::LocalExecutor;
pub use report::{JobReport, RunReport, RunStatus};
pub use touch::TouchExecutor;
