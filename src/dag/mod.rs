//! Job Graph Module
//!
//! Turns requested targets into a graph of concrete jobs.
//!
//! # Structure
//!
//! - [`job`]: Jobs, job states and need-run reasons
//! - [`graph`]: The job graph and its traversals
//! - [`storage`]: File system abstraction used for existence and freshness
//! - [`builder`]: Backward resolution from targets to producing rules
//! - [`needrun`]: Freshness analysis
//! - [`export`]: JSON and Graphviz renderings

pub mod builder;
pub mod export;
pub mod graph;
pub mod job;
pub mod needrun;
pub mod storage;

pub use builder::DagBuilder;
pub use export::{export, ExportFormat};
pub use graph::{transitive_reduction, JobGraph};
pub use job::{DeferredInput, Job, JobId, JobState, NeedRunReason};
pub use needrun::analyse;
pub use storage::{LocalStorage, MemoryStorage, Storage};
