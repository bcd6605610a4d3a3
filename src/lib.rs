//! RuleFlow - Rule-Based Workflow Engine
//!
//! Derives a graph of concrete jobs from declarative rules with wildcard
//! path patterns, decides what is out of date and runs the rest in
//! parallel under resource constraints.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Rule definitions, wildcard patterns and run state
//! - [`dag`]: Job graph derivation, freshness analysis and export
//! - [`scheduler`]: Resource-aware dispatch of ready jobs
//! - [`execution`]: Executor backends and the engine façade
//! - [`monitoring`]: Resource usage tracking and execution timeline
//! - [`settings`]: Run configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use ruleflow::execution::Engine;
//! use ruleflow::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load rules from YAML
//!     let workflow = load_workflow("rules.yaml")?;
//!
//!     // Create execution engine
//!     let mut engine = Engine::new(workflow);
//!     engine.settings_mut().resources.cores = Some(4);
//!     engine.set_working_dir("/data/analysis");
//!
//!     // Build the default targets
//!     let report = engine.run(&[])?;
//!     println!("{:?}", report.status);
//!     Ok(())
//! }
//! ```

pub mod dag;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod scheduler;
pub mod settings;
pub mod workflow;

// Re-export commonly used types
pub use dag::{DagBuilder, JobGraph, JobId, JobState};
pub use error::{Error, Result};
pub use execution::{Engine, RunReport, RunStatus};
pub use settings::Settings;
pub use workflow::model::{Rule, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleFlow";
