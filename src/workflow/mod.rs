//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing and
//! validating rule-based workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Rule, Workflow)
//! - [`wildcards`]: Path patterns with named wildcards
//! - [`resources`]: Resource expressions evaluated per job
//! - [`parser`]: YAML loading and saving
//! - [`validator`]: Rule checks and compilation into a [`RuleSet`]
//! - [`ruleset`]: Compiled rules used for matching
//! - [`state`]: Metadata persisted between runs

pub mod model;
pub mod parser;
pub mod resources;
pub mod ruleset;
pub mod state;
pub mod validator;
pub mod wildcards;

pub use model::{InputSpec, ResourceValue, Rule, Workflow, CORES_RESOURCE, JOBS_RESOURCE};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use resources::{EvalContext, ResourceExpr, ResourceSpec};
pub use ruleset::{CompiledInput, CompiledRule, ResolvedRule, RuleSet};
pub use state::{OutputRecord, RunState};
pub use validator::validate_workflow;
pub use wildcards::{has_wildcards, match_pattern, CompiledPattern, Pattern, Wildcards};
