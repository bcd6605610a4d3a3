//! Rule File Parser
//!
//! Handles loading and saving rule files. A rule file is a YAML document
//! with a `rules` list and optional `ruleorder` and `targets` lists; see
//! [`model`](super::model) for the format.

use std::fs;
use std::path::Path;

use log::{debug, info, warn};

use crate::error::Result;

use super::model::Workflow;

/// Parses a rule file from a YAML string.
pub fn parse_workflow(yaml: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_yaml::from_str(yaml)?;

    info!(
        "Parsed {} rules ({} ranked, {} default targets)",
        workflow.rules.len(),
        workflow.ruleorder.len(),
        workflow.targets.len()
    );

    for rule in &workflow.rules {
        if rule.command().is_none() && !rule.output.is_empty() {
            warn!(
                "Rule '{}' declares outputs but has no shell or script",
                rule.name
            );
        }
    }

    Ok(workflow)
}

/// Loads a rule file.
///
/// The rules are only parsed here; validation happens when the rule set is
/// compiled (see [`validate_workflow`](super::validator::validate_workflow)).
///
/// # Example
///
/// ```rust,no_run
/// use ruleflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("rules.yaml")?;
///     println!("Loaded {} rules", workflow.rules.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow> {
    let path = path.as_ref();
    info!("Loading rules from: {}", path.display());

    let yaml_content = fs::read_to_string(path)?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflow(&yaml_content)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &Workflow, path: impl AsRef<Path>) -> Result<()> {
    let yaml_content = serde_yaml::to_string(workflow)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Rules saved to: {}", path.as_ref().display());
    Ok(())
}
