//! Rule Validation
//!
//! Checks a parsed [`Workflow`] and compiles it into a [`RuleSet`]:
//! - Rule names are non-empty and unique
//! - All outputs of a rule declare the same wildcards
//! - Inputs, logs and params only use wildcards the outputs define
//! - `shell` and `script` are mutually exclusive
//! - Checkpoint inputs name an existing checkpoint rule
//! - Wildcard constraints and resource expressions parse
//! - `ruleorder` only names existing rules

use std::collections::{BTreeMap, HashSet};

use log::{debug, error, info, warn};

use crate::error::GraphError;

use super::model::{InputSpec, Rule, Workflow, CORES_RESOURCE};
use super::resources::ResourceSpec;
use super::ruleset::{CompiledInput, CompiledRule, RuleSet};
use super::wildcards::Pattern;

/// Identifiers always available to resource expressions.
const BUILTIN_RESOURCE_IDENTS: &[&str] = &["input_size", "input_size_mb", "threads"];

fn invalid(rule: &Rule, reason: impl Into<String>) -> GraphError {
    GraphError::InvalidRule {
        rule: rule.name.clone(),
        reason: reason.into(),
    }
}

fn parse_all(patterns: &[String]) -> Result<Vec<Pattern>, GraphError> {
    patterns
        .iter()
        .map(|p| Pattern::parse(p.as_str()).map_err(GraphError::from))
        .collect()
}

/// Fails if `pattern` uses a wildcard outside `allowed`.
fn check_subset(rule: &Rule, kind: &str, pattern: &Pattern, allowed: &HashSet<String>) -> Result<(), GraphError> {
    for name in pattern.wildcard_names() {
        if !allowed.contains(&name) {
            return Err(invalid(
                rule,
                format!(
                    "{} '{}' uses wildcard '{{{}}}' which no output defines",
                    kind,
                    pattern.raw(),
                    name
                ),
            ));
        }
    }
    Ok(())
}

/// Validates and compiles one rule.
fn compile_rule(rule: &Rule, index: usize, workflow: &Workflow) -> Result<CompiledRule, GraphError> {
    if rule.name.trim().is_empty() {
        return Err(GraphError::InvalidRule {
            rule: format!("#{}", index + 1),
            reason: "rule has an empty name".to_string(),
        });
    }

    if rule.shell.is_some() && rule.script.is_some() {
        return Err(invalid(rule, "'shell' and 'script' are mutually exclusive"));
    }

    if rule.threads == 0 {
        return Err(invalid(rule, "threads must be at least 1"));
    }

    for (name, re) in &rule.wildcard_constraints {
        regex::Regex::new(re).map_err(|e| {
            invalid(rule, format!("invalid constraint for wildcard '{}': {}", name, e))
        })?;
    }

    if rule.checkpoint && rule.output.is_empty() {
        return Err(invalid(rule, "checkpoint rules need at least one output"));
    }

    // Outputs define the wildcard namespace.
    let outputs = parse_all(&rule.output)?;
    let namespace: HashSet<String> = outputs
        .first()
        .map(|p| p.wildcard_names().into_iter().collect())
        .unwrap_or_default();

    for pattern in outputs.iter().skip(1) {
        let names: HashSet<String> = pattern.wildcard_names().into_iter().collect();
        if names != namespace {
            return Err(invalid(
                rule,
                format!(
                    "output '{}' declares different wildcards than '{}'",
                    pattern.raw(),
                    outputs[0].raw()
                ),
            ));
        }
    }

    let mut seen = HashSet::new();
    for output in &rule.output {
        if !seen.insert(output.as_str()) {
            return Err(invalid(rule, format!("output '{}' is declared twice", output)));
        }
    }

    for name in rule.wildcard_constraints.keys() {
        if !namespace.contains(name) {
            warn!(
                "Rule '{}': constraint for unknown wildcard '{}' is ignored",
                rule.name, name
            );
        }
    }

    let matchers = outputs
        .iter()
        .map(|p| p.compile(&rule.wildcard_constraints))
        .collect::<Result<Vec<_>, _>>()?;

    let mut inputs = Vec::new();
    for spec in &rule.input {
        match spec {
            InputSpec::Path(raw) => {
                let pattern = Pattern::parse(raw.as_str())?;
                check_subset(rule, "input", &pattern, &namespace)?;
                inputs.push(CompiledInput::Path(pattern));
            }
            InputSpec::Checkpoint {
                checkpoint,
                glob,
                expand,
            } => {
                match workflow.get_rule(checkpoint) {
                    Some(target) if target.checkpoint => {}
                    Some(_) => {
                        return Err(invalid(
                            rule,
                            format!("input refers to '{}' which is not a checkpoint", checkpoint),
                        ))
                    }
                    None => {
                        return Err(invalid(
                            rule,
                            format!("input refers to unknown checkpoint '{}'", checkpoint),
                        ))
                    }
                }

                let glob = Pattern::parse(glob.as_str())?;
                if !glob.has_wildcards() {
                    return Err(invalid(
                        rule,
                        format!("checkpoint glob '{}' has no wildcards", glob.raw()),
                    ));
                }
                let expand = match expand {
                    Some(raw) => Pattern::parse(raw.as_str())?,
                    None => glob.clone(),
                };

                let mut allowed = namespace.clone();
                allowed.extend(glob.wildcard_names());
                check_subset(rule, "checkpoint input", &expand, &allowed)?;

                inputs.push(CompiledInput::Checkpoint {
                    checkpoint: checkpoint.clone(),
                    glob,
                    expand,
                });
            }
        }
    }

    let logs = parse_all(&rule.log)?;
    for log in &logs {
        check_subset(rule, "log", log, &namespace)?;
    }

    for value in rule.params.values() {
        if let Ok(pattern) = Pattern::parse(value.as_str()) {
            check_subset(rule, "param", &pattern, &namespace)?;
        }
    }

    let mut resources = BTreeMap::new();
    for (name, value) in &rule.resources {
        if name == CORES_RESOURCE {
            return Err(invalid(
                rule,
                format!("'{}' is reserved, use 'threads' instead", CORES_RESOURCE),
            ));
        }
        let spec = ResourceSpec::from_value(value).map_err(|reason| GraphError::ResourceExpression {
            rule: rule.name.clone(),
            resource: name.clone(),
            reason,
        })?;
        if let ResourceSpec::Expr { expr, .. } = &spec {
            for ident in expr.variables() {
                let key = ident.strip_prefix("wildcards.").unwrap_or(&ident);
                if !BUILTIN_RESOURCE_IDENTS.contains(&ident.as_str()) && !namespace.contains(key) {
                    return Err(GraphError::ResourceExpression {
                        rule: rule.name.clone(),
                        resource: name.clone(),
                        reason: format!("unknown identifier '{}'", ident),
                    });
                }
            }
        }
        resources.insert(name.clone(), spec);
    }

    if rule.command().is_none() && !rule.output.is_empty() {
        debug!("Rule '{}' has outputs but no command", rule.name);
    }

    Ok(CompiledRule::new(
        rule.clone(),
        index,
        outputs,
        matchers,
        inputs,
        logs,
        resources,
    ))
}

/// Validates the workflow and compiles it for matching.
///
/// All rules are checked; every problem is logged and the first one is
/// returned.
pub fn validate_workflow(workflow: &Workflow) -> Result<RuleSet, GraphError> {
    info!("Validating workflow with {} rules", workflow.rules.len());

    let mut errors = Vec::new();
    let mut names = HashSet::new();
    let mut compiled = Vec::new();

    for (index, rule) in workflow.rules.iter().enumerate() {
        if !names.insert(rule.name.as_str()) {
            errors.push(invalid(rule, "duplicate rule name"));
            continue;
        }
        match compile_rule(rule, index, workflow) {
            Ok(rule) => compiled.push(rule),
            Err(e) => errors.push(e),
        }
    }

    for name in &workflow.ruleorder {
        if workflow.get_rule(name).is_none() {
            errors.push(GraphError::InvalidRule {
                rule: name.clone(),
                reason: "named in ruleorder but not defined".to_string(),
            });
        }
    }

    if let Some(first) = errors.first().cloned() {
        for e in &errors {
            error!("{}", e);
        }
        return Err(first);
    }

    debug!("Compiled {} rules", compiled.len());
    Ok(RuleSet::new(compiled, workflow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatternError;

    fn check(rules: Vec<Rule>) -> Result<RuleSet, GraphError> {
        validate_workflow(&Workflow::from_rules(rules))
    }

    fn reason(err: GraphError) -> String {
        match err {
            GraphError::InvalidRule { reason, .. } => reason,
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_valid_workflow() {
        let set = check(vec![
            Rule::new("all").with_input("b.txt"),
            Rule::new("copy")
                .with_input("a.txt")
                .with_output("b.txt")
                .with_shell("cp {input} {output}"),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_duplicate_names() {
        let err = check(vec![Rule::new("a").with_output("x"), Rule::new("a").with_output("y")]).unwrap_err();
        assert_eq!(reason(err), "duplicate rule name");
    }

    #[test]
    fn test_input_wildcard_not_in_output() {
        let err = check(vec![Rule::new("r")
            .with_input("{sample}.fastq")
            .with_output("out.txt")])
        .unwrap_err();
        assert!(reason(err).contains("{sample}"));
    }

    #[test]
    fn test_outputs_must_share_wildcards() {
        let err = check(vec![Rule::new("r")
            .with_output("{a}.txt")
            .with_output("{a}_{b}.txt")])
        .unwrap_err();
        assert!(reason(err).contains("different wildcards"));
    }

    #[test]
    fn test_shell_and_script_exclusive() {
        let err = check(vec![Rule::new("r")
            .with_output("x")
            .with_shell("true")
            .with_script("run.py")])
        .unwrap_err();
        assert!(reason(err).contains("mutually exclusive"));
    }

    #[test]
    fn test_checkpoint_reference() {
        let err = check(vec![
            Rule::new("split").with_output("chunks/{s}.done"),
            Rule::new("merge")
                .with_checkpoint_input("split", "chunks/{s}/{i}.txt", None)
                .with_output("merged/{s}.txt"),
        ])
        .unwrap_err();
        assert!(reason(err).contains("not a checkpoint"));

        assert!(check(vec![
            Rule::new("split").with_output("chunks/{s}.done").as_checkpoint(),
            Rule::new("merge")
                .with_checkpoint_input("split", "chunks/{s}/{i}.txt", None)
                .with_output("merged/{s}.txt"),
        ])
        .is_ok());
    }

    #[test]
    fn test_bad_pattern() {
        let err = check(vec![Rule::new("r").with_output("{x.txt")]).unwrap_err();
        assert!(matches!(err, GraphError::Pattern(PatternError::InvalidPattern { .. })));
    }

    #[test]
    fn test_resource_expression_errors() {
        let err = check(vec![Rule::new("r")
            .with_output("{x}.txt")
            .with_resource("mem_mb", "max(1,")])
        .unwrap_err();
        assert!(matches!(err, GraphError::ResourceExpression { .. }));

        let err = check(vec![Rule::new("r")
            .with_output("{x}.txt")
            .with_resource("mem_mb", "y * 2")])
        .unwrap_err();
        assert!(matches!(err, GraphError::ResourceExpression { ref reason, .. } if reason.contains("'y'")));

        assert!(check(vec![Rule::new("r")
            .with_output("{x}.txt")
            .with_resource("mem_mb", "x * input_size_mb")])
        .is_ok());
    }

    #[test]
    fn test_unknown_ruleorder_entry() {
        let mut workflow = Workflow::from_rules(vec![Rule::new("a").with_output("x")]);
        workflow.ruleorder = vec!["missing".into()];
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn test_reserved_resource() {
        let err = check(vec![Rule::new("r").with_output("x").with_resource("_cores", 2u64)]).unwrap_err();
        assert!(reason(err).contains("reserved"));
    }
}
