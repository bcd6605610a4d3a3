//! Compiled Rule Set
//!
//! The validated, ready-to-match form of a [`Workflow`]. Patterns are parsed
//! and compiled once; the DAG builder asks the rule set which rules can
//! produce a path and resolves a rule against a wildcard binding.

use std::collections::{BTreeMap, HashMap};

use crate::error::PatternError;

use super::model::{Rule, Workflow};
use super::resources::ResourceSpec;
use super::wildcards::{CompiledPattern, Pattern, Wildcards};

/// An input declaration after parsing.
#[derive(Debug, Clone)]
pub enum CompiledInput {
    Path(Pattern),
    Checkpoint {
        checkpoint: String,
        glob: Pattern,
        expand: Pattern,
    },
}

/// Concrete paths and params of a rule under one binding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRule {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub logs: Vec<String>,
    pub params: BTreeMap<String, String>,
}

/// A rule with its patterns compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    /// Position in the rule file.
    pub index: usize,
    pub outputs: Vec<Pattern>,
    matchers: Vec<CompiledPattern>,
    pub inputs: Vec<CompiledInput>,
    pub logs: Vec<Pattern>,
    pub resources: BTreeMap<String, ResourceSpec>,
}

impl CompiledRule {
    pub(crate) fn new(
        rule: Rule,
        index: usize,
        outputs: Vec<Pattern>,
        matchers: Vec<CompiledPattern>,
        inputs: Vec<CompiledInput>,
        logs: Vec<Pattern>,
        resources: BTreeMap<String, ResourceSpec>,
    ) -> Self {
        Self {
            rule,
            index,
            outputs,
            matchers,
            inputs,
            logs,
            resources,
        }
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    /// Wildcards defined by the outputs.
    pub fn wildcard_names(&self) -> Vec<String> {
        self.outputs
            .first()
            .map(|p| p.wildcard_names())
            .unwrap_or_default()
    }

    /// True if the rule has checkpoint-dependent inputs.
    pub fn has_checkpoint_inputs(&self) -> bool {
        self.inputs
            .iter()
            .any(|i| matches!(i, CompiledInput::Checkpoint { .. }))
    }

    /// Binds wildcards by matching `path` against the output patterns.
    ///
    /// The first output pattern that matches wins.
    pub fn match_output(&self, path: &str) -> Option<Wildcards> {
        self.matchers.iter().find_map(|m| m.match_path(path).ok())
    }

    /// Substitutes `binding` into a pattern of this rule.
    pub fn apply(&self, pattern: &Pattern, binding: &Wildcards) -> Result<String, PatternError> {
        pattern
            .apply(binding)
            .map_err(|wildcard| PatternError::AmbiguousWildcards {
                rule: self.rule.name.clone(),
                wildcard,
                pattern: pattern.raw().to_string(),
            })
    }

    /// Resolves plain inputs, outputs, logs and params under `binding`.
    ///
    /// Checkpoint inputs are left to the DAG builder.
    pub fn resolve(&self, binding: &Wildcards) -> Result<ResolvedRule, PatternError> {
        let mut inputs = Vec::new();
        for input in &self.inputs {
            if let CompiledInput::Path(pattern) = input {
                inputs.push(self.apply(pattern, binding)?);
            }
        }

        let outputs = self
            .outputs
            .iter()
            .map(|p| self.apply(p, binding))
            .collect::<Result<Vec<_>, _>>()?;

        let logs = self
            .logs
            .iter()
            .map(|p| self.apply(p, binding))
            .collect::<Result<Vec<_>, _>>()?;

        let mut params = BTreeMap::new();
        for (name, value) in &self.rule.params {
            let resolved = match Pattern::parse(value.as_str()) {
                Ok(pattern) => self.apply(&pattern, binding)?,
                Err(_) => value.clone(),
            };
            params.insert(name.clone(), resolved);
        }

        Ok(ResolvedRule {
            inputs,
            outputs,
            logs,
            params,
        })
    }
}

/// All rules of a workflow, compiled and indexed.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    by_name: HashMap<String, usize>,
    ruleorder: Vec<String>,
    default_targets: Vec<String>,
}

impl RuleSet {
    pub(crate) fn new(rules: Vec<CompiledRule>, workflow: &Workflow) -> Self {
        let by_name = rules
            .iter()
            .enumerate()
            .map(|(i, r)| (r.rule.name.clone(), i))
            .collect();

        Self {
            rules,
            by_name,
            ruleorder: workflow.ruleorder.clone(),
            default_targets: workflow.default_targets(),
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&CompiledRule> {
        self.by_name.get(name).map(|&i| &self.rules[i])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn default_targets(&self) -> &[String] {
        &self.default_targets
    }

    /// Position of `rule` in the explicit ranking, if ranked.
    pub fn rank(&self, rule: &str) -> Option<usize> {
        self.ruleorder.iter().position(|r| r == rule)
    }

    /// Every rule that can produce `path`, with its binding, in declaration order.
    pub fn producers(&self, path: &str) -> Vec<(&CompiledRule, Wildcards)> {
        self.rules
            .iter()
            .filter_map(|rule| rule.match_output(path).map(|binding| (rule, binding)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::validator::validate_workflow;

    fn rules() -> RuleSet {
        let workflow = Workflow::from_rules(vec![
            Rule::new("sort")
                .with_input("raw/{sample}.txt")
                .with_output("sorted/{sample}.txt")
                .with_log("logs/sort/{sample}.log")
                .with_param("label", "sample-{sample}")
                .with_shell("sort {input} > {output}"),
            Rule::new("count")
                .with_input("sorted/{sample}.txt")
                .with_output("counts/{sample}.tsv")
                .with_shell("wc -l {input} > {output}"),
        ]);
        validate_workflow(&workflow).unwrap()
    }

    #[test]
    fn test_producers() {
        let set = rules();
        let producers = set.producers("sorted/a.txt");
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].0.name(), "sort");
        assert_eq!(producers[0].1["sample"], "a");
        assert!(set.producers("nothing/a.txt").is_empty());
    }

    #[test]
    fn test_resolve() {
        let set = rules();
        let sort = set.get("sort").unwrap();
        let binding = sort.match_output("sorted/s1.txt").unwrap();
        let resolved = sort.resolve(&binding).unwrap();
        assert_eq!(resolved.inputs, vec!["raw/s1.txt"]);
        assert_eq!(resolved.outputs, vec!["sorted/s1.txt"]);
        assert_eq!(resolved.logs, vec!["logs/sort/s1.log"]);
        assert_eq!(resolved.params["label"], "sample-s1");
    }

    #[test]
    fn test_resolve_missing_binding() {
        let set = rules();
        let sort = set.get("sort").unwrap();
        let err = sort.resolve(&Wildcards::new()).unwrap_err();
        assert!(matches!(err, PatternError::AmbiguousWildcards { ref wildcard, .. } if wildcard == "sample"));
    }

    #[test]
    fn test_rank() {
        let mut workflow = Workflow::from_rules(vec![
            Rule::new("a").with_output("{x}.out"),
            Rule::new("b").with_output("{x}.out"),
        ]);
        workflow.ruleorder = vec!["b".into(), "a".into()];
        let set = validate_workflow(&workflow).unwrap();
        assert_eq!(set.rank("b"), Some(0));
        assert_eq!(set.rank("a"), Some(1));
        assert_eq!(set.rank("c"), None);
    }
}
