//! Workflow Data Model
//!
//! Rules as they come out of a rule file, before compilation.
//!
//! # Example YAML Format
//!
//! ```yaml
//! targets:
//!   - results/summary.txt
//!
//! rules:
//!   - name: align
//!     input: reads/{sample}.fastq
//!     output: aligned/{sample}.bam
//!     shell: bowtie2 -p {threads} -U {input} | samtools view -b > {output}
//!     threads: 8
//!     resources:
//!       mem_mb: "max(2000, input_size_mb * 4)"
//!
//!   - name: summarize
//!     input:
//!       - aligned/a.bam
//!       - aligned/b.bam
//!     output: results/summary.txt
//!     shell: samtools flagstat {input} > {output}
//!     priority: 10
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use crate::execution::command::CommandTemplate;

/// Name of the resource backing the `threads` declaration.
pub const CORES_RESOURCE: &str = "_cores";

/// Name of the resource counting concurrently dispatched units.
pub const JOBS_RESOURCE: &str = "_jobs";

/// A single input declaration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InputSpec {
    /// A path pattern using the rule's wildcards.
    Path(String),

    /// Files discovered only after a checkpoint rule has run.
    ///
    /// `glob` is matched against storage once the checkpoint job completes;
    /// wildcards it shares with the rule are bound, the rest are free. Each
    /// discovered binding is substituted into `expand` (defaults to `glob`)
    /// to obtain the concrete input.
    Checkpoint {
        checkpoint: String,
        glob: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expand: Option<String>,
    },
}

impl InputSpec {
    pub fn path(pattern: impl Into<String>) -> Self {
        Self::Path(pattern.into())
    }
}

impl fmt::Display for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p),
            Self::Checkpoint { checkpoint, glob, .. } => {
                write!(f, "{} (after checkpoint {})", glob, checkpoint)
            }
        }
    }
}

/// A resource amount: either a number or an expression evaluated per job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ResourceValue {
    Amount(u64),
    Expression(String),
}

impl From<u64> for ResourceValue {
    fn from(value: u64) -> Self {
        Self::Amount(value)
    }
}

impl From<&str> for ResourceValue {
    fn from(value: &str) -> Self {
        Self::Expression(value.to_string())
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amount(n) => write!(f, "{}", n),
            Self::Expression(e) => write!(f, "{}", e),
        }
    }
}

/// Represents a single rule.
///
/// A rule maps input patterns to output patterns through a command. The
/// output patterns define the wildcard namespace: every wildcard used by an
/// input, log or param must appear in the outputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rule {
    /// Unique rule name
    pub name: String,

    /// Input patterns, in order
    #[serde(deserialize_with = "single_or_vec", default)]
    pub input: Vec<InputSpec>,

    /// Output patterns, in order
    #[serde(deserialize_with = "single_or_vec", default)]
    pub output: Vec<String>,

    /// Log file patterns (created directories, never required to exist)
    #[serde(deserialize_with = "single_or_vec", default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,

    /// Shell command template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Script path template (alternative to `shell`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Free-form parameters available to the command as `{params.NAME}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    /// Number of cores this rule requires
    #[serde(default = "default_threads")]
    pub threads: u64,

    /// Additional resource requirements (e.g. `mem_mb`, `gpu`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, ResourceValue>,

    /// Higher runs first among ready jobs
    #[serde(default)]
    pub priority: i64,

    /// Per-wildcard regex constraints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub wildcard_constraints: BTreeMap<String, String>,

    /// Jobs of rules sharing a group name are dispatched together
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Outputs of this rule are only fully known after it has run
    #[serde(default)]
    pub checkpoint: bool,

    /// Always runs on the submitting host
    #[serde(default)]
    pub localrule: bool,

    /// Overrides the global retry count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Default thread count for rules that don't specify
fn default_threads() -> u64 {
    1
}

/// Deserializes either a single value or an array into `Vec<T>`.
fn single_or_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

impl Rule {
    /// Creates a rule with no inputs, outputs or command.
    ///
    /// # Example
    ///
    /// ```
    /// use ruleflow::workflow::Rule;
    ///
    /// let rule = Rule::new("align")
    ///     .with_input("reads/{sample}.fastq")
    ///     .with_output("aligned/{sample}.bam")
    ///     .with_shell("bowtie2 -U {input} > {output}")
    ///     .with_threads(4);
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: Vec::new(),
            output: Vec::new(),
            log: Vec::new(),
            shell: None,
            script: None,
            params: BTreeMap::new(),
            threads: 1,
            resources: BTreeMap::new(),
            priority: 0,
            wildcard_constraints: BTreeMap::new(),
            group: None,
            checkpoint: false,
            localrule: false,
            retries: None,
        }
    }

    /// Appends an input pattern.
    pub fn with_input(mut self, pattern: impl Into<String>) -> Self {
        self.input.push(InputSpec::Path(pattern.into()));
        self
    }

    /// Appends an input that is resolved after `checkpoint` has run.
    pub fn with_checkpoint_input(
        mut self,
        checkpoint: impl Into<String>,
        glob: impl Into<String>,
        expand: Option<&str>,
    ) -> Self {
        self.input.push(InputSpec::Checkpoint {
            checkpoint: checkpoint.into(),
            glob: glob.into(),
            expand: expand.map(str::to_string),
        });
        self
    }

    /// Appends an output pattern.
    pub fn with_output(mut self, pattern: impl Into<String>) -> Self {
        self.output.push(pattern.into());
        self
    }

    /// Appends a log pattern.
    pub fn with_log(mut self, pattern: impl Into<String>) -> Self {
        self.log.push(pattern.into());
        self
    }

    /// Sets the shell command template.
    pub fn with_shell(mut self, command: impl Into<String>) -> Self {
        self.shell = Some(command.into());
        self
    }

    /// Sets the script path template.
    pub fn with_script(mut self, path: impl Into<String>) -> Self {
        self.script = Some(path.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Sets the thread count for this rule.
    pub fn with_threads(mut self, threads: u64) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, value: impl Into<ResourceValue>) -> Self {
        self.resources.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_constraint(mut self, wildcard: impl Into<String>, regex: impl Into<String>) -> Self {
        self.wildcard_constraints.insert(wildcard.into(), regex.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Marks this rule as a checkpoint.
    pub fn as_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    pub fn as_localrule(mut self) -> Self {
        self.localrule = true;
        self
    }

    /// The command this rule runs, if any.
    pub fn command(&self) -> Option<CommandTemplate> {
        match (&self.shell, &self.script) {
            (Some(shell), _) => Some(CommandTemplate::Shell(shell.clone())),
            (None, Some(script)) => Some(CommandTemplate::Script(script.clone())),
            (None, None) => None,
        }
    }
}

/// A rule file: the rules, an optional explicit ranking and default targets.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Workflow {
    /// Ordered list of rules
    pub rules: Vec<Rule>,

    /// Explicit precedence between rules (earlier wins) for ambiguous outputs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ruleorder: Vec<String>,

    /// Targets built when none are requested
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a workflow from a list of rules.
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Adds a rule to the workflow.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), String> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(format!("Rule '{}' already exists", rule.name));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Gets a rule by name.
    pub fn get_rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Targets used when the caller requests none.
    ///
    /// Explicit `targets` win; otherwise the first rule, requested by name.
    pub fn default_targets(&self) -> Vec<String> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }
        self.rules.first().map(|r| vec![r.name.clone()]).unwrap_or_default()
    }

    /// Returns the number of rules in the workflow.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the workflow has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_creation() {
        let rule = Rule::new("test")
            .with_input("input.txt")
            .with_output("output.txt")
            .with_shell("cat {input} > {output}")
            .with_threads(2);

        assert_eq!(rule.name, "test");
        assert_eq!(rule.threads, 2);
        assert_eq!(rule.input, vec![InputSpec::path("input.txt")]);
        assert_eq!(rule.output, vec!["output.txt"]);
        assert_eq!(
            rule.command(),
            Some(CommandTemplate::Shell("cat {input} > {output}".to_string()))
        );
    }

    #[test]
    fn test_rule_without_command() {
        let rule = Rule::new("all").with_input("a.txt");
        assert!(rule.command().is_none());
    }

    #[test]
    fn test_deserialize_single_and_list() {
        let yaml = r#"
name: sort
input: raw/{x}.txt
output:
  - sorted/{x}.txt
  - sorted/{x}.idx
shell: sort {input} > {output[0]}
resources:
  mem_mb: 512
  disk_mb: "input_size_mb * 2"
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.input.len(), 1);
        assert_eq!(rule.output.len(), 2);
        assert_eq!(rule.threads, 1);
        assert_eq!(rule.resources["mem_mb"], ResourceValue::Amount(512));
        assert_eq!(
            rule.resources["disk_mb"],
            ResourceValue::Expression("input_size_mb * 2".to_string())
        );
    }

    #[test]
    fn test_deserialize_checkpoint_input() {
        let yaml = r#"
name: gather
input:
  - checkpoint: split
    glob: chunks/{sample}/{chunk}.txt
    expand: processed/{sample}/{chunk}.out
output: merged/{sample}.txt
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        match &rule.input[0] {
            InputSpec::Checkpoint { checkpoint, glob, expand } => {
                assert_eq!(checkpoint, "split");
                assert_eq!(glob, "chunks/{sample}/{chunk}.txt");
                assert_eq!(expand.as_deref(), Some("processed/{sample}/{chunk}.out"));
            }
            other => panic!("unexpected input {:?}", other),
        }
    }

    #[test]
    fn test_workflow_add_rule() {
        let mut workflow = Workflow::new();
        let rule = Rule::new("r1").with_output("x");

        assert!(workflow.add_rule(rule.clone()).is_ok());
        assert!(workflow.add_rule(rule).is_err());
        assert_eq!(workflow.len(), 1);
        assert!(workflow.get_rule("r1").is_some());
    }

    #[test]
    fn test_default_targets_explicit() {
        let mut workflow = Workflow::from_rules(vec![Rule::new("a").with_output("{x}.txt")]);
        workflow.targets = vec!["one.txt".to_string()];
        assert_eq!(workflow.default_targets(), vec!["one.txt"]);
    }

    #[test]
    fn test_default_targets_first_rule() {
        let workflow = Workflow::from_rules(vec![
            Rule::new("all").with_input("a.txt").with_input("b.txt"),
            Rule::new("other").with_output("{x}.txt"),
        ]);
        assert_eq!(workflow.default_targets(), vec!["all"]);
        assert!(Workflow::new().default_targets().is_empty());
    }

    #[test]
    fn test_workflow_is_empty() {
        let workflow = Workflow::new();
        assert!(workflow.is_empty());
        assert_eq!(workflow.len(), 0);
    }
}
