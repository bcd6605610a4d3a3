//! Graph Export
//!
//! Renders a [`JobGraph`] for external visualisation tools:
//!
//! - [`to_json`]: D3 style `{nodes, links}` document
//! - [`to_dot`]: Graphviz job graph
//! - [`rule_graph_dot`]: jobs collapsed per rule, transitively reduced
//! - [`file_graph_dot`]: rules with the files they read and write

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{format_binding, Result};

use super::graph::{transitive_reduction, JobGraph};

/// Supported export formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Dot,
    RuleGraph,
    FileGraph,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "dot" => Some(Self::Dot),
            "rulegraph" => Some(Self::RuleGraph),
            "filegraph" => Some(Self::FileGraph),
            _ => None,
        }
    }
}

/// Renders `graph` in the requested format.
pub fn export(graph: &JobGraph, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => to_json(graph),
        ExportFormat::Dot => Ok(to_dot(graph)),
        ExportFormat::RuleGraph => Ok(rule_graph_dot(graph)),
        ExportFormat::FileGraph => Ok(file_graph_dot(graph)),
    }
}

#[derive(Debug, Serialize)]
struct Node<'a> {
    id: usize,
    rule: &'a str,
    label: String,
    wildcards: String,
    needrun: bool,
    inputs: &'a [String],
    outputs: &'a [String],
}

#[derive(Debug, Serialize)]
struct Link {
    source: usize,
    target: usize,
}

#[derive(Debug, Serialize)]
struct Document<'a> {
    nodes: Vec<Node<'a>>,
    links: Vec<Link>,
}

/// D3 compatible node/link list.
pub fn to_json(graph: &JobGraph) -> Result<String> {
    let nodes = graph
        .jobs()
        .iter()
        .map(|job| Node {
            id: job.id.0,
            rule: &job.rule,
            label: job.label(),
            wildcards: format_binding(&job.wildcards),
            needrun: job.needrun,
            inputs: &job.inputs,
            outputs: &job.outputs,
        })
        .collect();
    let links = graph
        .edges()
        .into_iter()
        .map(|(from, to)| Link {
            source: from.0,
            target: to.0,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&Document { nodes, links })?)
}

/// Hue per rule so jobs of one rule share a colour.
fn rule_colours(graph: &JobGraph) -> BTreeMap<&str, String> {
    let rules: BTreeSet<&str> = graph.jobs().iter().map(|j| j.rule.as_str()).collect();
    let n = rules.len().max(1) as f64;
    rules
        .into_iter()
        .enumerate()
        .map(|(i, rule)| (rule, format!("{:.3} 0.6 0.85", i as f64 / n)))
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

const DOT_HEADER: &str = "digraph workflow {\n    graph[bgcolor=white, margin=0];\n    node[shape=box, style=rounded, fontname=sans, fontsize=10, penwidth=2];\n    edge[penwidth=2, color=grey];\n";

/// Graphviz job graph. Jobs that do not need to run are drawn dashed.
pub fn to_dot(graph: &JobGraph) -> String {
    let colours = rule_colours(graph);
    let mut out = String::from(DOT_HEADER);

    for job in graph.jobs() {
        let mut label = job.rule.clone();
        for (key, value) in &job.wildcards {
            let _ = write!(label, "\\n{}: {}", key, value);
        }
        let style = if job.needrun { "rounded" } else { "rounded,dashed" };
        let _ = writeln!(
            out,
            "    {}[label = \"{}\", color = \"{}\", style=\"{}\"];",
            job.id.0,
            escape(&label),
            colours[job.rule.as_str()],
            style
        );
    }
    for (from, to) in graph.edges() {
        let _ = writeln!(out, "    {} -> {}", from.0, to.0);
    }
    out.push_str("}\n");
    out
}

/// Graphviz rule graph: one node per rule, redundant edges removed.
pub fn rule_graph_dot(graph: &JobGraph) -> String {
    let colours = rule_colours(graph);
    let rules: Vec<&str> = colours.keys().copied().collect();
    let index: BTreeMap<&str, usize> = rules.iter().enumerate().map(|(i, r)| (*r, i)).collect();

    let edges: BTreeSet<(usize, usize)> = graph
        .edges()
        .into_iter()
        .map(|(from, to)| {
            (
                index[graph.job(from).rule.as_str()],
                index[graph.job(to).rule.as_str()],
            )
        })
        .filter(|(from, to)| from != to)
        .collect();

    let mut out = String::from(DOT_HEADER);
    for (i, rule) in rules.iter().enumerate() {
        let _ = writeln!(
            out,
            "    {}[label = \"{}\", color = \"{}\", style=\"rounded\"];",
            i,
            escape(rule),
            colours[rule]
        );
    }
    for (from, to) in transitive_reduction(rules.len(), &edges) {
        let _ = writeln!(out, "    {} -> {}", from, to);
    }
    out.push_str("}\n");
    out
}

/// Graphviz file graph: each rule as a table of the files it reads and
/// writes across all of its jobs.
pub fn file_graph_dot(graph: &JobGraph) -> String {
    let colours = rule_colours(graph);
    let mut files: BTreeMap<&str, (BTreeSet<&str>, BTreeSet<&str>)> = BTreeMap::new();
    for job in graph.jobs() {
        let entry = files.entry(job.rule.as_str()).or_default();
        entry.0.extend(job.inputs.iter().map(String::as_str));
        entry.1.extend(job.outputs.iter().map(String::as_str));
    }
    let index: BTreeMap<&str, usize> = files.keys().enumerate().map(|(i, r)| (*r, i)).collect();

    let mut out = String::from(DOT_HEADER);
    for (rule, (inputs, outputs)) in &files {
        let rows = |paths: &BTreeSet<&str>| {
            if paths.is_empty() {
                "-".to_string()
            } else {
                paths.iter().map(|p| escape(p)).collect::<Vec<_>>().join("\\l") + "\\l"
            }
        };
        let _ = writeln!(
            out,
            "    {}[shape=record, label = \"{{{}|input: {}|output: {}}}\", color = \"{}\"];",
            index[rule],
            escape(rule),
            rows(inputs),
            rows(outputs),
            colours[rule]
        );
    }

    let edges: BTreeSet<(usize, usize)> = graph
        .edges()
        .into_iter()
        .map(|(from, to)| {
            (
                index[graph.job(from).rule.as_str()],
                index[graph.job(to).rule.as_str()],
            )
        })
        .filter(|(from, to)| from != to)
        .collect();
    for (from, to) in edges {
        let _ = writeln!(out, "    {} -> {}", from, to);
    }
    out.push_str("}\n");
    out
}
