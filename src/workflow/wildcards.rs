//! Wildcard Patterns
//!
//! Path templates such as `reads/{sample}.fastq` or `{sample}/{lane,\d+}.bam`.
//!
//! - [`Pattern::parse`] splits a template into literal and wildcard segments
//! - [`Pattern::compile`] turns it into an anchored regex for matching
//! - [`CompiledPattern::match_path`] binds wildcards from a concrete path
//! - [`Pattern::apply`] substitutes a binding back into the template
//!
//! Unconstrained wildcards match any non-empty string lazily, so when several
//! bindings are possible the leftmost wildcards take the shortest values and
//! the last one absorbs the remainder.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PatternError;

/// Wildcard name -> concrete value.
pub type Wildcards = BTreeMap<String, String>;

/// Regex used for a wildcard with no constraint.
pub const DEFAULT_WILDCARD_REGEX: &str = ".+?";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard {
        name: String,
        constraint: Option<String>,
    },
}

/// A parsed path template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a template.
    ///
    /// `{{` and `}}` stand for literal braces. Inside a wildcard the text after
    /// the first comma is a regex constraint, which may itself contain braces.
    ///
    /// # Example
    ///
    /// ```
    /// use ruleflow::workflow::wildcards::Pattern;
    ///
    /// let pattern = Pattern::parse("reads/{sample}_{lane,\\d+}.fastq").unwrap();
    /// assert_eq!(pattern.wildcard_names(), vec!["sample", "lane"]);
    /// ```
    pub fn parse(raw: impl Into<String>) -> Result<Self, PatternError> {
        let raw = raw.into();
        let invalid = |reason: &str| PatternError::InvalidPattern {
            pattern: raw.clone(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    literal.push('}');
                    i += 2;
                }
                '}' => return Err(invalid("unmatched '}'")),
                '{' => {
                    let mut depth = 1;
                    let mut j = i + 1;
                    let mut body = String::new();
                    while j < chars.len() {
                        match chars[j] {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        body.push(chars[j]);
                        j += 1;
                    }
                    if depth != 0 {
                        return Err(invalid("unterminated wildcard"));
                    }

                    let (name, constraint) = match body.split_once(',') {
                        Some((name, re)) => (name.trim().to_string(), Some(re.trim().to_string())),
                        None => (body.trim().to_string(), None),
                    };
                    if !is_valid_wildcard_name(&name) {
                        return Err(invalid(&format!("invalid wildcard name '{}'", name)));
                    }
                    if let Some(re) = &constraint {
                        if re.is_empty() {
                            return Err(invalid(&format!("empty constraint for '{}'", name)));
                        }
                        Regex::new(re).map_err(|e| invalid(&e.to_string()))?;
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Wildcard { name, constraint });
                    i = j + 1;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { raw, segments })
    }

    /// The template as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Wildcard names in order of first appearance.
    pub fn wildcard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for segment in &self.segments {
            if let Segment::Wildcard { name, .. } = segment {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    /// True if the template contains at least one wildcard.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Wildcard { .. }))
    }

    /// The literal text before the first wildcard.
    pub fn literal_prefix(&self) -> String {
        match self.segments.first() {
            Some(Segment::Literal(text)) => text.clone(),
            _ => String::new(),
        }
    }

    /// Substitutes `binding` into the template.
    ///
    /// Returns the name of the first wildcard without a value on failure.
    pub fn apply(&self, binding: &Wildcards) -> Result<String, String> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Wildcard { name, .. } => match binding.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }

    /// Replaces the bound wildcards with their values and keeps the rest.
    pub fn partially_apply(&self, binding: &Wildcards) -> Pattern {
        let mut segments: Vec<Segment> = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => push_literal(&mut segments, text),
                Segment::Wildcard { name, .. } => match binding.get(name) {
                    Some(value) => push_literal(&mut segments, value),
                    None => segments.push(segment.clone()),
                },
            }
        }

        let raw = render(&segments);
        Pattern { raw, segments }
    }

    /// Builds the matcher. `constraints` supplies rule-level regexes for
    /// wildcards that have no inline constraint.
    pub fn compile(&self, constraints: &BTreeMap<String, String>) -> Result<CompiledPattern, PatternError> {
        let mut source = String::from("^");
        let mut groups = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::Wildcard { name, constraint } => {
                    let re = constraint
                        .as_deref()
                        .or_else(|| constraints.get(name).map(String::as_str))
                        .unwrap_or(DEFAULT_WILDCARD_REGEX);
                    let group = format!("w{}", groups.len());
                    source.push_str(&format!("(?P<{}>(?:{}))", group, re));
                    groups.push((group, name.clone()));
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| PatternError::InvalidPattern {
            pattern: self.raw.clone(),
            reason: e.to_string(),
        })?;

        let names: BTreeSet<&str> = groups.iter().map(|(_, name)| name.as_str()).collect();
        let alignment = if names.len() < groups.len() {
            Some(self.pieces(constraints)?)
        } else {
            None
        };

        Ok(CompiledPattern {
            pattern: self.clone(),
            regex,
            groups,
            alignment,
        })
    }

    /// Segments with each wildcard's regex anchored on its own.
    fn pieces(&self, constraints: &BTreeMap<String, String>) -> Result<Vec<Piece>, PatternError> {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => Ok(Piece::Literal(text.clone())),
                Segment::Wildcard { name, constraint } => {
                    let re = constraint
                        .as_deref()
                        .or_else(|| constraints.get(name).map(String::as_str))
                        .unwrap_or(DEFAULT_WILDCARD_REGEX);
                    let regex = Regex::new(&format!("^(?:{})$", re)).map_err(|e| PatternError::InvalidPattern {
                        pattern: self.raw.clone(),
                        reason: e.to_string(),
                    })?;
                    Ok(Piece::Wildcard {
                        name: name.clone(),
                        regex,
                    })
                }
            })
            .collect()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for Pattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Pattern::parse(value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.raw
    }
}

/// A pattern ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pattern: Pattern,
    regex: Regex,
    /// Regex group name -> wildcard name, in template order.
    groups: Vec<(String, String)>,
    /// Set when a wildcard occurs more than once
    alignment: Option<Vec<Piece>>,
}

#[derive(Debug, Clone)]
enum Piece {
    Literal(String),
    Wildcard { name: String, regex: Regex },
}

impl CompiledPattern {
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Binds wildcards from `path`.
    ///
    /// A wildcard used twice must capture the same value both times.
    pub fn match_path(&self, path: &str) -> Result<Wildcards, PatternError> {
        let no_match = || PatternError::NoMatch {
            pattern: self.pattern.raw.clone(),
            path: path.to_string(),
        };

        let captures = self.regex.captures(path).ok_or_else(no_match)?;
        let mut binding = Wildcards::new();

        for (group, name) in &self.groups {
            let value = captures.name(group).map(|m| m.as_str()).ok_or_else(no_match)?;
            match binding.get(name) {
                Some(existing) if existing != value => return self.match_aligned(path).ok_or_else(no_match),
                Some(_) => {}
                None => {
                    binding.insert(name.clone(), value.to_string());
                }
            }
        }

        Ok(binding)
    }

    /// Slow path for repeated wildcards whose first regex match disagrees.
    ///
    /// Tries the alignments in the same order as the regex: shortest values
    /// for the leftmost wildcards first.
    fn match_aligned(&self, path: &str) -> Option<Wildcards> {
        let pieces = self.alignment.as_deref()?;
        let mut binding = Wildcards::new();
        align(pieces, path, &mut binding).then_some(binding)
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.match_path(path).is_ok()
    }
}

fn align(pieces: &[Piece], rest: &str, binding: &mut Wildcards) -> bool {
    let Some((first, tail)) = pieces.split_first() else {
        return rest.is_empty();
    };

    match first {
        Piece::Literal(text) => rest
            .strip_prefix(text.as_str())
            .is_some_and(|remainder| align(tail, remainder, binding)),
        Piece::Wildcard { name, regex } => {
            if let Some(value) = binding.get(name).cloned() {
                return regex.is_match(&value)
                    && rest
                        .strip_prefix(value.as_str())
                        .is_some_and(|remainder| align(tail, remainder, binding));
            }

            let ends = rest.char_indices().map(|(i, _)| i).chain(std::iter::once(rest.len()));
            for end in ends {
                let value = &rest[..end];
                if !regex.is_match(value) {
                    continue;
                }
                binding.insert(name.clone(), value.to_string());
                if align(tail, &rest[end..], binding) {
                    return true;
                }
                binding.remove(name);
            }
            false
        }
    }
}

/// Convenience wrapper: parse, compile and match in one go.
pub fn match_pattern(pattern: &str, path: &str) -> Result<Wildcards, PatternError> {
    Pattern::parse(pattern)?
        .compile(&BTreeMap::new())?
        .match_path(path)
}

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    Pattern::parse(text).map(|p| p.has_wildcards()).unwrap_or(false)
}

fn is_valid_wildcard_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if let Some(Segment::Literal(prev)) = segments.last_mut() {
        prev.push_str(text);
    } else {
        segments.push(Segment::Literal(text.to_string()));
    }
}

fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(&text.replace('{', "{{").replace('}', "}}")),
            Segment::Wildcard { name, constraint } => match constraint {
                Some(re) => out.push_str(&format!("{{{},{}}}", name, re)),
                None => out.push_str(&format!("{{{}}}", name)),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(pairs: &[(&str, &str)]) -> Wildcards {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_literal_only() {
        let pattern = Pattern::parse("results/summary.txt").unwrap();
        assert!(!pattern.has_wildcards());
        assert!(pattern.wildcard_names().is_empty());
    }

    #[test]
    fn test_parse_names_in_order() {
        let pattern = Pattern::parse("{id}_{replicate}/{id}.txt").unwrap();
        assert_eq!(pattern.wildcard_names(), vec!["id", "replicate"]);
    }

    #[test]
    fn test_parse_constraint_with_braces() {
        let pattern = Pattern::parse("run_{n,\\d{3}}.log").unwrap();
        assert_eq!(pattern.wildcard_names(), vec!["n"]);
        let compiled = pattern.compile(&BTreeMap::new()).unwrap();
        assert!(compiled.is_match("run_042.log"));
        assert!(!compiled.is_match("run_42.log"));
    }

    #[test]
    fn test_parse_rejects_bad_syntax() {
        assert!(Pattern::parse("{sample.txt").is_err());
        assert!(Pattern::parse("sample}.txt").is_err());
        assert!(Pattern::parse("{1abc}.txt").is_err());
        assert!(Pattern::parse("{x,[}.txt").is_err());
    }

    #[test]
    fn test_escaped_braces() {
        let pattern = Pattern::parse("a{{b}}/{x}").unwrap();
        assert_eq!(pattern.wildcard_names(), vec!["x"]);
        assert_eq!(pattern.apply(&binding(&[("x", "1")])).unwrap(), "a{b}/1");
    }

    #[test]
    fn test_match_simple() {
        let b = match_pattern("reads/{sample}.fastq", "reads/s1.fastq").unwrap();
        assert_eq!(b, binding(&[("sample", "s1")]));
    }

    #[test]
    fn test_match_no_match() {
        let err = match_pattern("reads/{sample}.fastq", "other/s1.fastq").unwrap_err();
        assert!(matches!(err, PatternError::NoMatch { .. }));
    }

    #[test]
    fn test_wildcard_must_be_non_empty() {
        assert!(match_pattern("{sample}.txt", ".txt").is_err());
    }

    #[test]
    fn test_lazy_left_greedy_right() {
        let b = match_pattern("{a}_{b}.txt", "x_y_z.txt").unwrap();
        assert_eq!(b["a"], "x");
        assert_eq!(b["b"], "y_z");
    }

    #[test]
    fn test_repeated_wildcard_must_agree() {
        assert!(match_pattern("{s}/{s}.bam", "a/a.bam").is_ok());
        assert!(match_pattern("{s}/{s}.bam", "a/b.bam").is_err());
    }

    #[test]
    fn test_repeated_wildcard_spanning_separator() {
        let pattern = Pattern::parse("{s}/{s}.bam").unwrap();
        let compiled = pattern.compile(&BTreeMap::new()).unwrap();
        let path = pattern.apply(&binding(&[("s", "a/b")])).unwrap();
        assert_eq!(path, "a/b/a/b.bam");
        assert_eq!(compiled.match_path(&path).unwrap(), binding(&[("s", "a/b")]));

        let b = match_pattern("{s}_{t}/{s}.txt", "x_y_z/x_y.txt").unwrap();
        assert_eq!(b, binding(&[("s", "x_y"), ("t", "z")]));
        assert!(match_pattern("{s}_{t}/{s}.txt", "x_y_z/q.txt").is_err());
    }

    #[test]
    fn test_repeated_wildcard_keeps_constraints() {
        let b = match_pattern("{n,\\d+}-{n}.log", "12-12.log").unwrap();
        assert_eq!(b["n"], "12");
        assert!(match_pattern("{n,[a-z]+}/{n}.log", "a/b/a/b.log").is_err());
    }

    #[test]
    fn test_rule_level_constraint() {
        let pattern = Pattern::parse("{sample}.txt").unwrap();
        let mut constraints = BTreeMap::new();
        constraints.insert("sample".to_string(), "[a-z]+".to_string());
        let compiled = pattern.compile(&constraints).unwrap();
        assert!(compiled.is_match("abc.txt"));
        assert!(!compiled.is_match("ab1.txt"));
    }

    #[test]
    fn test_apply_missing_wildcard() {
        let pattern = Pattern::parse("{a}/{b}.txt").unwrap();
        assert_eq!(pattern.apply(&binding(&[("a", "x")])), Err("b".to_string()));
    }

    #[test]
    fn test_round_trip() {
        let pattern = Pattern::parse("data/{group}/{sample}.{ext}").unwrap();
        let compiled = pattern.compile(&BTreeMap::new()).unwrap();
        let path = "data/g1/s.1.tar.gz";
        let b = compiled.match_path(path).unwrap();
        assert_eq!(pattern.apply(&b).unwrap(), path);
    }

    #[test]
    fn test_partially_apply() {
        let pattern = Pattern::parse("chunks/{sample}/{chunk}.txt").unwrap();
        let partial = pattern.partially_apply(&binding(&[("sample", "s1")]));
        assert_eq!(partial.raw(), "chunks/s1/{chunk}.txt");
        assert_eq!(partial.wildcard_names(), vec!["chunk"]);
        assert_eq!(partial.literal_prefix(), "chunks/s1/");
    }

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{sample}.fastq"));
        assert!(has_wildcards("output/{id}.txt"));
        assert!(!has_wildcards("regular_file.txt"));
    }

    #[test]
    fn test_serde_as_string() {
        let pattern: Pattern = serde_json::from_str("\"{x}.txt\"").unwrap();
        assert_eq!(pattern.wildcard_names(), vec!["x"]);
        assert_eq!(serde_json::to_string(&pattern).unwrap(), "\"{x}.txt\"");
    }
}
