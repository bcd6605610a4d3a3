//! Command Rendering
//!
//! Turns a rule's `shell` or `script` declaration into the text a backend
//! runs for one job, and prepares the file system around it:
//! - Placeholder substitution (`{input}`, `{output[0]}`, `{wildcards.x}`, ...)
//! - Interpreter selection for scripts
//! - Output and log directory creation
//! - Job script generation

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::dag::job::{Job, JobId};
use crate::error::JobError;

/// Resource read for `ulimit -v` when memory enforcement is on.
pub const MEMORY_RESOURCE: &str = "mem_mb";

/// Keeps script names unique within the process.
static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What a rule runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandTemplate {
    /// Bash command line with placeholders
    Shell(String),
    /// Path to a script; the interpreter is chosen by extension
    Script(String),
}

impl CommandTemplate {
    /// Renders the command for `job`.
    ///
    /// Supported placeholders:
    /// - `{input}`, `{output}`, `{log}`: all paths, space separated
    /// - `{input[N]}`, `{output[N]}`, `{log[N]}`: a single path
    /// - `{threads}`, `{rule}`
    /// - `{wildcards.NAME}`, `{params.NAME}`, `{resources.NAME}`
    ///
    /// `{{` and `}}` produce literal braces.
    pub fn render(&self, job: &Job) -> Result<String, JobError> {
        match self {
            Self::Shell(template) => render_template(template, job),
            Self::Script(path) => {
                let path = render_template(path, job)?;
                Ok(match interpreter_for(&path) {
                    Some(interpreter) => format!("{} {}", interpreter, shell_quote(&path)),
                    None => shell_quote(&path),
                })
            }
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Self::Shell(s) | Self::Script(s) => s,
        }
    }
}

/// Interpreter used to run a script, by file extension.
pub fn interpreter_for(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    match ext {
        "py" => Some("python3"),
        "R" | "r" => Some("Rscript"),
        "sh" | "bash" => Some("bash"),
        "pl" => Some("perl"),
        "rb" => Some("ruby"),
        "jl" => Some("julia"),
        _ => None,
    }
}

fn shell_quote(s: &str) -> String {
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

fn render_error(template: &str, reason: impl Into<String>) -> JobError {
    JobError::ExecutionFailure {
        reason: format!("cannot render command '{}': {}", template, reason.into()),
    }
}

fn render_template(template: &str, job: &Job) -> Result<String, JobError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => return Err(render_error(template, "unclosed '{'")),
                    }
                }
                out.push_str(&lookup(key.trim(), job).map_err(|e| render_error(template, e))?);
            }
            '}' => return Err(render_error(template, "unmatched '}'")),
            c => out.push(c),
        }
    }
    Ok(out)
}

fn lookup(key: &str, job: &Job) -> Result<String, String> {
    if let Some((name, rest)) = key.split_once('[') {
        let index: usize = rest
            .strip_suffix(']')
            .and_then(|i| i.trim().parse().ok())
            .ok_or_else(|| format!("bad index in '{{{}}}'", key))?;
        let list = path_list(name, job).ok_or_else(|| format!("unknown placeholder '{{{}}}'", key))?;
        return list
            .get(index)
            .cloned()
            .ok_or_else(|| format!("'{{{}}}' is out of range ({} entries)", key, list.len()));
    }

    if let Some(list) = path_list(key, job) {
        return Ok(list.join(" "));
    }

    let missing = || format!("unknown placeholder '{{{}}}'", key);
    match key.split_once('.') {
        None => match key {
            "threads" => Ok(job.threads.to_string()),
            "rule" => Ok(job.rule.clone()),
            _ => Err(missing()),
        },
        Some(("wildcards", name)) => job.wildcards.get(name).cloned().ok_or_else(missing),
        Some(("params", name)) => job.params.get(name).cloned().ok_or_else(missing),
        Some(("resources", name)) => job.resources.get(name).map(|v| v.to_string()).ok_or_else(missing),
        Some(_) => Err(missing()),
    }
}

fn path_list<'a>(name: &str, job: &'a Job) -> Option<&'a [String]> {
    match name {
        "input" | "inputs" => Some(&job.inputs),
        "output" | "outputs" => Some(&job.outputs),
        "log" => Some(&job.logs),
        _ => None,
    }
}

/// Environment exported to every job.
pub fn job_environment(job: &Job) -> Vec<(String, String)> {
    let mut env = vec![
        ("RULEFLOW_RULE".to_string(), job.rule.clone()),
        ("RULEFLOW_THREADS".to_string(), job.threads.to_string()),
        ("OMP_NUM_THREADS".to_string(), job.threads.to_string()),
        ("RULEFLOW_INPUT".to_string(), job.inputs.join(" ")),
        ("RULEFLOW_OUTPUT".to_string(), job.outputs.join(" ")),
        ("RULEFLOW_LOG".to_string(), job.logs.join(" ")),
    ];
    for (name, value) in &job.wildcards {
        env.push((format!("RULEFLOW_WILDCARD_{}", name.to_uppercase()), value.clone()));
    }
    for (name, value) in &job.params {
        env.push((format!("RULEFLOW_PARAM_{}", name.to_uppercase()), value.clone()));
    }
    env
}

/// Creates parent directories for the outputs and logs of `job`.
pub fn ensure_output_directories(job: &Job, working_dir: &Path) -> std::io::Result<()> {
    for path in job.outputs.iter().chain(&job.logs) {
        if path.is_empty() {
            continue;
        }
        if let Some(parent) = working_dir.join(path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Writes the bash script running `command` for `job`.
///
/// The script fails on the first error. With `memory_limit_mb` set, the
/// virtual memory of the job is capped through `ulimit -v`.
pub fn create_job_script(
    job: JobId,
    attempt: u32,
    command: &str,
    memory_limit_mb: Option<u64>,
) -> std::io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("ruleflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!(
        "job_{}_{}_{}_{}.sh",
        std::process::id(),
        SCRIPT_COUNTER.fetch_add(1, Ordering::Relaxed),
        job.0,
        attempt
    ));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -euo pipefail")?;
    if let Some(mb) = memory_limit_mb {
        writeln!(file, "ulimit -v {}", mb.saturating_mul(1024))?;
    }
    writeln!(file, "{}", command)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}
