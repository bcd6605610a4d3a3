//! Run State Persistence
//!
//! Metadata that survives between runs, stored as JSON in
//! `.ruleflow/{rule_file_stem}.state` below the working directory:
//!
//! - Incomplete markers: outputs whose job was dispatched but never verified
//! - Output records: producing rule, input checksums, completion time
//!
//! Markers are written before a job is dispatched and removed once its
//! outputs are verified, so outputs left behind by a crash, failure or
//! cancellation are rebuilt on the next run.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Name of the metadata directory.
pub const STATE_DIR: &str = ".ruleflow";

/// What is known about an output produced by a completed job.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OutputRecord {
    /// Rule that produced the output
    pub rule: String,

    /// Input path -> blake3 digest at the time the job ran
    #[serde(default)]
    pub input_checksums: BTreeMap<String, String>,

    /// When the producing job was verified
    pub completed_at: DateTime<Utc>,
}

/// Persistent metadata for one rule file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RunState {
    /// Rule file this state belongs to
    pub workflow_path: String,

    /// Outputs of jobs that started but were never verified
    #[serde(default)]
    pub incomplete: BTreeSet<String>,

    /// Output path -> record
    #[serde(default)]
    pub records: BTreeMap<String, OutputRecord>,

    /// Last time the state was updated
    pub timestamp: DateTime<Utc>,

    /// Where the state is saved; `None` keeps it in memory only.
    #[serde(skip)]
    state_file: Option<PathBuf>,
}

impl RunState {
    /// Creates an empty state saved below `root`.
    pub fn new(workflow_path: &str, root: &Path) -> Self {
        Self {
            workflow_path: workflow_path.to_string(),
            incomplete: BTreeSet::new(),
            records: BTreeMap::new(),
            timestamp: Utc::now(),
            state_file: Some(Self::state_file_path_for(workflow_path, root)),
        }
    }

    /// Creates an empty state that is never written to disk.
    pub fn in_memory(workflow_path: &str) -> Self {
        Self {
            workflow_path: workflow_path.to_string(),
            incomplete: BTreeSet::new(),
            records: BTreeMap::new(),
            timestamp: Utc::now(),
            state_file: None,
        }
    }

    /// Loads the state for `workflow_path` below `root`.
    pub fn load(workflow_path: &str, root: &Path) -> Result<Self> {
        let state_file = Self::state_file_path_for(workflow_path, root);

        let content = fs::read_to_string(&state_file)?;
        let mut state: RunState = serde_json::from_str(&content)?;
        state.state_file = Some(state_file.clone());

        info!("Loaded run state from {}", state_file.display());
        debug!(
            "{} incomplete outputs, {} records",
            state.incomplete.len(),
            state.records.len()
        );

        Ok(state)
    }

    /// Loads the saved state, or starts a fresh one if there is none.
    pub fn load_or_new(workflow_path: &str, root: &Path) -> Self {
        Self::load(workflow_path, root).unwrap_or_else(|_| {
            debug!("No previous run state for {}", workflow_path);
            Self::new(workflow_path, root)
        })
    }

    /// Saves the state. A no-op for in-memory state.
    pub fn save(&self) -> Result<()> {
        let Some(state_file) = &self.state_file else {
            return Ok(());
        };

        if let Some(dir) = state_file.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(state_file, json)?;

        debug!("Saved run state to {}", state_file.display());
        Ok(())
    }

    /// Returns the state file path for a given rule file.
    pub fn state_file_path_for(workflow_path: &str, root: &Path) -> PathBuf {
        let stem = Path::new(workflow_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow");

        root.join(STATE_DIR).join(format!("{}.state", stem))
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Records that a job producing `outputs` is about to start.
    pub fn mark_incomplete<'a>(&mut self, outputs: impl IntoIterator<Item = &'a String>) {
        for output in outputs {
            self.incomplete.insert(output.clone());
            self.records.remove(output);
        }
        self.timestamp = Utc::now();
    }

    /// Records the verified completion of a job.
    pub fn mark_complete(
        &mut self,
        rule: &str,
        outputs: &[String],
        input_checksums: BTreeMap<String, String>,
    ) {
        let now = Utc::now();
        for output in outputs {
            self.incomplete.remove(output);
            self.records.insert(
                output.clone(),
                OutputRecord {
                    rule: rule.to_string(),
                    input_checksums: input_checksums.clone(),
                    completed_at: now,
                },
            );
        }
        self.timestamp = now;
    }

    pub fn is_incomplete(&self, output: &str) -> bool {
        self.incomplete.contains(output)
    }

    pub fn record(&self, output: &str) -> Option<&OutputRecord> {
        self.records.get(output)
    }

    /// Forgets everything known about `output`.
    pub fn forget(&mut self, output: &str) {
        self.incomplete.remove(output);
        self.records.remove(output);
        self.timestamp = Utc::now();
    }

    /// Clears all state.
    pub fn clear(&mut self) {
        self.incomplete.clear();
        self.records.clear();
        self.timestamp = Utc::now();
    }

    /// Deletes the state file.
    pub fn delete(&self) -> Result<()> {
        if let Some(state_file) = &self.state_file {
            if state_file.exists() {
                fs::remove_file(state_file)?;
                info!("Deleted state file: {}", state_file.display());
            }
        }
        Ok(())
    }
}
