use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: u32 = 1;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointOrigin {
    /// Taken by the agent loop before a mutating tool ran.
    Auto,
    /// Requested by the user.
    Manual,
    /// Taken by `restore` before it overwrote anything.
    PreRestore,
}

impl CheckpointOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for CheckpointOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prior state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Present { hash: String, size: u64 },
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    #[serde(flatten)]
    pub state: FileState,
}

/// Manifest persisted as `<id>.json` in the session partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub id: String,
    pub session_id: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub origin: CheckpointOrigin,
    pub entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    #[must_use]
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            created_at: self.created_at.clone(),
            label: self.label.clone(),
            origin: self.origin,
            file_count: self.entries.len(),
            total_bytes: self
                .entries
                .iter()
                .map(|entry| match entry.state {
                    FileState::Present { size, .. } => size,
                    FileState::Absent => 0,
                })
                .sum(),
        }
    }

    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|entry| entry.path.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub created_at: String,
    pub label: Option<String>,
    pub origin: CheckpointOrigin,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Outcome of restoring one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored,
    Deleted,
    Unchanged,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub checkpoint_id: String,
    /// Snapshot of the state that the restore replaced.
    pub pre_restore_id: String,
    pub paths: Vec<(PathBuf, RestoreOutcome)>,
}

impl RestoreReport {
    #[must_use]
    pub fn failures(&self) -> usize {
        self.paths
            .iter()
            .filter(|(_, outcome)| matches!(outcome, RestoreOutcome::Failed(_)))
            .count()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }
}
