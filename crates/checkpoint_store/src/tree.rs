use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::debug;

pub const DEFAULT_TREE_MAX_FILES: usize = 2_000;
pub const DEFAULT_TREE_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Bounds for a whole-tree snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLimits {
    pub max_files: usize,
    pub max_bytes: u64,
    /// Directories skipped entirely, in addition to `.git`.
    pub exclude: Vec<PathBuf>,
}

impl Default for TreeLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_TREE_MAX_FILES,
            max_bytes: DEFAULT_TREE_MAX_BYTES,
            exclude: Vec::new(),
        }
    }
}

impl TreeLimits {
    #[must_use]
    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exclude.push(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSelection {
    pub files: Vec<PathBuf>,
    /// True when a limit stopped the walk early.
    pub truncated: bool,
}

/// Collects regular files under `root`, honouring `.gitignore` rules.
///
/// Files are returned sorted. Unreadable entries are skipped.
#[must_use]
pub fn collect_tree(root: &Path, limits: &TreeLimits) -> TreeSelection {
    let exclude = limits.exclude.clone();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_exclude(true)
        .parents(true)
        .require_git(false)
        .filter_entry(move |entry| {
            entry.file_name() != ".git" && !exclude.iter().any(|dir| entry.path() == dir)
        })
        .build();

    let mut selection = TreeSelection::default();
    let mut bytes = 0_u64;
    for result in walker {
        let Ok(entry) = result else {
            continue;
        };
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        let size = entry.metadata().map_or(0, |meta| meta.len());
        if selection.files.len() >= limits.max_files || bytes.saturating_add(size) > limits.max_bytes
        {
            selection.truncated = true;
            break;
        }
        bytes += size;
        selection.files.push(entry.into_path());
    }
    selection.files.sort();

    debug!(
        root = %root.display(),
        files = selection.files.len(),
        bytes,
        truncated = selection.truncated,
        "collected tree for checkpoint"
    );
    selection
}
