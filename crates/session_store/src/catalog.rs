use std::fs;
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::SessionStoreError;
use crate::paths::session_id_from_file_name;
use crate::schema::SessionEntryKind;
use crate::store::SessionStore;

const PREVIEW_CHARS: usize = 60;

/// Header-level facts about one stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub path: PathBuf,
    pub created_at: String,
    pub last_active: String,
    pub message_count: usize,
    pub preview: Option<String>,
}

/// One row of a session listing. Unreadable files are listed, not skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionListing {
    Valid(SessionSummary),
    Corrupt { path: PathBuf, reason: String },
}

impl SessionListing {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Valid(summary) => &summary.path,
            Self::Corrupt { path, .. } => path,
        }
    }
}

impl SessionStore {
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let preview = self.entries.iter().find_map(|entry| match &entry.kind {
            SessionEntryKind::UserText { text } => Some(preview_text(text)),
            _ => None,
        });

        SessionSummary {
            session_id: self.header.session_id.clone(),
            path: self.path.clone(),
            created_at: self.header.created_at.clone(),
            last_active: self.last_active().to_string(),
            message_count: self.entries.iter().filter(|entry| entry.kind.is_message()).count(),
            preview,
        }
    }

    /// Lists every session file under `root`, newest first.
    pub fn list_sessions(root: &Path) -> Result<Vec<SessionListing>, SessionStoreError> {
        Ok(session_paths(root)?
            .into_iter()
            .map(|path| match SessionStore::open(&path) {
                Ok(store) => SessionListing::Valid(store.summary()),
                Err(error) => {
                    warn!(path = %path.display(), %error, "session file failed validation");
                    SessionListing::Corrupt {
                        path,
                        reason: error.to_string(),
                    }
                }
            })
            .collect())
    }

    /// Path of the newest session file under `root`.
    pub fn latest_session_path(root: &Path) -> Result<PathBuf, SessionStoreError> {
        session_paths(root)?
            .into_iter()
            .next()
            .ok_or_else(|| SessionStoreError::NoSessionsFound {
                root: root.to_path_buf(),
            })
    }

    /// Opens the newest session that passes validation. Corrupt files are
    /// skipped with a warning.
    pub fn open_latest(root: &Path) -> Result<Self, SessionStoreError> {
        for path in session_paths(root)? {
            match Self::open(&path) {
                Ok(store) => return Ok(store),
                Err(error) if error.is_corrupt() => {
                    warn!(path = %path.display(), %error, "skipping corrupt session file");
                }
                Err(error) => return Err(error),
            }
        }
        Err(SessionStoreError::NoSessionsFound {
            root: root.to_path_buf(),
        })
    }

    /// Resolves a full session id or an unambiguous prefix of one.
    pub fn find_session_path(
        root: &Path,
        id_or_prefix: &str,
    ) -> Result<PathBuf, SessionStoreError> {
        let mut matches = session_paths(root)?
            .into_iter()
            .filter(|path| {
                session_id_from_file_name(path).is_some_and(|id| id.starts_with(id_or_prefix))
            })
            .collect::<Vec<_>>();

        if let Some(exact) = matches
            .iter()
            .position(|path| session_id_from_file_name(path) == Some(id_or_prefix))
        {
            return Ok(matches.swap_remove(exact));
        }

        match matches.len() {
            0 => Err(SessionStoreError::SessionNotFound {
                root: root.to_path_buf(),
                session_id: id_or_prefix.to_string(),
            }),
            1 => Ok(matches.remove(0)),
            count => Err(SessionStoreError::AmbiguousSessionId {
                prefix: id_or_prefix.to_string(),
                matches: count,
            }),
        }
    }

    pub fn open_by_id(root: &Path, id_or_prefix: &str) -> Result<Self, SessionStoreError> {
        Self::open(&Self::find_session_path(root, id_or_prefix)?)
    }

    /// Deletes one session file on explicit user request.
    pub fn delete(root: &Path, id_or_prefix: &str) -> Result<PathBuf, SessionStoreError> {
        let path = Self::find_session_path(root, id_or_prefix)?;
        fs::remove_file(&path)
            .map_err(|source| SessionStoreError::io("deleting session file", &path, source))?;
        info!(path = %path.display(), "deleted session");
        Ok(path)
    }

    /// Deletes valid sessions whose last activity is older than `max_age`.
    /// Corrupt files are left in place for inspection.
    pub fn prune_older_than(
        root: &Path,
        max_age: Duration,
        now: OffsetDateTime,
    ) -> Result<Vec<PathBuf>, SessionStoreError> {
        let cutoff = now - max_age;
        let mut removed = Vec::new();

        for listing in Self::list_sessions(root)? {
            let SessionListing::Valid(summary) = listing else {
                continue;
            };
            let Ok(last_active) = OffsetDateTime::parse(&summary.last_active, &Rfc3339) else {
                continue;
            };
            if last_active < cutoff {
                fs::remove_file(&summary.path).map_err(|source| {
                    SessionStoreError::io("pruning session file", &summary.path, source)
                })?;
                removed.push(summary.path);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "pruned expired sessions");
        }
        Ok(removed)
    }
}

/// Session file paths under `root`, newest first. A missing root is empty.
fn session_paths(root: &Path) -> Result<Vec<PathBuf>, SessionStoreError> {
    let read_dir = match fs::read_dir(root) {
        Ok(read_dir) => read_dir,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(SessionStoreError::io(
                "listing session root",
                root,
                source,
            ))
        }
    };

    let mut paths = Vec::new();
    for dir_entry in read_dir {
        let dir_entry = dir_entry
            .map_err(|source| SessionStoreError::io("listing session root", root, source))?;
        let path = dir_entry.path();
        if path.is_file() && session_id_from_file_name(&path).is_some() {
            paths.push(path);
        }
    }

    paths.sort_by(|left, right| right.file_name().cmp(&left.file_name()));
    Ok(paths)
}

fn preview_text(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= PREVIEW_CHARS {
        return line.to_string();
    }
    let mut preview = line.chars().take(PREVIEW_CHARS).collect::<String>();
    preview.push_str("...");
    preview
}
