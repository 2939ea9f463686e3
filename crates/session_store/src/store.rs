use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionStoreError;
use crate::paths::session_file_name;
use crate::schema::{
    JsonLine, SessionEntry, SessionEntryKind, SessionHeader, SESSION_FORMAT_VERSION,
};

/// One open session file. Appends go straight to disk before the in-memory
/// view is updated.
pub struct SessionStore {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    pub(crate) header: SessionHeader,
    pub(crate) entries: Vec<SessionEntry>,
    pub(crate) index_by_id: HashMap<String, usize>,
    pub(crate) current_leaf_id: Option<String>,
}

impl SessionStore {
    /// Creates a new session file under `root` recording `cwd` in its header.
    pub fn create_new(root: &Path, cwd: &Path) -> Result<Self, SessionStoreError> {
        if !cwd.is_absolute() {
            return Err(SessionStoreError::NonAbsoluteCreateCwd {
                path: cwd.to_path_buf(),
            });
        }

        fs::create_dir_all(root)
            .map_err(|source| SessionStoreError::io("creating session root", root, source))?;

        let session_id = Uuid::now_v7().to_string();
        let created_at = now_rfc3339()?;
        let header = SessionHeader::v1(&session_id, &created_at, cwd.display().to_string());
        let path = root.join(session_file_name(&created_at, &session_id));

        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| SessionStoreError::io("creating session file", &path, source))?;
        let line = serde_json::to_string(&header)
            .map_err(|source| SessionStoreError::json_serialize(&path, source))?;
        write_durable_line(&mut file, &path, &line, "writing session header")?;

        debug!(session_id = %session_id, path = %path.display(), "created session");
        Ok(Self {
            path,
            file,
            header,
            entries: Vec::new(),
            index_by_id: HashMap::new(),
            current_leaf_id: None,
        })
    }

    /// Opens and fully validates an existing transcript. Entries must appear
    /// after their parent, the same order [`SessionStore::append`] writes.
    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        let path = path.to_path_buf();
        let reader = File::open(&path)
            .map(BufReader::new)
            .map_err(|source| SessionStoreError::io("opening session file", &path, source))?;

        let mut lines = reader.lines().enumerate().map(|(index, line)| {
            let line_number = index + 1;
            line.map_err(|source| SessionStoreError::io_line(&path, line_number, source))
                .and_then(|line| parse_json_line(&path, line_number, &line))
                .map(|parsed| (line_number, parsed))
        });

        let header = match lines.next().transpose()? {
            None => return Err(SessionStoreError::MissingHeader { path: path.clone() }),
            Some((line, JsonLine::Entry(_))) => {
                return Err(SessionStoreError::InvalidHeaderRecord {
                    path: path.clone(),
                    line,
                })
            }
            Some((line, JsonLine::Session(header))) => {
                validate_header_line(&path, line, &header)?;
                header
            }
        };

        let mut entries = Vec::new();
        let mut index_by_id = HashMap::new();
        for parsed in lines {
            let entry = match parsed? {
                (line, JsonLine::Session(_)) => {
                    return Err(SessionStoreError::InvalidEntryRecord {
                        path: path.clone(),
                        line,
                    })
                }
                (line, JsonLine::Entry(entry)) => {
                    admit_entry(&path, line, &entry, &index_by_id)?;
                    entry
                }
            };
            index_by_id.insert(entry.id.clone(), entries.len());
            entries.push(entry);
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|source| {
                SessionStoreError::io("opening session file for append", &path, source)
            })?;
        debug!(path = %path.display(), entries = entries.len(), "opened session");

        Ok(Self {
            current_leaf_id: entries.last().map(|entry: &SessionEntry| entry.id.clone()),
            path,
            file,
            header,
            entries,
            index_by_id,
        })
    }

    /// Validates and durably appends one entry, then advances the leaf.
    ///
    /// A rejected entry leaves both the file and the in-memory state untouched.
    pub fn append(&mut self, entry: SessionEntry) -> Result<(), SessionStoreError> {
        // The header occupies line 1.
        let line_number = self.entries.len() + 2;
        admit_entry(&self.path, line_number, &entry, &self.index_by_id)?;

        let line = serde_json::to_string(&entry)
            .map_err(|source| SessionStoreError::json_serialize(&self.path, source))?;
        write_durable_line(&mut self.file, &self.path, &line, "appending session entry")?;

        self.index_by_id.insert(entry.id.clone(), self.entries.len());
        self.current_leaf_id = Some(entry.id.clone());
        self.entries.push(entry);
        Ok(())
    }

    /// Appends `kind` as a child of the current leaf with a fresh id and timestamp.
    pub fn append_kind(
        &mut self,
        kind: SessionEntryKind,
    ) -> Result<&SessionEntry, SessionStoreError> {
        let entry = SessionEntry::new(
            Uuid::now_v7().to_string(),
            self.current_leaf_id.clone(),
            now_rfc3339()?,
            kind,
        );
        self.append(entry)?;
        let index = self.entries.len() - 1;
        Ok(&self.entries[index])
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.header.session_id
    }

    #[must_use]
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Timestamp of the newest entry, or the creation time for an empty session.
    #[must_use]
    pub fn last_active(&self) -> &str {
        self.entries
            .last()
            .map_or(self.header.created_at.as_str(), |entry| entry.ts.as_str())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn header(&self) -> &SessionHeader {
        &self.header
    }

    #[must_use]
    pub fn current_leaf_id(&self) -> Option<&str> {
        self.current_leaf_id.as_deref()
    }
}

/// Current UTC time formatted as RFC3339.
pub fn now_rfc3339() -> Result<String, SessionStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(SessionStoreError::ClockFormat)
}

fn write_durable_line(
    file: &mut File,
    path: &Path,
    line: &str,
    operation: &'static str,
) -> Result<(), SessionStoreError> {
    file.write_all(line.as_bytes())
        .and_then(|()| file.write_all(b"\n"))
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_data())
        .map_err(|source| SessionStoreError::io(operation, path, source))
}

fn parse_json_line(
    path: &Path,
    line_number: usize,
    line: &str,
) -> Result<JsonLine, SessionStoreError> {
    serde_json::from_str::<JsonLine>(line)
        .map_err(|source| SessionStoreError::json_line(path, line_number, source))
}

fn validate_header_line(
    path: &Path,
    line_number: usize,
    header: &SessionHeader,
) -> Result<(), SessionStoreError> {
    if header.version != SESSION_FORMAT_VERSION {
        return Err(SessionStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: header.version,
        });
    }

    validate_rfc3339(path, line_number, "created_at", &header.created_at)?;

    if !Path::new(&header.cwd).is_absolute() {
        return Err(SessionStoreError::NonAbsoluteCwd {
            path: path.to_path_buf(),
            line: line_number,
            cwd: header.cwd.clone(),
        });
    }

    Ok(())
}

/// Checks one entry against the ids already accepted from the same file.
fn admit_entry(
    path: &Path,
    line: usize,
    entry: &SessionEntry,
    index_by_id: &HashMap<String, usize>,
) -> Result<(), SessionStoreError> {
    validate_rfc3339(path, line, "ts", &entry.ts)?;

    if index_by_id.contains_key(&entry.id) {
        return Err(SessionStoreError::DuplicateEntryId {
            path: path.to_path_buf(),
            line,
            id: entry.id.clone(),
        });
    }
    match &entry.parent_id {
        Some(parent_id) if !index_by_id.contains_key(parent_id) => {
            Err(SessionStoreError::DanglingParentId {
                path: path.to_path_buf(),
                line,
                entry_id: entry.id.clone(),
                parent_id: parent_id.clone(),
            })
        }
        _ => Ok(()),
    }
}

fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), SessionStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(SessionStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
