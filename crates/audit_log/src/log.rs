use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::error::AuditError;
use crate::query::{AuditFilter, AuditIter};
use crate::record::{AuditEntry, AuditRecord};
use crate::redact::{redact_text, redact_value};

pub const AUDIT_DIR: &str = "audit";
pub const AUDIT_FILE_EXTENSION: &str = "jsonl";

/// Directory holding per-session audit files under a data directory.
#[must_use]
pub fn audit_root(data_dir: &Path) -> PathBuf {
    data_dir.join(AUDIT_DIR)
}

/// Append-only JSONL audit trail for one session.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: File,
    session_id: String,
    next_seq: u64,
}

impl AuditLog {
    /// Opens or creates `<root>/<session_id>.jsonl`; sequence numbers continue
    /// from the last record already in the file.
    pub fn open(root: &Path, session_id: &str) -> Result<Self, AuditError> {
        fs::create_dir_all(root)
            .map_err(|source| AuditError::io("creating audit directory", root, source))?;
        let path = root.join(format!("{session_id}.{AUDIT_FILE_EXTENSION}"));

        let last_seq = last_sequence(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::io("opening audit log", &path, source))?;
        if ends_with_partial_line(&mut file)
            .map_err(|source| AuditError::io("inspecting audit log tail", &path, source))?
        {
            file.write_all(b"\n")
                .and_then(|()| file.sync_data())
                .map_err(|source| AuditError::io("terminating torn audit line", &path, source))?;
        }

        debug!(session_id, path = %path.display(), last_seq, "opened audit log");
        Ok(Self {
            path,
            file,
            session_id: session_id.to_string(),
            next_seq: last_seq + 1,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sequence number the next record will get.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Redacts, appends and syncs one record.
    pub fn record(&mut self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let record = AuditRecord {
            seq: self.next_seq,
            ts: now_rfc3339()?,
            session_id: self.session_id.clone(),
            call_id: entry.call_id,
            tool_name: entry.tool_name,
            arguments: redact_value(&entry.arguments),
            verdict: entry.verdict,
            reason: entry.reason.as_deref().map(redact_text),
            outcome: entry.outcome,
            checkpoint_id: entry.checkpoint_id,
            summary: entry.summary.as_deref().map(redact_text),
            duration_ms: entry.duration_ms,
        };
        let line = serde_json::to_string(&record).map_err(|source| {
            AuditError::RecordSerialize {
                path: self.path.clone(),
                source,
            }
        })?;

        let written = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.write_all(b"\n"))
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_data());
        if let Err(source) = written {
            error!(path = %self.path.display(), seq = record.seq, %source, "audit write failed");
            return Err(AuditError::io("appending audit record", &self.path, source));
        }

        self.next_seq += 1;
        debug!(
            seq = record.seq,
            tool = %record.tool_name,
            verdict = %record.verdict,
            outcome = record.outcome.as_str(),
            "audit record written"
        );
        Ok(record)
    }

    /// Fails when the log file was removed or made read-only since it was opened.
    pub fn preflight(&self) -> Result<(), AuditError> {
        let metadata = fs::metadata(&self.path)
            .map_err(|source| AuditError::io("checking audit log", &self.path, source))?;
        if metadata.permissions().readonly() {
            return Err(AuditError::io(
                "checking audit log",
                &self.path,
                std::io::Error::new(ErrorKind::PermissionDenied, "audit log is read-only"),
            ));
        }
        self.file
            .sync_data()
            .map_err(|source| AuditError::io("checking audit log", &self.path, source))
    }

    /// Records matching `filter`, oldest first. Each call rereads the file.
    pub fn query(&self, filter: AuditFilter) -> Result<AuditIter, AuditError> {
        query_file(&self.path, filter)
    }

    /// Deletes a session's audit file, used when the session itself is deleted.
    pub fn remove(root: &Path, session_id: &str) -> Result<(), AuditError> {
        let path = root.join(format!("{session_id}.{AUDIT_FILE_EXTENSION}"));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AuditError::io("removing audit log", path, source)),
        }
    }
}

/// Queries an audit file without opening it for writing. A missing file
/// yields nothing.
pub fn query_file(path: &Path, filter: AuditFilter) -> Result<AuditIter, AuditError> {
    let file = match File::open(path) {
        Ok(file) => Some(file),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(source) => return Err(AuditError::io("opening audit log", path, source)),
    };
    Ok(AuditIter::new(path.to_path_buf(), file, filter))
}

fn last_sequence(path: &Path) -> Result<u64, AuditError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(AuditError::io("reading audit log", path, source)),
    };
    let mut last = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| AuditError::io("reading audit log", path, source))?;
        if let Ok(record) = serde_json::from_str::<AuditRecord>(&line) {
            last = last.max(record.seq);
        }
    }
    Ok(last)
}

fn ends_with_partial_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn now_rfc3339() -> Result<String, AuditError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(AuditError::ClockFormat)
}
