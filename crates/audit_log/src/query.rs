use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::AuditError;
use crate::record::{AuditRecord, VerdictKind};

/// Conditions a record must meet to be yielded. Empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub tool: Option<String>,
    pub verdict: Option<VerdictKind>,
    pub call_id: Option<String>,
    pub since: Option<OffsetDateTime>,
    pub until: Option<OffsetDateTime>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    #[must_use]
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    #[must_use]
    pub fn verdict(mut self, verdict: VerdictKind) -> Self {
        self.verdict = Some(verdict);
        self
    }

    #[must_use]
    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive lower bound, RFC3339.
    pub fn since(mut self, timestamp: &str) -> Result<Self, AuditError> {
        self.since = Some(parse_bound(timestamp)?);
        Ok(self)
    }

    /// Inclusive upper bound, RFC3339.
    pub fn until(mut self, timestamp: &str) -> Result<Self, AuditError> {
        self.until = Some(parse_bound(timestamp)?);
        Ok(self)
    }

    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if self.tool.as_deref().is_some_and(|tool| tool != record.tool_name) {
            return false;
        }
        if self.verdict.is_some_and(|verdict| verdict != record.verdict) {
            return false;
        }
        if self.call_id.as_deref().is_some_and(|id| id != record.call_id) {
            return false;
        }
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        let Ok(ts) = OffsetDateTime::parse(&record.ts, &Rfc3339) else {
            return false;
        };
        self.since.map_or(true, |since| ts >= since) && self.until.map_or(true, |until| ts <= until)
    }
}

fn parse_bound(timestamp: &str) -> Result<OffsetDateTime, AuditError> {
    OffsetDateTime::parse(timestamp.trim(), &Rfc3339).map_err(|_| {
        AuditError::InvalidFilterTimestamp {
            value: timestamp.to_string(),
        }
    })
}

/// Lazily reads matching records in file order (oldest first).
///
/// Blank lines are skipped. Lines that are not valid records, such as a write
/// torn by a crash, are skipped with a warning and listed by
/// [`AuditIter::skipped_lines`]; only I/O errors end iteration early.
pub struct AuditIter {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    line: usize,
    yielded: usize,
    skipped: Vec<usize>,
    filter: AuditFilter,
}

impl AuditIter {
    pub(crate) fn new(path: PathBuf, file: Option<File>, filter: AuditFilter) -> Self {
        Self {
            path,
            lines: file.map(|file| BufReader::new(file).lines()),
            line: 0,
            yielded: 0,
            skipped: Vec::new(),
            filter,
        }
    }

    /// 1-based numbers of the unreadable lines passed so far.
    #[must_use]
    pub fn skipped_lines(&self) -> &[usize] {
        &self.skipped
    }
}

impl Iterator for AuditIter {
    type Item = Result<AuditRecord, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        loop {
            let lines = self.lines.as_mut()?;
            let line = lines.next()?;
            self.line += 1;
            let line = match line {
                Ok(line) => line,
                Err(source) => {
                    self.lines = None;
                    return Some(Err(AuditError::io("reading audit log", &self.path, source)));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => record,
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line,
                        %error,
                        "skipping unreadable audit line"
                    );
                    self.skipped.push(self.line);
                    continue;
                }
            };
            if self.filter.matches(&record) {
                self.yielded += 1;
                return Some(Ok(record));
            }
        }
    }
}
