//! Append-only audit trail of tool-call resolution attempts.
//!
//! Each session writes `<data>/audit/<session_id>.jsonl`. Every record is
//! synced before `record` returns and secrets are masked before they reach
//! disk.

mod error;
mod log;
mod query;
mod record;
mod redact;

pub use error::AuditError;
pub use log::{audit_root, query_file, AuditLog, AUDIT_DIR, AUDIT_FILE_EXTENSION};
pub use query::{AuditFilter, AuditIter};
pub use record::{AuditEntry, AuditRecord, Outcome, VerdictKind};
pub use redact::{redact_text, redact_value, REDACTED};
