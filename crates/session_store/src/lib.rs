//! Durable, append-only conversation transcripts.
//!
//! One JSONL file per session: a versioned header line followed by entry lines
//! linked through `parent_id`. Files are validated strictly on open; a file that
//! fails validation is reported as corrupt and never rewritten.

mod catalog;
mod error;
mod export;
mod paths;
mod replay;
mod schema;
mod store;

pub use catalog::{SessionListing, SessionSummary};
pub use error::SessionStoreError;
pub use export::ExportFormat;
pub use paths::{session_file_name, session_id_from_file_name, session_root};
pub use schema::{
    EntryRecordType, SessionEntry, SessionEntryKind, SessionHeader, SessionRecordType,
    SESSION_FORMAT_VERSION,
};
pub use store::{now_rfc3339, SessionStore};
