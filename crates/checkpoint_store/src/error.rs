use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot checkpoint {path}: not a regular file")]
    NotAFile { path: PathBuf },

    #[error("cannot checkpoint relative path {path}")]
    RelativePath { path: PathBuf },

    #[error("checkpoint '{id}' not found")]
    CheckpointNotFound { id: String },

    #[error("failed to parse checkpoint manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint manifest {path} has unsupported version {found}; expected 1")]
    UnsupportedVersion { path: PathBuf, found: u32 },

    #[error("failed to serialize checkpoint manifest {path}: {source}")]
    ManifestSerialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("object {hash} is missing from the checkpoint pool")]
    MissingObject { hash: String },

    #[error("object {hash} is corrupt: content hashes to {actual}")]
    CorruptObject { hash: String, actual: String },

    #[error("failed to format current UTC timestamp as RFC3339: {0}")]
    ClockFormat(#[source] time::error::Format),
}

impl CheckpointError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::CheckpointNotFound { id: id.into() }
    }
}
