use std::path::{Path, PathBuf};

pub const SESSION_DIR: &str = "sessions";
pub const SESSION_FILE_EXTENSION: &str = "jsonl";

/// Directory holding session files under a data directory.
#[must_use]
pub fn session_root(data_dir: &Path) -> PathBuf {
    data_dir.join(SESSION_DIR)
}

#[must_use]
pub fn sanitize_timestamp_for_filename(timestamp: &str) -> String {
    timestamp
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' => '-',
            _ => c,
        })
        .collect()
}

#[must_use]
pub fn session_file_name(created_at: &str, session_id: &str) -> String {
    format!(
        "{}_{}.{SESSION_FILE_EXTENSION}",
        sanitize_timestamp_for_filename(created_at),
        session_id
    )
}

/// Extracts the session id from a `{timestamp}_{id}.jsonl` file name.
#[must_use]
pub fn session_id_from_file_name(path: &Path) -> Option<&str> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_FILE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('_').map(|(_, id)| id)
}
