use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::CheckpointError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Shared content-addressed blob pool, fanned out by the first two hex digits.
#[derive(Debug, Clone)]
pub(crate) struct ObjectPool {
    dir: PathBuf,
}

impl ObjectPool {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub(crate) fn object_path(&self, hash: &str) -> PathBuf {
        let (prefix, rest) = hash.split_at(hash.len().min(2));
        self.dir.join(prefix).join(rest)
    }

    /// Stores `bytes` and returns their hash. Existing objects are reused.
    pub(crate) fn put(&self, bytes: &[u8]) -> Result<String, CheckpointError> {
        let hash = content_hash(bytes);
        let path = self.object_path(&hash);
        if path.is_file() {
            return Ok(hash);
        }
        write_atomic(&path, bytes, "writing checkpoint object")?;
        Ok(hash)
    }

    /// Reads an object back, verifying its hash.
    pub(crate) fn get(&self, hash: &str) -> Result<Vec<u8>, CheckpointError> {
        let path = self.object_path(hash);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::MissingObject {
                    hash: hash.to_string(),
                });
            }
            Err(source) => {
                return Err(CheckpointError::io("reading checkpoint object", path, source))
            }
        };
        let actual = content_hash(&bytes);
        if actual != hash {
            return Err(CheckpointError::CorruptObject {
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    pub(crate) fn size_of(&self, hash: &str) -> u64 {
        fs::metadata(self.object_path(hash)).map_or(0, |meta| meta.len())
    }
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over `path`.
///
/// The temp file is removed when any step fails, so `path` either holds the
/// complete content or is untouched.
pub(crate) fn write_atomic(
    path: &Path,
    bytes: &[u8],
    operation: &'static str,
) -> Result<(), CheckpointError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| CheckpointError::io(operation, parent, source))?;

    let file_name = path
        .file_name()
        .map_or_else(|| "object".into(), |name| name.to_string_lossy());
    let tmp_path = parent.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = write_and_sync(&tmp_path, bytes)
        .and_then(|()| fs::rename(&tmp_path, path))
        .and_then(|()| sync_dir(parent));
    if let Err(source) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(CheckpointError::io(operation, path, source));
    }
    Ok(())
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
