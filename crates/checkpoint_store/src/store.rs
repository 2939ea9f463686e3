use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::objects::{content_hash, write_atomic, ObjectPool};
use crate::schema::{
    Checkpoint, CheckpointEntry, CheckpointOrigin, CheckpointSummary, FileState, RestoreOutcome,
    RestoreReport, MANIFEST_VERSION,
};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const OBJECTS_DIR: &str = "objects";
/// Selector resolving to the newest checkpoint.
pub const LAST: &str = "last";

const ID_PREFIX: &str = "cp-";
const MANIFEST_EXTENSION: &str = "json";

/// Directory holding every session partition and the shared object pool.
#[must_use]
pub fn checkpoint_root(data_dir: &Path) -> PathBuf {
    data_dir.join(CHECKPOINT_DIR)
}

#[must_use]
pub fn checkpoint_id(sequence: u64) -> String {
    format!("{ID_PREFIX}{sequence:06}")
}

fn sequence_of(id: &str) -> Option<u64> {
    id.strip_prefix(ID_PREFIX)?.parse().ok()
}

/// Snapshots for one session.
///
/// Manifests live in `<root>/<session_id>/`; file content goes to the pool in
/// `<root>/objects/` shared by all sessions.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    session_id: String,
    objects: ObjectPool,
    next_sequence: u64,
    max_checkpoints: Option<usize>,
}

impl CheckpointStore {
    pub fn open(root: &Path, session_id: &str) -> Result<Self, CheckpointError> {
        let dir = root.join(session_id);
        fs::create_dir_all(&dir)
            .map_err(|source| CheckpointError::io("creating checkpoint directory", &dir, source))?;

        let last = manifest_sequences(&dir)?.into_iter().max().unwrap_or(0);
        debug!(session_id, dir = %dir.display(), last, "opened checkpoint store");
        Ok(Self {
            objects: ObjectPool::new(root.join(OBJECTS_DIR)),
            dir,
            session_id: session_id.to_string(),
            next_sequence: last + 1,
            max_checkpoints: None,
        })
    }

    /// Keeps at most `max` manifests; the oldest are pruned after each snapshot.
    #[must_use]
    pub fn with_retention(mut self, max: Option<usize>) -> Self {
        self.max_checkpoints = max.filter(|max| *max > 0);
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records the current state of `paths` and returns the persisted manifest.
    ///
    /// Every blob and the manifest are on disk before this returns. Paths must be
    /// absolute; missing ones are recorded as absent and directories are refused.
    pub fn snapshot(
        &mut self,
        paths: &[PathBuf],
        label: Option<&str>,
        origin: CheckpointOrigin,
    ) -> Result<Checkpoint, CheckpointError> {
        let unique = paths.iter().cloned().collect::<BTreeSet<_>>();
        let mut entries = Vec::with_capacity(unique.len());
        for path in unique {
            let state = self.capture(&path)?;
            entries.push(CheckpointEntry { path, state });
        }

        let checkpoint = Checkpoint {
            version: MANIFEST_VERSION,
            id: checkpoint_id(self.next_sequence),
            session_id: self.session_id.clone(),
            created_at: now_rfc3339()?,
            label: label.map(str::to_string),
            origin,
            entries,
        };
        let path = self.manifest_path(&checkpoint.id);
        let mut bytes = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|source| CheckpointError::ManifestSerialize {
                path: path.clone(),
                source,
            })?;
        bytes.push(b'\n');
        write_atomic(&path, &bytes, "writing checkpoint manifest")?;
        self.next_sequence += 1;

        info!(
            checkpoint_id = %checkpoint.id,
            origin = %origin,
            files = checkpoint.entries.len(),
            "checkpoint created"
        );
        self.prune()?;
        Ok(checkpoint)
    }

    fn capture(&self, path: &Path) -> Result<FileState, CheckpointError> {
        if !path.is_absolute() {
            return Err(CheckpointError::RelativePath {
                path: path.to_path_buf(),
            });
        }
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(FileState::Absent),
            Err(source) => {
                return Err(CheckpointError::io("inspecting checkpoint path", path, source))
            }
        };
        if !metadata.is_file() {
            return Err(CheckpointError::NotAFile {
                path: path.to_path_buf(),
            });
        }
        let bytes = fs::read(path)
            .map_err(|source| CheckpointError::io("reading file for checkpoint", path, source))?;
        let hash = self.objects.put(&bytes)?;
        Ok(FileState::Present {
            hash,
            size: bytes.len() as u64,
        })
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut sequences = manifest_sequences(&self.dir)?;
        sequences.sort_unstable_by(|left, right| right.cmp(left));
        sequences
            .into_iter()
            .map(|sequence| self.get(&checkpoint_id(sequence)).map(|cp| cp.summary()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Checkpoint, CheckpointError> {
        if sequence_of(id).is_none() {
            return Err(CheckpointError::not_found(id));
        }
        let path = self.manifest_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::not_found(id))
            }
            Err(source) => {
                return Err(CheckpointError::io("reading checkpoint manifest", path, source))
            }
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointError::ManifestParse {
                path: path.clone(),
                source,
            })?;
        if checkpoint.version != MANIFEST_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path,
                found: checkpoint.version,
            });
        }
        Ok(checkpoint)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        match manifest_sequences(&self.dir)?.into_iter().max() {
            Some(sequence) => self.get(&checkpoint_id(sequence)).map(Some),
            None => Ok(None),
        }
    }

    /// Accepts a checkpoint id or `last`.
    pub fn resolve(&self, selector: &str) -> Result<Checkpoint, CheckpointError> {
        let selector = selector.trim();
        if selector.eq_ignore_ascii_case(LAST) {
            return self.latest()?.ok_or_else(|| CheckpointError::not_found(LAST));
        }
        self.get(selector)
    }

    /// Puts every path recorded in the selected checkpoint back to its recorded
    /// state.
    ///
    /// The current state of those paths is snapshotted first with origin
    /// `pre_restore`, so restoring `last` again undoes this restore. Paths now
    /// occupied by a directory are left out of that snapshot and handled per
    /// path below. A path that cannot be restored is reported as failed and the
    /// rest still proceed.
    pub fn restore(&mut self, selector: &str) -> Result<RestoreReport, CheckpointError> {
        let target = self.resolve(selector)?;
        let capturable = target
            .paths()
            .into_iter()
            .filter(|path| !path.is_dir())
            .collect::<Vec<_>>();
        let pre_restore = self.snapshot(
            &capturable,
            Some(&format!("before restoring {}", target.id)),
            CheckpointOrigin::PreRestore,
        )?;

        let mut paths = Vec::with_capacity(target.entries.len());
        for entry in &target.entries {
            let outcome = self.restore_entry(entry);
            if let RestoreOutcome::Failed(reason) = &outcome {
                warn!(path = %entry.path.display(), reason, "restore failed for path");
            }
            paths.push((entry.path.clone(), outcome));
        }

        let report = RestoreReport {
            checkpoint_id: target.id,
            pre_restore_id: pre_restore.id,
            paths,
        };
        info!(
            checkpoint_id = %report.checkpoint_id,
            pre_restore_id = %report.pre_restore_id,
            failures = report.failures(),
            "checkpoint restored"
        );
        Ok(report)
    }

    fn restore_entry(&self, entry: &CheckpointEntry) -> RestoreOutcome {
        let path = &entry.path;
        match &entry.state {
            FileState::Present { hash, .. } => {
                if fs::read(path).is_ok_and(|current| content_hash(&current) == *hash) {
                    return RestoreOutcome::Unchanged;
                }
                if path.is_dir() {
                    return RestoreOutcome::Failed("a directory now occupies this path".into());
                }
                let result = self
                    .objects
                    .get(hash)
                    .and_then(|bytes| write_atomic(path, &bytes, "restoring file"));
                match result {
                    Ok(()) => RestoreOutcome::Restored,
                    Err(error) => RestoreOutcome::Failed(error.to_string()),
                }
            }
            FileState::Absent => match fs::symlink_metadata(path) {
                Err(error) if error.kind() == ErrorKind::NotFound => RestoreOutcome::Unchanged,
                Err(error) => RestoreOutcome::Failed(error.to_string()),
                // Created after the checkpoint, e.g. by `mkdir`; only removed when empty.
                Ok(metadata) if metadata.is_dir() => match fs::remove_dir(path) {
                    Ok(()) => RestoreOutcome::Deleted,
                    Err(error) => RestoreOutcome::Failed(format!(
                        "a directory now occupies this path and could not be removed: {error}"
                    )),
                },
                Ok(_) => match fs::remove_file(path) {
                    Ok(()) => RestoreOutcome::Deleted,
                    Err(error) => RestoreOutcome::Failed(error.to_string()),
                },
            },
        }
    }

    /// Removes one manifest. Blobs stay in the shared pool.
    pub fn delete(&mut self, id: &str) -> Result<(), CheckpointError> {
        if sequence_of(id).is_none() {
            return Err(CheckpointError::not_found(id));
        }
        let path = self.manifest_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(checkpoint_id = id, "deleted checkpoint");
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(CheckpointError::not_found(id))
            }
            Err(source) => Err(CheckpointError::io("deleting checkpoint manifest", path, source)),
        }
    }

    /// Bytes used by this session's manifests plus the distinct objects they
    /// reference.
    pub fn storage_bytes(&self) -> Result<u64, CheckpointError> {
        let mut manifests = 0;
        let mut objects = BTreeMap::new();
        for sequence in manifest_sequences(&self.dir)? {
            let id = checkpoint_id(sequence);
            manifests += fs::metadata(self.manifest_path(&id)).map_or(0, |meta| meta.len());
            for entry in self.get(&id)?.entries {
                if let FileState::Present { hash, .. } = entry.state {
                    let size = self.objects.size_of(&hash);
                    objects.insert(hash, size);
                }
            }
        }
        Ok(manifests + objects.values().sum::<u64>())
    }

    /// Deletes a session partition, used when the session itself is deleted.
    pub fn remove_partition(root: &Path, session_id: &str) -> Result<(), CheckpointError> {
        let dir = root.join(session_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::io(
                "removing checkpoint directory",
                dir,
                source,
            )),
        }
    }

    fn prune(&mut self) -> Result<(), CheckpointError> {
        let Some(max) = self.max_checkpoints else {
            return Ok(());
        };
        let mut sequences = manifest_sequences(&self.dir)?;
        if sequences.len() <= max {
            return Ok(());
        }
        sequences.sort_unstable();
        let excess = sequences.len() - max;
        for sequence in sequences.into_iter().take(excess) {
            self.delete(&checkpoint_id(sequence))?;
        }
        debug!(removed = excess, max, "pruned old checkpoints");
        Ok(())
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{MANIFEST_EXTENSION}"))
    }
}

fn manifest_sequences(dir: &Path) -> Result<Vec<u64>, CheckpointError> {
    let read_dir = fs::read_dir(dir)
        .map_err(|source| CheckpointError::io("listing checkpoints", dir, source))?;
    let mut sequences = Vec::new();
    for entry in read_dir {
        let entry =
            entry.map_err(|source| CheckpointError::io("listing checkpoints", dir, source))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(MANIFEST_EXTENSION) {
            continue;
        }
        if let Some(sequence) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(sequence_of)
        {
            sequences.push(sequence);
        }
    }
    Ok(sequences)
}

fn now_rfc3339() -> Result<String, CheckpointError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(CheckpointError::ClockFormat)
}
