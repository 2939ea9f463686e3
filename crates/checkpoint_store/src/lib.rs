//! Pre-mutation file snapshots.
//!
//! A checkpoint is a JSON manifest mapping absolute paths to either the hash of
//! their prior content or an `absent` marker. Content lives in a SHA-256
//! addressed pool shared by every session, so unchanged files cost nothing to
//! checkpoint again.

mod error;
mod objects;
mod schema;
mod store;
mod tree;

pub use error::CheckpointError;
pub use objects::content_hash;
pub use schema::{
    Checkpoint, CheckpointEntry, CheckpointOrigin, CheckpointSummary, FileState, RestoreOutcome,
    RestoreReport, MANIFEST_VERSION,
};
pub use store::{checkpoint_id, checkpoint_root, CheckpointStore, CHECKPOINT_DIR, LAST, OBJECTS_DIR};
pub use tree::{collect_tree, TreeLimits, TreeSelection, DEFAULT_TREE_MAX_BYTES, DEFAULT_TREE_MAX_FILES};
