//! Pure command and path validator for tool invocations.
//!
//! [`CommandPolicy::validate`] maps `(tool name, arguments, cwd)` to a
//! [`Verdict`] using rules evaluated in order: plan-mode and bash switches,
//! project-root confinement of path arguments, protected paths, then the
//! destructive-command deny list and the caution list. The first denial wins.
//!
//! The policy also plans checkpoints for `bash`: [`CommandPolicy::bash_mutation`]
//! classifies a command line and names the files it may touch.

mod command;
mod config;
mod error;
mod path;
mod policy;
mod verdict;

pub use command::{analyze, CommandShape};
pub use config::{
    BashCheckpointMode, PolicyConfig, DEFAULT_CAUTION_PATTERNS, DEFAULT_DENY_PATTERNS,
    DEFAULT_PROTECTED_PATHS,
};
pub use error::PolicyError;
pub use path::{normalize_lexically, resolve_existing_prefix, resolve_path};
pub use policy::{BashMutation, CommandPolicy, MUTATING_TOOLS};
pub use verdict::Verdict;
