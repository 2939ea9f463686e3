use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tracing::{debug, warn};

use crate::command::analyze;
use crate::config::{BashCheckpointMode, PolicyConfig};
use crate::error::PolicyError;
use crate::path::{normalize_lexically, resolve_existing_prefix, resolve_path};
use crate::verdict::Verdict;

/// Tools that can change the filesystem.
pub const MUTATING_TOOLS: &[&str] = &["write_file", "edit_file", "bash"];

#[derive(Debug, Clone)]
struct Rule {
    source: String,
    regex: Regex,
}

/// What a `bash` invocation needs checkpointed before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BashMutation {
    /// Nothing to snapshot.
    None,
    /// Resolved in-project files the command may write or delete.
    Paths(Vec<PathBuf>),
    /// Targets are unknown; snapshot the workspace tree.
    Workspace,
}

/// Compiled validator rules bound to one project root.
///
/// Validation is a rule engine that reduces accidental damage. It is not a
/// sandbox and gives no guarantee against adversarial commands.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    root: PathBuf,
    protected: Vec<PathBuf>,
    deny: Vec<Rule>,
    caution: Vec<Rule>,
    strict: bool,
    allow_bash: bool,
    read_only: bool,
    bash_checkpoint: BashCheckpointMode,
}

impl CommandPolicy {
    /// Compiles `config` for `project_root`, which must be an existing directory.
    pub fn new(config: &PolicyConfig, project_root: &Path) -> Result<Self, PolicyError> {
        let root = project_root
            .canonicalize()
            .map_err(|source| PolicyError::ProjectRoot {
                path: project_root.to_path_buf(),
                source,
            })?;
        if !root.is_dir() {
            return Err(PolicyError::ProjectRootNotDirectory { path: root });
        }

        let protected = config
            .protected_paths
            .iter()
            .filter(|path| !path.trim().is_empty())
            .map(|path| resolve_existing_prefix(&normalize_lexically(&root.join(path.trim()))))
            .collect();

        Ok(Self {
            protected,
            deny: compile_rules("deny", &config.deny_patterns)?,
            caution: compile_rules("caution", &config.caution_patterns)?,
            strict: config.strict,
            allow_bash: config.allow_bash,
            read_only: config.read_only,
            bash_checkpoint: config.bash_checkpoint,
            root,
        })
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    #[must_use]
    pub fn bash_checkpoint_mode(&self) -> BashCheckpointMode {
        self.bash_checkpoint
    }

    /// Adds a protected path after construction, e.g. the data directory.
    pub fn protect(&mut self, path: &Path) {
        let resolved = resolve_existing_prefix(&normalize_lexically(&self.root.join(path)));
        if resolved.starts_with(&self.root) && !self.protected.contains(&resolved) {
            self.protected.push(resolved);
        }
    }

    /// Judges one tool invocation. The same inputs always yield the same verdict.
    #[must_use]
    pub fn validate(&self, tool_name: &str, args: &Value, cwd: &Path) -> Verdict {
        let verdict = self.evaluate(tool_name, args, cwd);
        match &verdict {
            Verdict::Deny(reason) => warn!(tool = tool_name, %reason, "tool call denied"),
            Verdict::AllowWithWarning(reason) => {
                warn!(tool = tool_name, %reason, "tool call allowed with warning")
            }
            Verdict::Allow => debug!(tool = tool_name, "tool call allowed"),
        }
        verdict
    }

    fn evaluate(&self, tool_name: &str, args: &Value, cwd: &Path) -> Verdict {
        if self.read_only && MUTATING_TOOLS.contains(&tool_name) {
            return Verdict::Deny(format!(
                "plan mode is read-only; '{tool_name}' is not available"
            ));
        }

        match tool_name {
            "read_file" => match string_arg(args, "path") {
                Some(path) => self.check_path(path, cwd, false),
                None => Verdict::Deny("missing 'path' argument".to_string()),
            },
            "write_file" | "edit_file" => match string_arg(args, "path") {
                Some(path) => self.check_path(path, cwd, true),
                None => Verdict::Deny("missing 'path' argument".to_string()),
            },
            "grep_files" => match string_arg(args, "path_scope") {
                Some(scope) => self.check_path(scope, cwd, false),
                None => Verdict::Allow,
            },
            "glob_files" => match string_arg(args, "pattern") {
                Some(pattern) => check_glob_pattern(pattern),
                None => Verdict::Deny("missing 'pattern' argument".to_string()),
            },
            "bash" => {
                if !self.allow_bash {
                    return Verdict::Deny("bash is disabled by policy".to_string());
                }
                match string_arg(args, "command") {
                    Some(command) => self.check_command(command),
                    None => Verdict::Deny("missing 'command' argument".to_string()),
                }
            }
            other => Verdict::Deny(format!("unknown tool '{other}'")),
        }
    }

    /// Resolves `raw` against `cwd` and confines it to the project root.
    pub fn resolve(&self, raw: &str, cwd: &Path) -> Result<PathBuf, String> {
        if raw.trim().is_empty() {
            return Err("path is empty".to_string());
        }
        if raw.contains('\0') {
            return Err("path contains a NUL byte".to_string());
        }

        let resolved = resolve_path(&self.root, cwd, raw);
        if !resolved.starts_with(&self.root) {
            return Err(format!(
                "path '{raw}' resolves outside the project root {}",
                self.root.display()
            ));
        }
        Ok(resolved)
    }

    fn check_path(&self, raw: &str, cwd: &Path, writes: bool) -> Verdict {
        let resolved = match self.resolve(raw, cwd) {
            Ok(resolved) => resolved,
            Err(reason) => return Verdict::Deny(reason),
        };

        if writes {
            if let Some(protected) = self
                .protected
                .iter()
                .find(|protected| resolved.starts_with(protected))
            {
                return Verdict::Deny(format!(
                    "'{raw}' is inside protected path {}",
                    protected.display()
                ));
            }
        }

        Verdict::Allow
    }

    fn check_command(&self, command: &str) -> Verdict {
        let command = command.trim();
        if command.is_empty() {
            return Verdict::Deny("command is empty".to_string());
        }

        if let Some(rule) = self.deny.iter().find(|rule| rule.regex.is_match(command)) {
            let mut reason = format!("command matches destructive pattern `{}`", rule.source);
            if let Some(hint) = safer_alternative(command) {
                reason.push_str("; ");
                reason.push_str(hint);
            }
            return Verdict::Deny(reason);
        }

        if let Some(rule) = self.caution.iter().find(|rule| rule.regex.is_match(command)) {
            let reason = format!("command matches caution pattern `{}`", rule.source);
            if self.strict {
                return Verdict::Deny(format!("{reason} (strict mode)"));
            }
            return Verdict::AllowWithWarning(reason);
        }

        Verdict::Allow
    }

    /// Decides what a `bash` command needs checkpointed under the configured mode.
    #[must_use]
    pub fn bash_mutation(&self, command: &str, cwd: &Path) -> BashMutation {
        if self.bash_checkpoint == BashCheckpointMode::Never {
            return BashMutation::None;
        }

        let shape = analyze(command);
        if !shape.mutating {
            return match self.bash_checkpoint {
                BashCheckpointMode::Always => BashMutation::Workspace,
                _ => BashMutation::None,
            };
        }
        if shape.unresolved {
            return BashMutation::Workspace;
        }

        let mut paths: Vec<PathBuf> = shape
            .targets
            .iter()
            .filter_map(|target| self.resolve(target, cwd).ok())
            .collect();

        for (sources, destination) in &shape.copies {
            let Ok(destination) = self.resolve(destination, cwd) else {
                continue;
            };
            if destination.is_dir() {
                paths.extend(
                    sources
                        .iter()
                        .filter_map(|source| Path::new(source).file_name())
                        .map(|name| destination.join(name)),
                );
            }
        }

        paths.sort();
        paths.dedup();
        BashMutation::Paths(paths)
    }
}

fn compile_rules(list: &'static str, patterns: &[String]) -> Result<Vec<Rule>, PolicyError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|regex| Rule {
                    source: pattern.clone(),
                    regex,
                })
                .map_err(|source| PolicyError::InvalidPattern {
                    list,
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

fn string_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn check_glob_pattern(pattern: &str) -> Verdict {
    if pattern.trim().is_empty() {
        return Verdict::Deny("glob pattern is empty".to_string());
    }
    if pattern.contains('\0') {
        return Verdict::Deny("glob pattern contains a NUL byte".to_string());
    }
    let path = Path::new(pattern);
    if path.is_absolute() || pattern.starts_with('~') {
        return Verdict::Deny("glob pattern must be relative to the project root".to_string());
    }
    if path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        return Verdict::Deny("glob pattern must not contain '..'".to_string());
    }
    Verdict::Allow
}

fn safer_alternative(command: &str) -> Option<&'static str> {
    let lower = command.to_ascii_lowercase();
    if lower.contains("rm ") {
        Some("name the exact files or directories to delete instead")
    } else if lower.contains("chmod") {
        Some("use specific permissions (644 for files, 755 for directories) on specific paths")
    } else if lower.contains("dd ") {
        Some("write to a regular file inside the project instead of a device")
    } else {
        None
    }
}
