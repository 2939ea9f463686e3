//! Fixed tool set exposed to providers.
//!
//! The registry knows tool names, JSON schemas and how to turn raw provider
//! arguments into a typed [`ToolCall`]. Policy decisions live in
//! `tool_policy`; checkpointing and auditing live in the agent loop.

mod files;
mod search;
mod shell;

use std::path::{Path, PathBuf};

use agent_provider::ToolDefinition;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ToolsSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    EditFile,
    GlobFiles,
    GrepFiles,
    Bash,
}

impl ToolKind {
    pub const ALL: [Self; 6] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::EditFile,
        Self::GlobFiles,
        Self::GrepFiles,
        Self::Bash,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::EditFile => "edit_file",
            Self::GlobFiles => "glob_files",
            Self::GrepFiles => "grep_files",
            Self::Bash => "bash",
        }
    }

    /// True for tools that may change the filesystem. `bash` is included; the
    /// policy decides per command whether a checkpoint is needed.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        matches!(self, Self::WriteFile | Self::EditFile | Self::Bash)
    }

    fn description(self) -> &'static str {
        match self {
            Self::ReadFile => {
                "Read a UTF-8 text file. Optional 1-indexed inclusive line range."
            }
            Self::WriteFile => {
                "Create or overwrite a file with the given content. Parent directories are created."
            }
            Self::EditFile => {
                "Apply a list of edits to one file. Each edit is either {old_text, new_text, replace_all?} \
                 or {line_start, line_end, new_text}. Nothing is written unless every edit applies."
            }
            Self::GlobFiles => "List paths under the project root matching a glob pattern.",
            Self::GrepFiles => {
                "Search file contents with a regular expression. Honors .gitignore; binary files are skipped."
            }
            Self::Bash => "Run a shell command with bash -lc in the project root.",
        }
    }

    fn input_schema(self) -> Value {
        match self {
            Self::ReadFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "line_start": {"type": "integer", "minimum": 1},
                    "line_end": {"type": "integer", "minimum": 1}
                },
                "required": ["path"],
                "additionalProperties": false
            }),
            Self::WriteFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            Self::EditFile => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "edits": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "old_text": {"type": "string"},
                                "new_text": {"type": "string"},
                                "replace_all": {"type": "boolean"},
                                "line_start": {"type": "integer", "minimum": 1},
                                "line_end": {"type": "integer", "minimum": 1}
                            },
                            "required": ["new_text"]
                        }
                    }
                },
                "required": ["path", "edits"],
                "additionalProperties": false
            }),
            Self::GlobFiles => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Relative to the project root, e.g. src/**/*.rs"}
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
            Self::GrepFiles => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path_scope": {"type": "string"}
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
            Self::Bash => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_seconds": {"type": "integer", "minimum": 1}
                },
                "required": ["command"],
                "additionalProperties": false
            }),
        }
    }

    #[must_use]
    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: Some(self.description().to_string()),
            input_schema: self.input_schema(),
        }
    }
}

/// Looks up a tool by its wire name.
#[must_use]
pub fn resolve(name: &str) -> Option<ToolKind> {
    ToolKind::ALL.into_iter().find(|kind| kind.name() == name)
}

/// Definitions advertised to providers. `read_only` hides mutating tools.
#[must_use]
pub fn definitions(read_only: bool) -> Vec<ToolDefinition> {
    ToolKind::ALL
        .into_iter()
        .filter(|kind| !(read_only && kind.is_mutating()))
        .map(ToolKind::definition)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Replace {
        old_text: String,
        new_text: String,
        replace_all: bool,
    },
    Lines {
        line_start: usize,
        line_end: usize,
        new_text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    ReadFile {
        path: String,
        line_start: Option<usize>,
        line_end: Option<usize>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    EditFile {
        path: String,
        edits: Vec<Edit>,
    },
    GlobFiles {
        pattern: String,
    },
    GrepFiles {
        pattern: String,
        path_scope: Option<String>,
    },
    Bash {
        command: String,
        timeout_sec: Option<u64>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileArgs {
    path: String,
    line_start: Option<usize>,
    line_end: Option<usize>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EditFileArgs {
    path: String,
    edits: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplaceEditArgs {
    old_text: String,
    new_text: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LineEditArgs {
    line_start: usize,
    line_end: usize,
    new_text: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobFilesArgs {
    pattern: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepFilesArgs {
    pattern: String,
    path_scope: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BashArgs {
    command: String,
    #[serde(alias = "timeout_sec")]
    timeout_seconds: Option<u64>,
}

fn decode<T: DeserializeOwned>(arguments: &Value) -> Result<T, String> {
    serde_json::from_value(arguments.clone()).map_err(|error| error.to_string())
}

impl ToolCall {
    /// Parses provider arguments for `kind`. The error text is shown to the model.
    pub fn parse(kind: ToolKind, arguments: &Value) -> Result<Self, String> {
        if !arguments.is_object() {
            return Err("arguments must be a JSON object".to_string());
        }

        let call = match kind {
            ToolKind::ReadFile => {
                let args: ReadFileArgs = decode(arguments)?;
                if let (Some(start), Some(end)) = (args.line_start, args.line_end) {
                    if end < start {
                        return Err(format!("line_end ({end}) is before line_start ({start})"));
                    }
                }
                if args.line_start == Some(0) || args.line_end == Some(0) {
                    return Err("line numbers are 1-indexed".to_string());
                }
                Self::ReadFile {
                    path: args.path,
                    line_start: args.line_start,
                    line_end: args.line_end,
                }
            }
            ToolKind::WriteFile => {
                let args: WriteFileArgs = decode(arguments)?;
                Self::WriteFile {
                    path: args.path,
                    content: args.content,
                }
            }
            ToolKind::EditFile => {
                let args: EditFileArgs = decode(arguments)?;
                if args.edits.is_empty() {
                    return Err("edits must contain at least one edit".to_string());
                }
                let edits = args
                    .edits
                    .iter()
                    .enumerate()
                    .map(|(index, edit)| {
                        parse_edit(edit).map_err(|error| format!("edit {}: {error}", index + 1))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Self::EditFile {
                    path: args.path,
                    edits,
                }
            }
            ToolKind::GlobFiles => {
                let args: GlobFilesArgs = decode(arguments)?;
                Self::GlobFiles {
                    pattern: args.pattern,
                }
            }
            ToolKind::GrepFiles => {
                let args: GrepFilesArgs = decode(arguments)?;
                Self::GrepFiles {
                    pattern: args.pattern,
                    path_scope: args.path_scope,
                }
            }
            ToolKind::Bash => {
                let args: BashArgs = decode(arguments)?;
                if args.timeout_seconds == Some(0) {
                    return Err("timeout_seconds must be > 0".to_string());
                }
                Self::Bash {
                    command: args.command,
                    timeout_sec: args.timeout_seconds,
                }
            }
        };
        Ok(call)
    }

    #[must_use]
    pub fn kind(&self) -> ToolKind {
        match self {
            Self::ReadFile { .. } => ToolKind::ReadFile,
            Self::WriteFile { .. } => ToolKind::WriteFile,
            Self::EditFile { .. } => ToolKind::EditFile,
            Self::GlobFiles { .. } => ToolKind::GlobFiles,
            Self::GrepFiles { .. } => ToolKind::GrepFiles,
            Self::Bash { .. } => ToolKind::Bash,
        }
    }

    /// Raw path argument of file-mutating calls.
    #[must_use]
    pub fn target_path(&self) -> Option<&str> {
        match self {
            Self::WriteFile { path, .. } | Self::EditFile { path, .. } => Some(path),
            _ => None,
        }
    }
}

fn parse_edit(edit: &Value) -> Result<Edit, String> {
    let Some(object) = edit.as_object() else {
        return Err("edit must be a JSON object".to_string());
    };
    if object.contains_key("old_text") {
        let args: ReplaceEditArgs = decode(edit)?;
        if args.old_text.is_empty() {
            return Err("old_text must not be empty".to_string());
        }
        return Ok(Edit::Replace {
            old_text: args.old_text,
            new_text: args.new_text,
            replace_all: args.replace_all,
        });
    }
    if object.contains_key("line_start") || object.contains_key("line_end") {
        let args: LineEditArgs = decode(edit)?;
        if args.line_start == 0 || args.line_end < args.line_start {
            return Err(format!(
                "invalid line range {}..={}",
                args.line_start, args.line_end
            ));
        }
        return Ok(Edit::Lines {
            line_start: args.line_start,
            line_end: args.line_end,
            new_text: args.new_text,
        });
    }
    Err("edit needs either old_text or line_start/line_end".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
    pub files_touched: Vec<PathBuf>,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
            files_touched: Vec::new(),
            exit_code: None,
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
            files_touched: Vec::new(),
            exit_code: None,
        }
    }

    #[must_use]
    pub fn touching(mut self, path: impl Into<PathBuf>) -> Self {
        self.files_touched.push(path.into());
        self
    }
}

/// Runs typed tool calls. Implementations report failures through
/// [`ToolOutput::fail`] instead of returning errors.
pub trait ToolExecutor: Send {
    fn execute(&mut self, call: &ToolCall, cwd: &Path) -> ToolOutput;
}

#[derive(Debug, Clone)]
pub struct BuiltinToolExecutor {
    workspace_root: PathBuf,
    limits: ToolsSection,
}

impl BuiltinToolExecutor {
    pub fn new(workspace_root: impl Into<PathBuf>, limits: ToolsSection) -> Result<Self, String> {
        let workspace_root = workspace_root.into();
        let canonical_root = workspace_root
            .canonicalize()
            .map_err(|err| format!("Failed to resolve workspace root: {err}"))?;

        if !canonical_root.is_dir() {
            return Err("Workspace root must be a directory".to_string());
        }

        Ok(Self {
            workspace_root: canonical_root,
            limits,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolves `raw` against `cwd` and refuses anything outside the root.
    fn resolve(&self, raw: &str, cwd: &Path) -> Result<PathBuf, String> {
        if raw.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }
        let resolved = tool_policy::resolve_path(&self.workspace_root, cwd, raw);
        if resolved.starts_with(&self.workspace_root) {
            Ok(resolved)
        } else {
            Err(format!("Path escapes workspace root: {}", resolved.display()))
        }
    }

    fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace_root)
            .map(|relative| relative.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }
}

impl ToolExecutor for BuiltinToolExecutor {
    fn execute(&mut self, call: &ToolCall, cwd: &Path) -> ToolOutput {
        match call {
            ToolCall::ReadFile {
                path,
                line_start,
                line_end,
            } => self.read_file(path, *line_start, *line_end, cwd),
            ToolCall::WriteFile { path, content } => self.write_file(path, content, cwd),
            ToolCall::EditFile { path, edits } => self.edit_file(path, edits, cwd),
            ToolCall::GlobFiles { pattern } => self.glob_files(pattern),
            ToolCall::GrepFiles {
                pattern,
                path_scope,
            } => self.grep_files(pattern, path_scope.as_deref(), cwd),
            ToolCall::Bash {
                command,
                timeout_sec,
            } => self.bash(command, *timeout_sec, cwd),
        }
    }
}

fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}
