use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Commands whose effects are irreversible at the system level.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    r"\brm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)\s+(?:-\S+\s+)*(?:/|/\*|~|~/|~/\*|\*|\.\*|\$HOME/?|\$\{HOME\}/?)(?:\s|;|&|\||$)",
    r"\brm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)\s+(?:-\S+\s+)*/(?:bin|boot|dev|etc|home|lib|lib64|opt|proc|root|sbin|srv|sys|usr|var)/?(?:\s|;|&|\||$)",
    r"\bmkfs(?:\.\w+)?\b",
    r"\bdd\b.*\bif=/dev/(?:zero|u?random)\b.*\bof=\S+",
    r":\(\)\s*\{.*:\s*\|\s*:.*\}",
    r"\bfork\s*bomb\b",
    r">\s*/dev/(?:sd[a-z]|hd[a-z]|nvme\d|disk\d)",
    r"\bchmod\s+(?:-\S+\s+)*0?777\s+/(?:\s|\*|$)",
    r"\bchown\s+(?:-\S+\s+)*-[a-z]*r[a-z]*\s+(?:-\S+\s+)*\S+\s+/(?:\s|\*|$)",
    r"\b(?:shutdown|reboot|halt|poweroff)\b",
    r"\binit\s+[06]\b",
];

/// Commands that are allowed but reported to the user.
pub const DEFAULT_CAUTION_PATTERNS: &[&str] = &[
    r"\brm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)\b",
    r"\bsudo\b",
    r"\b(?:curl|wget)\b.*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b",
    r"\beval\s",
    r"\bgit\s+push\b.*(?:--force\b|\s-f\b)",
    r"\bgit\s+reset\b.*--hard\b",
    r"\bgit\s+clean\b.*\s-[a-z]*f",
    r"\bchmod\b",
    r"\bchown\b",
    r"\bkill\s+-(?:9|kill)\b",
    r"\b(?:pkill|killall)\b",
];

pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[".git", ".agent"];

/// When `bash` invocations are checkpointed before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BashCheckpointMode {
    /// Every command is treated as mutating.
    Always,
    /// Commands matching known mutation shapes are treated as mutating.
    #[default]
    Heuristic,
    /// Commands are never checkpointed.
    Never,
}

impl BashCheckpointMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Heuristic => "heuristic",
            Self::Never => "never",
        }
    }
}

/// Policy rules as read from configuration.
///
/// Pattern lists replace the defaults when present in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Root every path argument must stay inside. Defaults to the working directory.
    pub project_root: Option<PathBuf>,
    pub deny_patterns: Vec<String>,
    pub caution_patterns: Vec<String>,
    /// Paths, relative to the project root, that tools may read but never write.
    pub protected_paths: Vec<String>,
    /// Escalate caution matches to denials.
    pub strict: bool,
    pub allow_bash: bool,
    pub bash_checkpoint: BashCheckpointMode,
    /// Plan mode: every mutating tool is denied.
    #[serde(skip)]
    pub read_only: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            deny_patterns: to_strings(DEFAULT_DENY_PATTERNS),
            caution_patterns: to_strings(DEFAULT_CAUTION_PATTERNS),
            protected_paths: to_strings(DEFAULT_PROTECTED_PATHS),
            strict: false,
            allow_bash: true,
            bash_checkpoint: BashCheckpointMode::default(),
            read_only: false,
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
