//! Application configuration read from TOML.
//!
//! Lookup order for the file: `CODING_AGENT_CONFIG_PATH`, then
//! `<config_dir>/coding-agent/config.toml`. A missing file yields defaults.
//! Environment overrides are applied after the file and before validation.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tool_policy::PolicyConfig;
use tracing_subscriber::EnvFilter;

use crate::providers::PROVIDER_IDS;

pub const CONFIG_PATH_ENV_VAR: &str = "CODING_AGENT_CONFIG_PATH";
pub const PROVIDER_ENV_VAR: &str = "CODING_AGENT_PROVIDER";
pub const MODEL_ENV_VAR: &str = "CODING_AGENT_MODEL";
pub const DATA_DIR_ENV_VAR: &str = "CODING_AGENT_DATA_DIR";
pub const SYSTEM_INSTRUCTIONS_ENV_VAR: &str = "CODING_AGENT_SYSTEM_INSTRUCTIONS";

const APP_DIR_NAME: &str = "coding-agent";
const CONFIG_FILE_NAME: &str = "config.toml";
/// Used when no user data directory can be determined.
pub const PROJECT_DATA_DIR: &str = ".agent";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSection {
    pub id: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_sec: Option<u64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub streaming: bool,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            id: "mock".to_string(),
            model: None,
            base_url: None,
            timeout_sec: None,
            max_tokens: None,
            temperature: None,
            streaming: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Provider round trips allowed per user turn.
    pub max_iterations: usize,
    pub provider_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Number of most recent user turns sent to the provider. `None` sends all.
    pub history_window: Option<usize>,
    pub system_instructions: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            provider_max_attempts: 3,
            retry_base_delay_ms: 500,
            history_window: None,
            system_instructions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsSection {
    pub bash_default_timeout_sec: u64,
    pub bash_max_timeout_sec: u64,
    pub bash_max_output_bytes: usize,
    pub read_max_bytes: usize,
    /// Cap on glob and grep result lines.
    pub max_results: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            bash_default_timeout_sec: 30,
            bash_max_timeout_sec: 600,
            bash_max_output_bytes: 100 * 1024,
            read_max_bytes: 200 * 1024,
            max_results: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub data_dir: Option<PathBuf>,
    /// Sessions idle longer than this are pruned at startup.
    pub retention_days: Option<u32>,
    /// Per-session cap; the oldest checkpoints are dropped past it.
    pub max_checkpoints: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub provider: ProviderSection,
    pub agent: AgentSection,
    pub policy: PolicyConfig,
    pub tools: ToolsSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !PROVIDER_IDS.contains(&self.provider.id.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown provider '{}'; expected one of: {}",
                self.provider.id,
                PROVIDER_IDS.join(", ")
            )));
        }
        if self.provider.timeout_sec == Some(0) {
            return Err(invalid("provider.timeout_sec must be > 0"));
        }
        if self.agent.max_iterations == 0 {
            return Err(invalid("agent.max_iterations must be > 0"));
        }
        if self.agent.provider_max_attempts == 0 {
            return Err(invalid("agent.provider_max_attempts must be > 0"));
        }
        if self.agent.history_window == Some(0) {
            return Err(invalid("agent.history_window must be > 0 when set"));
        }
        if self.tools.bash_default_timeout_sec == 0 || self.tools.bash_max_timeout_sec == 0 {
            return Err(invalid("tool timeouts must be > 0"));
        }
        if self.tools.bash_default_timeout_sec > self.tools.bash_max_timeout_sec {
            return Err(invalid(
                "tools.bash_default_timeout_sec must not exceed tools.bash_max_timeout_sec",
            ));
        }
        if self.tools.bash_max_output_bytes == 0
            || self.tools.read_max_bytes == 0
            || self.tools.max_results == 0
        {
            return Err(invalid("tool output limits must be > 0"));
        }
        if self.storage.max_checkpoints == Some(0) {
            return Err(invalid("storage.max_checkpoints must be > 0 when set"));
        }
        for pattern in self
            .policy
            .deny_patterns
            .iter()
            .chain(&self.policy.caution_patterns)
        {
            Regex::new(pattern).map_err(|error| {
                ConfigError::Invalid(format!("invalid policy pattern '{pattern}': {error}"))
            })?;
        }
        EnvFilter::try_new(&self.logging.level).map_err(|error| {
            ConfigError::Invalid(format!(
                "invalid logging.level '{}': {error}",
                self.logging.level
            ))
        })?;
        Ok(())
    }

    /// Applies `CODING_AGENT_*` overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(provider) = non_empty(PROVIDER_ENV_VAR) {
            self.provider.id = provider;
        }
        if let Some(model) = non_empty(MODEL_ENV_VAR) {
            self.provider.model = Some(model);
        }
        if let Some(data_dir) = non_empty(DATA_DIR_ENV_VAR) {
            self.storage.data_dir = Some(PathBuf::from(data_dir));
        }
        if let Some(instructions) = non_empty(SYSTEM_INSTRUCTIONS_ENV_VAR) {
            self.agent.system_instructions = Some(instructions);
        }
    }

    /// Root of sessions, checkpoints and audit logs.
    #[must_use]
    pub fn data_dir(&self, project_root: &Path) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            return if dir.is_absolute() {
                dir.clone()
            } else {
                project_root.join(dir)
            };
        }
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .unwrap_or_else(|| project_root.join(PROJECT_DATA_DIR))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Config file location, or `None` when no config directory is known.
#[must_use]
pub fn config_path(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = lookup(CONFIG_PATH_ENV_VAR).filter(|value| !value.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Reads and parses `path`; a missing file yields defaults. Does not validate.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use pretty_assertions::assert_eq;
    use tool_policy::BashCheckpointMode;

    use super::{config_path, load_config, AppConfig, ConfigError, PROVIDER_ENV_VAR};

    #[test]
    fn missing_file_yields_valid_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(config, AppConfig::default());
        config.validate().expect("defaults validate");
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.provider.id, "mock");
    }

    #[test]
    fn sections_parse_and_unset_fields_keep_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[provider]
id = "anthropic"
model = "claude-test"

[agent]
max_iterations = 4

[policy]
strict = true
bash_checkpoint = "always"

[storage]
retention_days = 30
"#,
        )
        .expect("write config");

        let config = load_config(&path).expect("load");
        config.validate().expect("valid");
        assert_eq!(config.provider.id, "anthropic");
        assert_eq!(config.provider.model.as_deref(), Some("claude-test"));
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.agent.provider_max_attempts, 3);
        assert!(config.policy.strict);
        assert_eq!(config.policy.bash_checkpoint, BashCheckpointMode::Always);
        assert!(!config.policy.deny_patterns.is_empty());
        assert_eq!(config.storage.retention_days, Some(30));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[agent]\nmax_iteration = 3\n").expect("write config");

        assert!(matches!(load_config(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.provider.id = "custom".to_string();
        let error = config.validate().expect_err("unknown provider");
        assert!(error.to_string().contains("unknown provider 'custom'"));

        let mut config = AppConfig::default();
        config.policy.deny_patterns.push("([".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tools.bash_default_timeout_sec = 900;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env = HashMap::from([
            (PROVIDER_ENV_VAR, "ollama"),
            ("CODING_AGENT_MODEL", "llama3.2"),
            ("CODING_AGENT_DATA_DIR", "/tmp/agent-data"),
            ("CODING_AGENT_SYSTEM_INSTRUCTIONS", "   "),
        ]);
        let mut config = AppConfig::default();
        config.apply_env_overrides(|name| env.get(name).map(|value| value.to_string()));

        assert_eq!(config.provider.id, "ollama");
        assert_eq!(config.provider.model.as_deref(), Some("llama3.2"));
        assert_eq!(
            config.data_dir(Path::new("/work")),
            PathBuf::from("/tmp/agent-data")
        );
        assert_eq!(config.agent.system_instructions, None);
    }

    #[test]
    fn relative_data_dir_is_anchored_at_project_root() {
        let mut config = AppConfig::default();
        config.storage.data_dir = Some(PathBuf::from(".agent"));
        assert_eq!(
            config.data_dir(Path::new("/work")),
            PathBuf::from("/work/.agent")
        );
    }

    #[test]
    fn config_path_prefers_env_var() {
        let path = config_path(|name| {
            (name == "CODING_AGENT_CONFIG_PATH").then(|| "/etc/agent.toml".to_string())
        });
        assert_eq!(path, Some(PathBuf::from("/etc/agent.toml")));
    }

    #[test]
    fn rendered_toml_parses_back() {
        let mut config = AppConfig::default();
        config.agent.history_window = Some(5);
        let rendered = config.to_toml().expect("render");
        let parsed: AppConfig = toml::from_str(&rendered).expect("parse rendered");
        assert_eq!(parsed, config);
    }
}
