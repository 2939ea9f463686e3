use std::fmt;
use std::str::FromStr;

/// Wire dialect spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl Backend {
    pub const ALL: [Backend; 4] = [Self::Gemini, Self::OpenAi, Self::Anthropic, Self::Ollama];

    /// Stable identifier used in configuration and on the command line.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::Ollama => "http://localhost:11434",
        }
    }

    #[must_use]
    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-sonnet-latest",
            Self::Gemini => "gemini-2.0-flash",
            Self::Ollama => "llama3.1",
        }
    }

    /// Environment variables consulted for the API key, in priority order.
    #[must_use]
    pub fn api_key_env_vars(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["OPENAI_API_KEY"],
            Self::Anthropic => &["ANTHROPIC_API_KEY"],
            Self::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
            Self::Ollama => &[],
        }
    }

    #[must_use]
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }

    /// Ollama streams newline-delimited JSON; the others use SSE.
    #[must_use]
    pub fn streams_ndjson(self) -> bool {
        matches!(self, Self::Ollama)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Backend;

    #[test]
    fn ids_round_trip_through_from_str() {
        for backend in Backend::ALL {
            assert_eq!(backend.id().parse::<Backend>(), Ok(backend));
        }
        assert_eq!("Claude".parse::<Backend>(), Ok(Backend::Anthropic));
        assert!("bard".parse::<Backend>().is_err());
    }

    #[test]
    fn only_ollama_runs_without_a_key() {
        assert!(!Backend::Ollama.requires_api_key());
        assert!(Backend::Gemini.requires_api_key());
        assert_eq!(
            Backend::Gemini.api_key_env_vars(),
            &["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        );
    }
}
