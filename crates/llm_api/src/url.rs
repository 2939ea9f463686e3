use crate::backend::Backend;
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

/// Resolves the request URL for `config`, streaming or not.
pub fn endpoint(config: &LlmApiConfig, streaming: bool) -> Result<String, LlmApiError> {
    let base = normalize_base_url(&config.base_url)?;

    Ok(match config.backend {
        Backend::OpenAi => format!("{base}/chat/completions"),
        Backend::Anthropic => {
            if base.ends_with("/v1") {
                format!("{base}/messages")
            } else {
                format!("{base}/v1/messages")
            }
        }
        Backend::Gemini => {
            let model = config.model.trim().trim_start_matches("models/");
            let version = if base.ends_with("/v1beta") || base.ends_with("/v1") {
                String::new()
            } else {
                "/v1beta".to_string()
            };
            if streaming {
                format!("{base}{version}/models/{model}:streamGenerateContent?alt=sse")
            } else {
                format!("{base}{version}/models/{model}:generateContent")
            }
        }
        Backend::Ollama => format!("{}/api/chat", base.trim_end_matches("/api")),
    })
}

fn normalize_base_url(base_url: &str) -> Result<String, LlmApiError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(LlmApiError::InvalidBaseUrl(base_url.to_string()));
    }
    Ok(trimmed.to_string())
}
