use std::collections::BTreeMap;

use crate::backend::Backend;
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_ANTHROPIC_KEY: &str = "x-api-key";
pub const HEADER_ANTHROPIC_VERSION: &str = "anthropic-version";
pub const HEADER_GOOGLE_KEY: &str = "x-goog-api-key";
pub const HEADER_USER_AGENT: &str = "user-agent";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build a deterministic header map for one backend request.
pub fn build_headers(
    config: &LlmApiConfig,
    streaming: bool,
) -> Result<BTreeMap<String, String>, LlmApiError> {
    let mut headers = BTreeMap::new();

    let api_key = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty());
    if config.backend.requires_api_key() && api_key.is_none() {
        return Err(LlmApiError::MissingApiKey(config.backend));
    }

    match (config.backend, api_key) {
        (Backend::OpenAi, Some(key)) => {
            headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {key}"));
        }
        (Backend::Anthropic, Some(key)) => {
            headers.insert(HEADER_ANTHROPIC_KEY.to_owned(), key.to_owned());
            headers.insert(
                HEADER_ANTHROPIC_VERSION.to_owned(),
                ANTHROPIC_VERSION.to_owned(),
            );
        }
        (Backend::Gemini, Some(key)) => {
            headers.insert(HEADER_GOOGLE_KEY.to_owned(), key.to_owned());
        }
        (Backend::Ollama, Some(key)) => {
            headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {key}"));
        }
        (_, None) => {}
    }

    let accept = if streaming && !config.backend.streams_ndjson() {
        "text/event-stream"
    } else {
        "application/json"
    };
    headers.insert(HEADER_ACCEPT.to_owned(), accept.to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );
    headers.insert(
        HEADER_USER_AGENT.to_owned(),
        concat!("coding-agent/", env!("CARGO_PKG_VERSION")).to_owned(),
    );

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    Ok(headers)
}
