use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Error as JsonError;

use crate::backend::Backend;

#[derive(Debug)]
pub enum LlmApiError {
    MissingApiKey(Backend),
    InvalidBaseUrl(String),
    InvalidHeader(String),
    Request(reqwest::Error),
    Status(StatusCode, String),
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    MalformedSse(String),
    MalformedResponse(String),
    Serde(JsonError),
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    Cancelled,
}

impl LlmApiError {
    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Status(status, _) => status.is_server_error(),
            Self::RateLimited { .. } | Self::RetryExhausted { .. } | Self::StreamFailed { .. } => {
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }
}

impl fmt::Display for LlmApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey(backend) => {
                let vars = backend.api_key_env_vars().join(" or ");
                write!(f, "{backend} API key is required (set {vars})")
            }
            Self::InvalidBaseUrl(value) => write!(f, "invalid base URL: {value}"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status(status, message) => write!(f, "HTTP {status} {message}"),
            Self::RateLimited {
                message,
                retry_after,
            } => match retry_after {
                Some(delay) => write!(
                    f,
                    "rate limited: {message} (retry after {}s)",
                    delay.as_secs()
                ),
                None => write!(f, "rate limited: {message}"),
            },
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error:?})"
                )
            }
            Self::MalformedSse(message) => write!(f, "malformed SSE event: {message}"),
            Self::MalformedResponse(message) => write!(f, "malformed response: {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::StreamFailed { code, message } => match code {
                Some(code) if !code.trim().is_empty() => {
                    write!(f, "stream failed ({code}): {message}")
                }
                _ => write!(f, "stream failed: {message}"),
            },
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for LlmApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(error) => Some(error),
            Self::Serde(error) => Some(error),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for LlmApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Error envelopes used by the supported backends.
///
/// OpenAI, Anthropic and Gemini nest an object under `error`; Ollama uses a
/// bare string.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<ErrorValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorValue {
    Text(String),
    Fields {
        message: Option<String>,
        #[serde(rename = "type")]
        type_: Option<String>,
        status: Option<String>,
    },
}

/// Extracts a human-readable message from an error response body.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    let Ok(payload) = serde_json::from_str::<ErrorPayload>(body) else {
        return fallback();
    };

    match payload.error {
        Some(ErrorValue::Text(message)) if !message.trim().is_empty() => message,
        Some(ErrorValue::Fields {
            message: Some(message),
            type_,
            status: code,
        }) if !message.trim().is_empty() => match type_.or(code) {
            Some(kind) if !kind.is_empty() => format!("{message} ({kind})"),
            _ => message,
        },
        _ => fallback(),
    }
}
