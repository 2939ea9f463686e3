//! Dialect-neutral turn input and completion output, plus one module per
//! backend translating to and from its JSON wire format.

use serde_json::{Map, Value};

use crate::backend::Backend;
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

/// One conversation item as sent over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    User {
        text: String,
    },
    Assistant {
        text: Option<String>,
        tool_calls: Vec<WireToolCall>,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

/// Tool advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool invocation requested by the model, arguments already parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct WireToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Everything needed to build one request body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatTurn {
    pub system: String,
    pub messages: Vec<WireMessage>,
    pub tools: Vec<WireTool>,
}

/// Normalized model answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<WireToolCall>,
    pub stop_reason: Option<String>,
}

/// Builds the JSON request body for `config.backend`.
pub fn request_body(
    config: &LlmApiConfig,
    turn: &ChatTurn,
    streaming: bool,
) -> Result<Value, LlmApiError> {
    match config.backend {
        Backend::OpenAi => openai::request_body(config, turn, streaming),
        Backend::Anthropic => anthropic::request_body(config, turn, streaming),
        Backend::Gemini => gemini::request_body(config, turn),
        Backend::Ollama => ollama::request_body(config, turn, streaming),
    }
}

/// Parses a complete (non-streaming) response body.
pub fn parse_response(backend: Backend, body: &str) -> Result<Completion, LlmApiError> {
    match backend {
        Backend::OpenAi => openai::parse_response(body),
        Backend::Anthropic => anthropic::parse_response(body),
        Backend::Gemini => gemini::parse_response(body),
        Backend::Ollama => ollama::parse_response(body),
    }
}

/// Per-backend accumulator for streamed frames.
#[derive(Debug)]
pub enum StreamDecoder {
    OpenAi(openai::StreamState),
    Anthropic(anthropic::StreamState),
    Gemini(gemini::StreamState),
    Ollama(ollama::StreamState),
}

impl StreamDecoder {
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        match backend {
            Backend::OpenAi => Self::OpenAi(openai::StreamState::default()),
            Backend::Anthropic => Self::Anthropic(anthropic::StreamState::default()),
            Backend::Gemini => Self::Gemini(gemini::StreamState::default()),
            Backend::Ollama => Self::Ollama(ollama::StreamState::default()),
        }
    }

    /// Applies one decoded frame. Text deltas go to `on_delta`.
    pub fn apply(
        &mut self,
        frame: &Value,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        match self {
            Self::OpenAi(state) => state.apply(frame, on_delta),
            Self::Anthropic(state) => state.apply(frame, on_delta),
            Self::Gemini(state) => state.apply(frame, on_delta),
            Self::Ollama(state) => state.apply(frame, on_delta),
        }
    }

    pub fn finish(self) -> Result<Completion, LlmApiError> {
        match self {
            Self::OpenAi(state) => state.finish(),
            Self::Anthropic(state) => state.finish(),
            Self::Gemini(state) => state.finish(),
            Self::Ollama(state) => state.finish(),
        }
    }
}

/// Parses a JSON-encoded argument string. Blank input means no arguments.
pub(crate) fn parse_arguments(tool_name: &str, raw: &str) -> Result<Value, LlmApiError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    let value = serde_json::from_str::<Value>(raw).map_err(|error| {
        LlmApiError::malformed(format!(
            "tool call '{tool_name}' has invalid JSON arguments: {error}"
        ))
    })?;
    ensure_object_arguments(tool_name, value)
}

pub(crate) fn ensure_object_arguments(tool_name: &str, value: Value) -> Result<Value, LlmApiError> {
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(LlmApiError::malformed(format!(
            "tool call '{tool_name}' arguments must be a JSON object, got {other}"
        ))),
    }
}

/// Deterministic id for backends that do not assign call ids.
pub(crate) fn synthesized_call_id(index: usize) -> String {
    format!("call_{index}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_arguments;
    use crate::error::LlmApiError;

    #[test]
    fn argument_parsing_accepts_objects_and_blank_input() {
        assert_eq!(
            parse_arguments("read_file", r#"{"path":"a.rs"}"#).expect("object"),
            json!({"path": "a.rs"})
        );
        assert_eq!(parse_arguments("glob_files", "  ").expect("blank"), json!({}));
    }

    #[test]
    fn argument_parsing_rejects_malformed_json_and_non_objects() {
        let error = parse_arguments("bash", r#"{"command": "ls"#).expect_err("truncated");
        assert!(matches!(error, LlmApiError::MalformedResponse(message) if message.contains("bash")));

        assert!(parse_arguments("bash", "[1,2]").is_err());
    }
}
