//! Ollama `/api/chat` dialect. Streams newline-delimited JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ensure_object_arguments, parse_arguments, synthesized_call_id, ChatTurn, Completion,
    WireMessage, WireToolCall,
};
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec<'a>>,
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<MessageToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageToolCall {
    function: MessageFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ToolSpec<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: FunctionSpec<'a>,
}

#[derive(Debug, Serialize)]
struct FunctionSpec<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
struct Options {
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<MessageToolCall>,
}

pub(crate) fn request_body(
    config: &LlmApiConfig,
    turn: &ChatTurn,
    streaming: bool,
) -> Result<Value, LlmApiError> {
    let mut messages = Vec::with_capacity(turn.messages.len() + 1);
    if !turn.system.trim().is_empty() {
        messages.push(Message {
            role: "system",
            content: turn.system.clone(),
            tool_calls: Vec::new(),
            tool_name: None,
        });
    }

    for message in &turn.messages {
        messages.push(match message {
            WireMessage::User { text } => Message {
                role: "user",
                content: text.clone(),
                tool_calls: Vec::new(),
                tool_name: None,
            },
            WireMessage::Assistant { text, tool_calls } => Message {
                role: "assistant",
                content: text.clone().unwrap_or_default(),
                tool_calls: tool_calls
                    .iter()
                    .map(|call| MessageToolCall {
                        function: MessageFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
                tool_name: None,
            },
            WireMessage::ToolResult {
                tool_name, content, ..
            } => Message {
                role: "tool",
                content: content.clone(),
                tool_calls: Vec::new(),
                tool_name: Some(tool_name.clone()),
            },
        });
    }

    let request = ChatRequest {
        model: &config.model,
        messages,
        tools: turn
            .tools
            .iter()
            .map(|tool| ToolSpec {
                kind: "function",
                function: FunctionSpec {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameters,
                },
            })
            .collect(),
        stream: streaming,
        options: Options {
            num_predict: config.max_tokens,
            temperature: config.temperature,
        },
    };

    Ok(serde_json::to_value(request)?)
}

pub(crate) fn parse_response(body: &str) -> Result<Completion, LlmApiError> {
    let chunk = serde_json::from_str::<ChatChunk>(body)?;
    let mut state = StreamState::default();
    state.absorb(chunk, &mut |_| {})?;
    state.finish()
}

/// Accumulates NDJSON chat chunks until `done`.
#[derive(Debug, Default)]
pub struct StreamState {
    text: String,
    tool_calls: Vec<WireToolCall>,
    stop_reason: Option<String>,
    done: bool,
}

impl StreamState {
    pub(crate) fn apply(
        &mut self,
        frame: &Value,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        let chunk = serde_json::from_value::<ChatChunk>(frame.clone())?;
        self.absorb(chunk, on_delta)
    }

    fn absorb(
        &mut self,
        chunk: ChatChunk,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        if let Some(error) = chunk.error {
            return Err(LlmApiError::StreamFailed {
                code: None,
                message: error,
            });
        }

        if let Some(message) = chunk.message {
            if !message.content.is_empty() {
                self.text.push_str(&message.content);
                on_delta(&message.content);
            }
            for call in message.tool_calls {
                let arguments = match call.function.arguments {
                    Value::String(raw) => parse_arguments(&call.function.name, &raw)?,
                    other => ensure_object_arguments(&call.function.name, other)?,
                };
                self.tool_calls.push(WireToolCall {
                    id: synthesized_call_id(self.tool_calls.len()),
                    name: call.function.name,
                    arguments,
                });
            }
        }

        if chunk.done {
            self.done = true;
            self.stop_reason = chunk.done_reason.or_else(|| Some("stop".to_string()));
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Completion, LlmApiError> {
        if !self.done {
            return Err(LlmApiError::malformed(
                "stream ended before the final done chunk",
            ));
        }
        Ok(Completion {
            text: self.text,
            tool_calls: self.tool_calls,
            stop_reason: self.stop_reason,
        })
    }
}
