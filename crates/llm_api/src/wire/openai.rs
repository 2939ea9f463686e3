//! OpenAI chat-completions dialect (also used by compatible gateways).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_arguments, ChatTurn, Completion, WireMessage, WireToolCall};
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<RequestToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl Message {
    fn text(role: &'static str, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: RequestFunction,
}

#[derive(Debug, Serialize)]
struct RequestFunction {
    name: String,
    arguments: String,
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

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

pub(crate) fn request_body(
    config: &LlmApiConfig,
    turn: &ChatTurn,
    streaming: bool,
) -> Result<Value, LlmApiError> {
    let mut messages = Vec::with_capacity(turn.messages.len() + 1);
    if !turn.system.trim().is_empty() {
        messages.push(Message::text("system", turn.system.clone()));
    }

    for message in &turn.messages {
        messages.push(match message {
            WireMessage::User { text } => Message::text("user", text.clone()),
            WireMessage::Assistant { text, tool_calls } => {
                let tool_calls = tool_calls
                    .iter()
                    .map(|call| RequestToolCall {
                        id: call.id.clone(),
                        kind: "function",
                        function: RequestFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect::<Vec<_>>();
                Message {
                    role: "assistant",
                    content: text.clone(),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                }
            }
            WireMessage::ToolResult {
                call_id, content, ..
            } => Message {
                role: "tool",
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
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
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        stream: streaming,
    };

    Ok(serde_json::to_value(request)?)
}

pub(crate) fn parse_response(body: &str) -> Result<Completion, LlmApiError> {
    let response = serde_json::from_str::<ChatResponse>(body)?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmApiError::malformed("response contained no choices"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            Ok(WireToolCall {
                arguments: parse_arguments(&call.function.name, &call.function.arguments)?,
                id: call.id,
                name: call.function.name,
            })
        })
        .collect::<Result<Vec<_>, LlmApiError>>()?;

    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        stop_reason: choice.finish_reason,
    })
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates `chat.completion.chunk` deltas; tool calls are keyed by index.
#[derive(Debug, Default)]
pub struct StreamState {
    text: String,
    calls: BTreeMap<u64, PartialCall>,
    stop_reason: Option<String>,
}

impl StreamState {
    pub(crate) fn apply(
        &mut self,
        frame: &Value,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        if let Some(error) = frame.get("error") {
            return Err(LlmApiError::StreamFailed {
                code: error
                    .get("code")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string(),
            });
        }

        let Some(choice) = frame
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return Ok(());
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.stop_reason = Some(reason.to_string());
        }

        let Some(delta) = choice.get("delta") else {
            return Ok(());
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                self.text.push_str(content);
                on_delta(content);
            }
        }

        for call in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let partial = self.calls.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                partial.id = id.to_string();
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(arguments);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Completion, LlmApiError> {
        let tool_calls = self
            .calls
            .into_iter()
            .map(|(index, partial)| {
                if partial.name.is_empty() {
                    return Err(LlmApiError::malformed(format!(
                        "streamed tool call #{index} has no function name"
                    )));
                }
                let id = if partial.id.is_empty() {
                    super::synthesized_call_id(index as usize)
                } else {
                    partial.id
                };
                Ok(WireToolCall {
                    arguments: parse_arguments(&partial.name, &partial.arguments)?,
                    id,
                    name: partial.name,
                })
            })
            .collect::<Result<Vec<_>, LlmApiError>>()?;

        Ok(Completion {
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
        })
    }
}
