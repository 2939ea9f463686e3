//! Anthropic messages dialect.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ensure_object_arguments, parse_arguments, ChatTurn, Completion, WireMessage, WireToolCall,
};
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize)]
struct ToolSpec<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

pub(crate) fn request_body(
    config: &LlmApiConfig,
    turn: &ChatTurn,
    streaming: bool,
) -> Result<Value, LlmApiError> {
    let mut messages: Vec<Message> = Vec::new();

    for message in &turn.messages {
        let (role, blocks) = match message {
            WireMessage::User { text } => ("user", vec![ContentBlock::Text { text: text.clone() }]),
            WireMessage::Assistant { text, tool_calls } => {
                let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
                if let Some(text) = text.as_ref().filter(|text| !text.trim().is_empty()) {
                    blocks.push(ContentBlock::Text { text: text.clone() });
                }
                blocks.extend(tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }));
                ("assistant", blocks)
            }
            WireMessage::ToolResult {
                call_id,
                content,
                is_error,
                ..
            } => (
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                }],
            ),
        };

        // Roles must alternate, so consecutive same-role items share one message.
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(Message {
                role,
                content: blocks,
            }),
        }
    }

    let request = MessagesRequest {
        model: &config.model,
        max_tokens: config.max_tokens,
        system: turn.system.trim(),
        messages,
        tools: turn
            .tools
            .iter()
            .map(|tool| ToolSpec {
                name: &tool.name,
                description: &tool.description,
                input_schema: &tool.parameters,
            })
            .collect(),
        temperature: config.temperature,
        stream: streaming,
    };

    Ok(serde_json::to_value(request)?)
}

pub(crate) fn parse_response(body: &str) -> Result<Completion, LlmApiError> {
    let response = serde_json::from_str::<MessagesResponse>(body)?;
    let mut completion = Completion {
        stop_reason: response.stop_reason,
        ..Completion::default()
    };

    for block in response.content {
        match block {
            ContentBlock::Text { text } => completion.text.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => {
                completion.tool_calls.push(WireToolCall {
                    arguments: ensure_object_arguments(&name, input)?,
                    id,
                    name,
                });
            }
            ContentBlock::ToolResult { .. } | ContentBlock::Unsupported => {}
        }
    }

    Ok(completion)
}

#[derive(Debug)]
enum PartialBlock {
    Text,
    ToolUse {
        id: String,
        name: String,
        input_json: String,
    },
    Other,
}

/// Accumulates `content_block_*` events keyed by block index.
#[derive(Debug, Default)]
pub struct StreamState {
    text: String,
    blocks: BTreeMap<u64, PartialBlock>,
    stop_reason: Option<String>,
}

impl StreamState {
    pub(crate) fn apply(
        &mut self,
        frame: &Value,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        let event_type = frame.get("type").and_then(Value::as_str).unwrap_or("");
        let index = frame.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event_type {
            "content_block_start" => {
                let block = frame.get("content_block").unwrap_or(&Value::Null);
                let partial = match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                self.text.push_str(text);
                                on_delta(text);
                            }
                        }
                        PartialBlock::Text
                    }
                    Some("tool_use") => PartialBlock::ToolUse {
                        id: string_field(block, "id"),
                        name: string_field(block, "name"),
                        input_json: String::new(),
                    },
                    _ => PartialBlock::Other,
                };
                self.blocks.insert(index, partial);
            }
            "content_block_delta" => {
                let delta = frame.get("delta").unwrap_or(&Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            self.text.push_str(text);
                            on_delta(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(PartialBlock::ToolUse { input_json, .. }) =
                            self.blocks.get_mut(&index)
                        {
                            if let Some(partial) = delta.get("partial_json").and_then(Value::as_str)
                            {
                                input_json.push_str(partial);
                            }
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = frame
                    .get("delta")
                    .and_then(|delta| delta.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "error" => {
                let error = frame.get("error").unwrap_or(&Value::Null);
                return Err(LlmApiError::StreamFailed {
                    code: error
                        .get("type")
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("stream error")
                        .to_string(),
                });
            }
            _ => {}
        }

        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Completion, LlmApiError> {
        let mut tool_calls = Vec::new();
        for block in self.blocks.into_values() {
            if let PartialBlock::ToolUse {
                id,
                name,
                input_json,
            } = block
            {
                tool_calls.push(WireToolCall {
                    arguments: parse_arguments(&name, &input_json)?,
                    id,
                    name,
                });
            }
        }

        Ok(Completion {
            text: self.text,
            tool_calls,
            stop_reason: self.stop_reason,
        })
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
