//! Gemini `generateContent` dialect.
//!
//! Gemini does not assign ids to function calls, so ids are synthesized per
//! response and function responses are matched back by name.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    ensure_object_arguments, synthesized_call_id, ChatTurn, Completion, WireMessage, WireToolCall,
};
use crate::config::LlmApiConfig;
use crate::error::LlmApiError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing)]
    thought: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup<'a> {
    function_declarations: Vec<FunctionDeclaration<'a>>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: ResponseContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

pub(crate) fn request_body(config: &LlmApiConfig, turn: &ChatTurn) -> Result<Value, LlmApiError> {
    let mut contents: Vec<Content> = Vec::new();

    for message in &turn.messages {
        let (role, parts) = match message {
            WireMessage::User { text } => (
                "user",
                vec![Part {
                    text: Some(text.clone()),
                    ..Part::default()
                }],
            ),
            WireMessage::Assistant { text, tool_calls } => {
                let mut parts = Vec::with_capacity(tool_calls.len() + 1);
                if let Some(text) = text.as_ref().filter(|text| !text.trim().is_empty()) {
                    parts.push(Part {
                        text: Some(text.clone()),
                        ..Part::default()
                    });
                }
                parts.extend(tool_calls.iter().map(|call| Part {
                    function_call: Some(FunctionCall {
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                    }),
                    ..Part::default()
                }));
                ("model", parts)
            }
            WireMessage::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => {
                let response = if *is_error {
                    json!({ "error": content })
                } else {
                    json!({ "result": content })
                };
                (
                    "user",
                    vec![Part {
                        function_response: Some(FunctionResponse {
                            name: tool_name.clone(),
                            response,
                        }),
                        ..Part::default()
                    }],
                )
            }
        };

        match contents.last_mut() {
            Some(last) if last.role == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role),
                parts,
            }),
        }
    }

    let system_instruction = (!turn.system.trim().is_empty()).then(|| Content {
        role: None,
        parts: vec![Part {
            text: Some(turn.system.clone()),
            ..Part::default()
        }],
    });

    let tools = if turn.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolGroup {
            function_declarations: turn
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: &tool.name,
                    description: &tool.description,
                    parameters: &tool.parameters,
                })
                .collect(),
        }]
    };

    let request = GenerateContentRequest {
        system_instruction,
        contents,
        tools,
        generation_config: GenerationConfig {
            max_output_tokens: config.max_tokens,
            temperature: config.temperature,
        },
    };

    Ok(serde_json::to_value(request)?)
}

pub(crate) fn parse_response(body: &str) -> Result<Completion, LlmApiError> {
    let response = serde_json::from_str::<GenerateContentResponse>(body)?;
    let mut state = StreamState::default();
    state.absorb(response, &mut |_| {})?;
    state.finish()
}

/// Accumulates streamed `GenerateContentResponse` chunks.
#[derive(Debug, Default)]
pub struct StreamState {
    text: String,
    tool_calls: Vec<WireToolCall>,
    stop_reason: Option<String>,
    saw_candidate: bool,
    block_reason: Option<String>,
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
                    .get("status")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string(),
            });
        }
        let chunk = serde_json::from_value::<GenerateContentResponse>(frame.clone())?;
        self.absorb(chunk, on_delta)
    }

    fn absorb(
        &mut self,
        response: GenerateContentResponse,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<(), LlmApiError> {
        if let Some(reason) = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
        {
            self.block_reason = Some(reason);
        }

        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(());
        };
        self.saw_candidate = true;
        if candidate.finish_reason.is_some() {
            self.stop_reason = candidate.finish_reason;
        }

        for part in candidate.content.parts {
            if part.thought {
                continue;
            }
            if let Some(text) = part.text {
                if !text.is_empty() {
                    self.text.push_str(&text);
                    on_delta(&text);
                }
            }
            if let Some(call) = part.function_call {
                self.tool_calls.push(WireToolCall {
                    id: synthesized_call_id(self.tool_calls.len()),
                    arguments: ensure_object_arguments(&call.name, call.args)?,
                    name: call.name,
                });
            }
        }

        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Completion, LlmApiError> {
        if !self.saw_candidate {
            let reason = self
                .block_reason
                .map(|reason| format!("prompt blocked: {reason}"))
                .unwrap_or_else(|| "response contained no candidates".to_string());
            return Err(LlmApiError::malformed(reason));
        }

        Ok(Completion {
            text: self.text,
            tool_calls: self.tool_calls,
            stop_reason: self.stop_reason,
        })
    }
}
