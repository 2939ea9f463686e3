//! `llm_api`-backed implementation of the shared `agent_provider` contract.
//!
//! The adapter converts provider-neutral history into the dialect-neutral
//! [`ChatTurn`], drives the async transport on a private current-thread
//! runtime, and maps transport failures onto [`ProviderErrorKind`] classes the
//! agent loop retries or surfaces.

use std::sync::Arc;
use std::time::Duration;

use agent_provider::{
    CancelSignal, ChatProvider, ProviderError, ProviderErrorKind, ProviderInitError,
    ProviderProfile, RunMessage, ToolCallRequest, TurnRequest, TurnResponse,
};
use llm_api::{
    Backend, ChatTurn, Completion, LlmApiClient, LlmApiConfig, LlmApiError, WireMessage,
    WireTool, WireToolCall,
};
use serde_json::Value;
use tracing::debug;

/// Runtime configuration for one hosted or local model endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmApiProviderConfig {
    pub backend: Backend,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub streaming: bool,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl LlmApiProviderConfig {
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            model: None,
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            streaming: true,
            timeout: None,
            max_retries: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn into_llm_api_config(self) -> LlmApiConfig {
        let mut config = LlmApiConfig::new(self.backend).with_streaming(self.streaming);

        config = match self.api_key.filter(|key| !key.trim().is_empty()) {
            Some(key) => config.with_api_key(key),
            None => config.with_api_key_from_env(),
        };
        if let Some(model) = self.model.filter(|model| !model.trim().is_empty()) {
            config = config.with_model(model.trim());
        }
        if let Some(base_url) = self.base_url {
            config = config.with_base_url(base_url);
        }
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }
        if let Some(max_retries) = self.max_retries {
            let base_delay = config.retry_base_delay;
            config = config.with_retry_policy(max_retries, base_delay);
        }

        config
    }
}

trait CompletionClient: Send + Sync {
    fn complete(
        &self,
        turn: &ChatTurn,
        cancel: &CancelSignal,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<Completion, LlmApiError>;
}

#[derive(Debug)]
struct DefaultCompletionClient {
    client: LlmApiClient,
}

impl CompletionClient for DefaultCompletionClient {
    fn complete(
        &self,
        turn: &ChatTurn,
        cancel: &CancelSignal,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<Completion, LlmApiError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                LlmApiError::malformed(format!("failed to initialize tokio runtime: {error}"))
            })?;

        runtime.block_on(self.client.complete(turn, Some(cancel), on_delta))
    }
}

/// `ChatProvider` adapter backed by `llm_api` transport primitives.
pub struct LlmApiProvider {
    backend: Backend,
    model_id: String,
    streaming: bool,
    client: Arc<dyn CompletionClient>,
}

impl LlmApiProvider {
    /// Creates a provider using real HTTP transport.
    ///
    /// Fails when the backend needs an API key and none was configured or
    /// found in the environment.
    pub fn new(config: LlmApiProviderConfig) -> Result<Self, ProviderInitError> {
        let config = config.into_llm_api_config();
        if config.backend.requires_api_key() && config.api_key.is_none() {
            return Err(map_init_error(LlmApiError::MissingApiKey(config.backend)));
        }

        let backend = config.backend;
        let model_id = config.model.clone();
        let streaming = config.streaming;
        let client = LlmApiClient::new(config).map_err(map_init_error)?;

        Ok(Self {
            backend,
            model_id,
            streaming,
            client: Arc::new(DefaultCompletionClient { client }),
        })
    }

    /// Creates a provider for `backend`, reading the key from its environment variables.
    pub fn from_env(backend: Backend, model: Option<String>) -> Result<Self, ProviderInitError> {
        let mut config = LlmApiProviderConfig::new(backend);
        config.model = model;
        Self::new(config)
    }

    #[cfg(test)]
    fn with_client_for_tests(backend: Backend, client: Arc<dyn CompletionClient>) -> Self {
        Self {
            backend,
            model_id: backend.default_model().to_string(),
            streaming: true,
            client,
        }
    }
}

impl ChatProvider for LlmApiProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: self.backend.id().to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn send_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<TurnResponse, ProviderError> {
        if agent_provider::is_cancelled(cancel) {
            return Err(ProviderError::cancelled());
        }

        let turn = chat_turn(request);
        debug!(
            provider = self.backend.id(),
            model = %self.model_id,
            messages = turn.messages.len(),
            "provider turn"
        );

        let completion = self
            .client
            .complete(&turn, cancel, on_chunk)
            .map_err(map_provider_error)?;

        Ok(turn_response(completion))
    }
}

/// Builds the wire turn, folding each run of tool calls into the preceding
/// assistant message.
fn chat_turn(request: &TurnRequest) -> ChatTurn {
    let mut messages: Vec<WireMessage> = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        match message {
            RunMessage::UserText { text } => messages.push(WireMessage::User { text: text.clone() }),
            RunMessage::AssistantText { text } => messages.push(WireMessage::Assistant {
                text: Some(text.clone()),
                tool_calls: Vec::new(),
            }),
            RunMessage::ToolCall {
                call_id,
                tool_name,
                arguments,
            } => {
                let call = WireToolCall {
                    id: call_id.clone(),
                    name: tool_name.clone(),
                    arguments: arguments.clone(),
                };
                match messages.last_mut() {
                    Some(WireMessage::Assistant { tool_calls, .. }) => tool_calls.push(call),
                    _ => messages.push(WireMessage::Assistant {
                        text: None,
                        tool_calls: vec![call],
                    }),
                }
            }
            RunMessage::ToolResult {
                call_id,
                tool_name,
                content,
                is_error,
            } => messages.push(WireMessage::ToolResult {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                content: render_tool_content(content),
                is_error: *is_error,
            }),
        }
    }

    ChatTurn {
        system: request.instructions.clone(),
        messages,
        tools: request
            .tools
            .iter()
            .map(|tool| WireTool {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters: tool.input_schema.clone(),
            })
            .collect(),
    }
}

fn render_tool_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn turn_response(completion: Completion) -> TurnResponse {
    if completion.tool_calls.is_empty() {
        return TurnResponse::FinalAnswer {
            text: completion.text,
        };
    }

    let preamble = Some(completion.text).filter(|text| !text.trim().is_empty());
    TurnResponse::ToolCalls {
        preamble,
        calls: completion
            .tool_calls
            .into_iter()
            .map(|call| ToolCallRequest {
                call_id: call.id,
                tool_name: call.name,
                arguments: call.arguments,
            })
            .collect(),
    }
}

fn map_provider_error(error: LlmApiError) -> ProviderError {
    let kind = match &error {
        LlmApiError::Cancelled => return ProviderError::cancelled(),
        LlmApiError::MissingApiKey(_) => ProviderErrorKind::Auth,
        LlmApiError::InvalidBaseUrl(_) | LlmApiError::InvalidHeader(_) => {
            ProviderErrorKind::InvalidRequest
        }
        LlmApiError::Status(status, _) => match status.as_u16() {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimited,
            code if code >= 500 => ProviderErrorKind::Unavailable,
            _ => ProviderErrorKind::InvalidRequest,
        },
        LlmApiError::RateLimited { .. } => ProviderErrorKind::RateLimited,
        LlmApiError::RetryExhausted { .. } | LlmApiError::StreamFailed { .. } => {
            ProviderErrorKind::Unavailable
        }
        LlmApiError::Request(inner) if inner.is_timeout() => ProviderErrorKind::Timeout,
        LlmApiError::Request(_) => ProviderErrorKind::Transport,
        LlmApiError::MalformedSse(_)
        | LlmApiError::MalformedResponse(_)
        | LlmApiError::Serde(_) => ProviderErrorKind::InvalidResponse,
    };

    ProviderError::new(kind, error.to_string())
}

fn map_init_error(error: LlmApiError) -> ProviderInitError {
    ProviderInitError::new(format!("failed to initialize provider: {error}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use agent_provider::ToolDefinition;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    struct FakeClient {
        observed: Mutex<Option<ChatTurn>>,
        outcome: Mutex<Option<Result<Completion, LlmApiError>>>,
        deltas: Vec<&'static str>,
    }

    impl FakeClient {
        fn answering(outcome: Result<Completion, LlmApiError>) -> Arc<Self> {
            Arc::new(Self {
                observed: Mutex::new(None),
                outcome: Mutex::new(Some(outcome)),
                deltas: Vec::new(),
            })
        }

        fn observed(&self) -> Option<ChatTurn> {
            self.observed.lock().expect("observed lock").clone()
        }
    }

    impl CompletionClient for FakeClient {
        fn complete(
            &self,
            turn: &ChatTurn,
            _cancel: &CancelSignal,
            on_delta: &mut dyn FnMut(&str),
        ) -> Result<Completion, LlmApiError> {
            *self.observed.lock().expect("observed lock") = Some(turn.clone());
            for delta in &self.deltas {
                on_delta(delta);
            }
            self.outcome
                .lock()
                .expect("outcome lock")
                .take()
                .expect("fake outcome should be consumed exactly once")
        }
    }

    fn cancel() -> CancelSignal {
        Arc::new(AtomicBool::new(false))
    }

    fn request(messages: Vec<RunMessage>) -> TurnRequest {
        TurnRequest {
            instructions: "be careful".to_string(),
            messages,
            tools: vec![ToolDefinition {
                name: "read_file".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    #[test]
    fn history_groups_tool_calls_under_the_preceding_assistant_text() {
        let turn = chat_turn(&request(vec![
            RunMessage::UserText {
                text: "fix it".to_string(),
            },
            RunMessage::AssistantText {
                text: "Reading first.".to_string(),
            },
            RunMessage::ToolCall {
                call_id: "c1".to_string(),
                tool_name: "read_file".to_string(),
                arguments: json!({"path": "a"}),
            },
            RunMessage::ToolCall {
                call_id: "c2".to_string(),
                tool_name: "read_file".to_string(),
                arguments: json!({"path": "b"}),
            },
            RunMessage::ToolResult {
                call_id: "c1".to_string(),
                tool_name: "read_file".to_string(),
                content: json!({"output": "A"}),
                is_error: false,
            },
            RunMessage::ToolResult {
                call_id: "c2".to_string(),
                tool_name: "read_file".to_string(),
                content: json!("not found"),
                is_error: true,
            },
        ]));

        assert_eq!(turn.system, "be careful");
        assert_eq!(turn.messages.len(), 4);
        assert!(matches!(
            &turn.messages[1],
            WireMessage::Assistant { text: Some(text), tool_calls } if text == "Reading first." && tool_calls.len() == 2
        ));
        assert_eq!(
            turn.messages[2],
            WireMessage::ToolResult {
                call_id: "c1".to_string(),
                tool_name: "read_file".to_string(),
                content: r#"{"output":"A"}"#.to_string(),
                is_error: false,
            }
        );
        assert!(matches!(
            &turn.messages[3],
            WireMessage::ToolResult { content, is_error: true, .. } if content == "not found"
        ));
        assert_eq!(turn.tools[0].description, "");
    }

    #[test]
    fn tool_calls_without_preceding_text_start_a_new_assistant_message() {
        let turn = chat_turn(&request(vec![
            RunMessage::UserText {
                text: "go".to_string(),
            },
            RunMessage::ToolCall {
                call_id: "c1".to_string(),
                tool_name: "bash".to_string(),
                arguments: json!({"command": "ls"}),
            },
        ]));

        assert!(matches!(
            &turn.messages[1],
            WireMessage::Assistant { text: None, tool_calls } if tool_calls[0].id == "c1"
        ));
    }

    #[test]
    fn completion_with_calls_becomes_tool_calls_with_preamble() {
        let client = FakeClient::answering(Ok(Completion {
            text: "Let me look.".to_string(),
            tool_calls: vec![WireToolCall {
                id: "call_9".to_string(),
                name: "read_file".to_string(),
                arguments: json!({"path": "src/lib.rs"}),
            }],
            stop_reason: Some("tool_calls".to_string()),
        }));
        let provider = LlmApiProvider::with_client_for_tests(
            Backend::OpenAi,
            Arc::clone(&client) as Arc<dyn CompletionClient>,
        );

        let response = provider
            .send_turn(
                &request(vec![RunMessage::UserText {
                    text: "hi".to_string(),
                }]),
                &cancel(),
                &mut |_| {},
            )
            .expect("turn");

        assert_eq!(
            response,
            TurnResponse::ToolCalls {
                preamble: Some("Let me look.".to_string()),
                calls: vec![ToolCallRequest {
                    call_id: "call_9".to_string(),
                    tool_name: "read_file".to_string(),
                    arguments: json!({"path": "src/lib.rs"}),
                }],
            }
        );
        assert_eq!(client.observed().map(|turn| turn.messages.len()), Some(1));
    }

    #[test]
    fn text_only_completion_is_final_answer_and_deltas_are_forwarded() {
        let client = Arc::new(FakeClient {
            observed: Mutex::new(None),
            outcome: Mutex::new(Some(Ok(Completion {
                text: "All done".to_string(),
                ..Completion::default()
            }))),
            deltas: vec!["All", " done"],
        });
        let provider = LlmApiProvider::with_client_for_tests(Backend::Anthropic, client);
        let mut chunks = Vec::new();

        let response = provider
            .send_turn(&request(Vec::new()), &cancel(), &mut |chunk| {
                chunks.push(chunk.to_string())
            })
            .expect("turn");

        assert_eq!(
            response,
            TurnResponse::FinalAnswer {
                text: "All done".to_string()
            }
        );
        assert_eq!(chunks, vec!["All", " done"]);
        assert_eq!(provider.profile().provider_id, "anthropic");
    }

    #[test]
    fn transport_errors_map_to_provider_error_kinds() {
        let cases = [
            (
                LlmApiError::Status(reqwest_status(401), "bad key".to_string()),
                ProviderErrorKind::Auth,
                false,
            ),
            (
                LlmApiError::Status(reqwest_status(404), "no model".to_string()),
                ProviderErrorKind::InvalidRequest,
                false,
            ),
            (
                LlmApiError::RateLimited {
                    message: "slow".to_string(),
                    retry_after: None,
                },
                ProviderErrorKind::RateLimited,
                true,
            ),
            (
                LlmApiError::RetryExhausted {
                    status: None,
                    last_error: None,
                },
                ProviderErrorKind::Unavailable,
                true,
            ),
            (
                LlmApiError::malformed("tool call 'bash' has invalid JSON arguments"),
                ProviderErrorKind::InvalidResponse,
                false,
            ),
            (
                LlmApiError::MissingApiKey(Backend::Gemini),
                ProviderErrorKind::Auth,
                false,
            ),
        ];

        for (error, kind, retryable) in cases {
            let mapped = map_provider_error(error);
            assert_eq!(mapped.kind, kind);
            assert_eq!(mapped.retryable, retryable);
        }

        assert_eq!(
            map_provider_error(LlmApiError::Cancelled).kind,
            ProviderErrorKind::Cancelled
        );
    }

    #[test]
    fn cancelled_signal_short_circuits_before_transport() {
        let client = FakeClient::answering(Ok(Completion::default()));
        let provider = LlmApiProvider::with_client_for_tests(
            Backend::Ollama,
            Arc::clone(&client) as Arc<dyn CompletionClient>,
        );
        let cancel = cancel();
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);

        let error = provider
            .send_turn(&request(Vec::new()), &cancel, &mut |_| {})
            .expect_err("cancelled");

        assert_eq!(error.kind, ProviderErrorKind::Cancelled);
        assert!(client.observed().is_none());
    }

    #[test]
    fn hosted_backend_without_key_fails_to_initialize() {
        let error = match LlmApiProvider::new(
            LlmApiProviderConfig::new(Backend::Anthropic).with_api_key("  "),
        ) {
            Ok(_) if std::env::var("ANTHROPIC_API_KEY").is_ok() => return,
            Ok(_) => panic!("blank key without environment must fail"),
            Err(error) => error,
        };
        assert!(error.message().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn ollama_initializes_without_a_key() {
        let provider = LlmApiProvider::new(
            LlmApiProviderConfig::new(Backend::Ollama).with_model("qwen2.5-coder"),
        )
        .expect("ollama needs no key");
        assert_eq!(provider.profile().model_id, "qwen2.5-coder");
        assert!(provider.supports_streaming());
    }

    fn reqwest_status(code: u16) -> llm_api::StatusCode {
        llm_api::StatusCode::from_u16(code).expect("valid status")
    }
}
