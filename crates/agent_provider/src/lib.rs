//! Provider-agnostic contract for one model turn.
//!
//! A turn is a single request/response exchange: the host sends instructions,
//! message history and tool definitions; the provider answers with either a
//! final text or a list of tool calls. Tool execution, retries across turns and
//! persistence live with the caller. Transport details and wire payloads stay
//! in provider crates.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;
use thiserror::Error;

/// Shared cancellation flag for a turn.
pub type CancelSignal = Arc<AtomicBool>;

/// Returns true once cancellation has been requested.
#[must_use]
pub fn is_cancelled(cancel: &CancelSignal) -> bool {
    cancel.load(Ordering::SeqCst)
}

/// Failure to build a provider from configuration, before any turn starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Provider-neutral model-facing message history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMessage {
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: Value,
        is_error: bool,
    },
}

/// Generic host-mediated tool definition advertised to providers.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// One tool invocation requested by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl From<&ToolCallRequest> for RunMessage {
    fn from(call: &ToolCallRequest) -> Self {
        Self::ToolCall {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

/// Host tool call result fed back to providers.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub is_error: bool,
    pub content: Value,
}

impl ToolResult {
    /// Constructs a successful tool result.
    #[must_use]
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<Value>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            is_error: false,
            content: content.into(),
        }
    }

    /// Constructs a tool error result.
    #[must_use]
    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<Value>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            is_error: true,
            content: content.into(),
        }
    }
}

impl From<ToolResult> for RunMessage {
    fn from(result: ToolResult) -> Self {
        Self::ToolResult {
            call_id: result.call_id,
            tool_name: result.tool_name,
            content: result.content,
            is_error: result.is_error,
        }
    }
}

/// Input for one provider turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub instructions: String,
    pub messages: Vec<RunMessage>,
    pub tools: Vec<ToolDefinition>,
}

/// Provider answer for one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResponse {
    FinalAnswer {
        text: String,
    },
    /// Tool calls, optionally preceded by assistant text emitted in the same turn.
    ToolCalls {
        preamble: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

/// Coarse failure class for a provider turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transport,
    Timeout,
    RateLimited,
    Auth,
    InvalidRequest,
    InvalidResponse,
    Cancelled,
    Unavailable,
}

impl ProviderErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidResponse => "invalid_response",
            Self::Cancelled => "cancelled",
            Self::Unavailable => "unavailable",
        }
    }

    /// Default retry classification for errors of this kind.
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::Timeout | Self::RateLimited | Self::Unavailable
        )
    }
}

/// Error returned from a provider turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Creates an error whose retry flag follows the kind's default.
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable_by_default(),
        }
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ProviderErrorKind::Cancelled, "turn cancelled")
    }

    #[must_use]
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidResponse, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Immutable metadata describing a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Provider interface for one request/response turn.
pub trait ChatProvider: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Whether `send_turn` delivers text incrementally through `on_chunk`.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Sends one turn and returns the parsed answer.
    ///
    /// Streaming providers pass assistant text fragments to `on_chunk` as they
    /// arrive; the returned response still carries the full text. Providers
    /// should poll `cancel` while waiting and return a `Cancelled` error once
    /// it is set.
    fn send_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<TurnResponse, ProviderError>;
}
