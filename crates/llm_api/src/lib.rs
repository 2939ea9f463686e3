//! Transport-only client for chat-completion style LLM endpoints.
//!
//! One client type speaks four wire dialects, selected by [`Backend`]:
//! OpenAI chat completions, Anthropic messages, Gemini `generateContent` and
//! Ollama `/api/chat`. Every dialect is normalized into a [`wire::Completion`]
//! holding assistant text plus host-mediated tool calls. Malformed tool-call
//! arguments are surfaced as errors rather than dropped.
//!
//! The crate owns request building, auth headers, retry/backoff, and SSE or
//! NDJSON stream decoding. It knows nothing about tools, sessions or the agent
//! loop.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod headers;
pub mod ndjson;
pub mod retry;
pub mod sse;
pub mod url;
pub mod wire;

pub use backend::Backend;
pub use client::{CancellationSignal, LlmApiClient};
pub use config::LlmApiConfig;
pub use error::LlmApiError;
pub use sse::{SseFrame, SseStreamParser};
pub use reqwest::StatusCode;
pub use wire::{ChatTurn, Completion, WireMessage, WireTool, WireToolCall};
