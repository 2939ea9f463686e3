//! Deterministic mock implementation of the shared `agent_provider` contract.
//!
//! This crate contains no transport/protocol logic and is intended for local
//! development and agent-loop testing. Responses come from a FIFO script; once
//! the script is exhausted the provider echoes the latest user message.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_provider::{
    is_cancelled, CancelSignal, ChatProvider, ProviderError, ProviderProfile, RunMessage,
    ToolCallRequest, TurnRequest, TurnResponse,
};
use serde_json::Value;

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// One scripted provider reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedStep {
    Respond(TurnResponse),
    Fail(ProviderError),
}

/// Scripted provider used by `coding_agent` tests and local runs.
#[derive(Debug)]
pub struct MockProvider {
    model_id: String,
    script: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<TurnRequest>>,
    token_delay: Duration,
}

impl MockProvider {
    /// Creates a mock provider with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    /// Creates a mock provider that replays `steps` in order.
    #[must_use]
    pub fn scripted(steps: Vec<ScriptedStep>) -> Self {
        Self {
            model_id: "mock".to_string(),
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Sleeps between streamed word chunks.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn push_step(&self, step: ScriptedStep) {
        lock_unpoisoned(&self.script).push_back(step);
    }

    pub fn push_final(&self, text: impl Into<String>) {
        self.push_step(ScriptedStep::Respond(TurnResponse::FinalAnswer { text: text.into() }));
    }

    /// Queues one tool-call turn built from `(call_id, tool_name, arguments)` triples.
    pub fn push_tool_calls<I, S>(&self, calls: I)
    where
        I: IntoIterator<Item = (S, S, Value)>,
        S: Into<String>,
    {
        let calls = calls
            .into_iter()
            .map(|(call_id, tool_name, arguments)| ToolCallRequest {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                arguments,
            })
            .collect();
        self.push_step(ScriptedStep::Respond(TurnResponse::ToolCalls {
            preamble: None,
            calls,
        }));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push_step(ScriptedStep::Fail(error));
    }

    /// Every request received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<TurnRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    #[must_use]
    pub fn remaining_steps(&self) -> usize {
        lock_unpoisoned(&self.script).len()
    }

    fn echo_answer(request: &TurnRequest) -> String {
        let latest_user_text = request.messages.iter().rev().find_map(|message| match message {
            RunMessage::UserText { text } => Some(text.as_str()),
            _ => None,
        });

        match latest_user_text {
            Some(text) => format!("Mock response to: {text}"),
            None => "Mock response.".to_string(),
        }
    }

    fn stream_words(
        &self,
        text: &str,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<(), ProviderError> {
        let mut pending_token = String::new();
        for ch in text.chars() {
            pending_token.push(ch);
            if matches!(ch, ' ' | '\n') {
                if is_cancelled(cancel) {
                    return Err(ProviderError::cancelled());
                }
                on_chunk(&std::mem::take(&mut pending_token));
                if !self.token_delay.is_zero() {
                    thread::sleep(self.token_delay);
                }
            }
        }

        if !pending_token.is_empty() {
            on_chunk(&pending_token);
        }
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatProvider for MockProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn send_turn(
        &self,
        request: &TurnRequest,
        cancel: &CancelSignal,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<TurnResponse, ProviderError> {
        lock_unpoisoned(&self.requests).push(request.clone());

        if is_cancelled(cancel) {
            return Err(ProviderError::cancelled());
        }

        let step = lock_unpoisoned(&self.script).pop_front();
        let response = match step {
            Some(ScriptedStep::Fail(error)) => return Err(error),
            Some(ScriptedStep::Respond(response)) => response,
            None => TurnResponse::FinalAnswer {
                text: Self::echo_answer(request),
            },
        };

        match &response {
            TurnResponse::FinalAnswer { text } => self.stream_words(text, cancel, on_chunk)?,
            TurnResponse::ToolCalls {
                preamble: Some(text),
                ..
            } => self.stream_words(text, cancel, on_chunk)?,
            TurnResponse::ToolCalls { preamble: None, .. } => {}
        }

        Ok(response)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use agent_provider::{
        CancelSignal, ChatProvider, ProviderError, ProviderErrorKind, RunMessage, TurnRequest,
        TurnResponse,
    };
    use serde_json::json;

    use super::{MockProvider, MOCK_PROVIDER_ID};

    fn request(text: &str) -> TurnRequest {
        TurnRequest {
            instructions: "be brief".to_string(),
            messages: vec![RunMessage::UserText {
                text: text.to_string(),
            }],
            tools: Vec::new(),
        }
    }

    fn idle_cancel() -> CancelSignal {
        Arc::new(AtomicBool::new(false))
    }

    fn collect_chunks(
        provider: &MockProvider,
        request: &TurnRequest,
    ) -> (Result<TurnResponse, ProviderError>, Vec<String>) {
        let mut chunks = Vec::new();
        let result = provider.send_turn(request, &idle_cancel(), &mut |chunk| {
            chunks.push(chunk.to_string())
        });
        (result, chunks)
    }

    #[test]
    fn exhausted_script_echoes_latest_user_text_in_word_chunks() {
        let provider = MockProvider::new();
        let (result, chunks) = collect_chunks(&provider, &request("hello world"));

        assert_eq!(
            result.expect("echo should succeed"),
            TurnResponse::FinalAnswer {
                text: "Mock response to: hello world".to_string()
            }
        );
        assert_eq!(chunks.concat(), "Mock response to: hello world");
        assert!(chunks.len() > 1);
        assert_eq!(provider.profile().provider_id, MOCK_PROVIDER_ID);
    }

    #[test]
    fn scripted_steps_replay_in_order_and_requests_are_recorded() {
        let provider = MockProvider::new();
        provider.push_tool_calls([("call-1", "read_file", json!({"path": "a.txt"}))]);
        provider.push_error(ProviderError::new(ProviderErrorKind::RateLimited, "429"));
        provider.push_final("done");

        let (first, chunks) = collect_chunks(&provider, &request("go"));
        assert!(matches!(
            first.expect("tool calls"),
            TurnResponse::ToolCalls { calls, .. } if calls[0].tool_name == "read_file"
        ));
        assert!(chunks.is_empty());

        let (second, _) = collect_chunks(&provider, &request("go"));
        assert_eq!(
            second.expect_err("scripted failure").kind,
            ProviderErrorKind::RateLimited
        );

        let (third, _) = collect_chunks(&provider, &request("go"));
        assert_eq!(
            third.expect("final answer"),
            TurnResponse::FinalAnswer {
                text: "done".to_string()
            }
        );

        assert_eq!(provider.request_count(), 3);
        assert_eq!(provider.remaining_steps(), 0);
    }

    #[test]
    fn cancelled_signal_short_circuits_before_consuming_script() {
        let provider = MockProvider::new();
        provider.push_final("never");
        let cancel: CancelSignal = Arc::new(AtomicBool::new(true));

        let error = provider
            .send_turn(&request("stop"), &cancel, &mut |_| {})
            .expect_err("cancelled turn must fail");

        assert_eq!(error.kind, ProviderErrorKind::Cancelled);
        assert_eq!(provider.remaining_steps(), 1);
    }
}
