//! The agentic turn: provider round trips interleaved with guarded tool steps.
//!
//! Every tool call goes through the same fixed pipeline:
//! resolve → parse → validate → checkpoint → execute → audit → append.
//! Steps run sequentially and cancellation is only observed between them, so a
//! mutation is never interrupted halfway.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use agent_provider::{
    is_cancelled, CancelSignal, ProviderError, ProviderErrorKind, RunMessage, ToolCallRequest,
    ToolResult, TurnRequest, TurnResponse,
};
use audit_log::{AuditEntry, AuditError, Outcome, VerdictKind};
use checkpoint_store::{collect_tree, CheckpointOrigin};
use serde_json::{json, Map, Value};
use session_store::{SessionEntryKind, SessionStoreError};
use thiserror::Error;
use tool_policy::{BashMutation, Verdict};
use tracing::{debug, error, info, warn};

use crate::prompt::compose_instructions;
use crate::session::Session;
use crate::tools::{self, ToolCall, ToolKind, ToolOutput};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);
const AUDIT_SUMMARY_CHARS: usize = 200;
pub const CANCELLED_BEFORE_EXECUTION: &str = "cancelled before execution";
pub const INTERRUPTED_TOOL_RESULT: &str = "interrupted: no result was recorded for this call";

/// Progress reported while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Chunk(String),
    ToolStarted {
        call_id: String,
        tool_name: String,
    },
    ToolFinished {
        call_id: String,
        tool_name: String,
        ok: bool,
        checkpoint_id: Option<String>,
    },
    Warning(String),
    Retrying {
        attempt: u32,
        delay: Duration,
        error: ProviderError,
    },
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("input is empty")]
    EmptyInput,

    #[error("provider unavailable after {attempts} attempt(s): {error}{}", checkpoint_hint(.latest_checkpoint))]
    ProviderUnavailable {
        attempts: u32,
        #[source]
        error: ProviderError,
        latest_checkpoint: Option<String>,
    },

    #[error("no final answer after {iterations} iterations; changes so far are kept{}", checkpoint_hint(.latest_checkpoint))]
    ToolBudgetExceeded {
        iterations: usize,
        latest_checkpoint: Option<String>,
    },

    #[error("audit log write failed, turn aborted: {source}{}", checkpoint_hint(.latest_checkpoint))]
    AuditWriteFailed {
        #[source]
        source: AuditError,
        latest_checkpoint: Option<String>,
    },

    #[error("session transcript error: {0}")]
    Session(#[from] SessionStoreError),

    #[error("turn cancelled{}", checkpoint_hint(.latest_checkpoint))]
    Cancelled { latest_checkpoint: Option<String> },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TurnError {
    #[must_use]
    pub fn latest_checkpoint(&self) -> Option<&str> {
        match self {
            Self::ProviderUnavailable {
                latest_checkpoint, ..
            }
            | Self::ToolBudgetExceeded {
                latest_checkpoint, ..
            }
            | Self::AuditWriteFailed {
                latest_checkpoint, ..
            }
            | Self::Cancelled { latest_checkpoint } => latest_checkpoint.as_deref(),
            Self::EmptyInput | Self::Session(_) | Self::Internal(_) => None,
        }
    }
}

fn checkpoint_hint(latest: &Option<String>) -> String {
    match latest {
        Some(id) => format!(" (latest checkpoint {id}; /rewind {id} restores it)"),
        None => String::new(),
    }
}

/// Runs one user turn to completion and returns the final answer.
///
/// Everything appended before an error stays persisted.
pub fn run_turn(
    session: &mut Session,
    input: &str,
    cancel: &CancelSignal,
    on_event: &mut dyn FnMut(AgentEvent),
) -> Result<String, TurnError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TurnError::EmptyInput);
    }

    session.store.append_kind(SessionEntryKind::UserText {
        text: input.to_string(),
    })?;
    info!(session_id = session.session_id(), "turn started");

    let mut seen_call_ids = HashSet::new();
    let max_iterations = session.settings.max_iterations;
    for iteration in 1..=max_iterations {
        if is_cancelled(cancel) {
            return Err(cancelled(session));
        }

        let request = build_request(session)?;
        let response = request_with_retry(session, &request, cancel, on_event)?;

        let (preamble, calls) = match response {
            TurnResponse::FinalAnswer { text } => {
                session
                    .store
                    .append_kind(SessionEntryKind::AssistantText { text: text.clone() })?;
                info!(iteration, "turn finished");
                return Ok(text);
            }
            TurnResponse::ToolCalls { preamble, calls } => (preamble, calls),
        };

        let preamble = preamble.filter(|text| !text.trim().is_empty());
        if calls.is_empty() {
            let text = preamble.unwrap_or_default();
            session
                .store
                .append_kind(SessionEntryKind::AssistantText { text: text.clone() })?;
            return Ok(text);
        }
        if let Some(text) = preamble {
            session
                .store
                .append_kind(SessionEntryKind::AssistantText { text })?;
        }

        let calls = assign_call_ids(calls, iteration, &mut seen_call_ids);
        for call in &calls {
            session.store.append_kind(SessionEntryKind::ToolCall {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            })?;
        }
        debug!(iteration, calls = calls.len(), "executing tool calls");

        for (index, call) in calls.iter().enumerate() {
            if is_cancelled(cancel) {
                for skipped in &calls[index..] {
                    append_result(
                        session,
                        ToolResult::error(
                            skipped.call_id.clone(),
                            skipped.tool_name.clone(),
                            json!({ "error": CANCELLED_BEFORE_EXECUTION }),
                        ),
                    )?;
                }
                info!(skipped = calls.len() - index, "turn cancelled between tool steps");
                return Err(cancelled(session));
            }
            execute_tool_call(session, call, on_event)?;
        }
    }

    warn!(max_iterations, "tool budget exhausted without a final answer");
    Err(TurnError::ToolBudgetExceeded {
        iterations: max_iterations,
        latest_checkpoint: session.latest_checkpoint_id(),
    })
}

fn cancelled(session: &Session) -> TurnError {
    TurnError::Cancelled {
        latest_checkpoint: session.latest_checkpoint_id(),
    }
}

/// Gives blank or repeated ids a deterministic `call_<iteration>_<index>` id.
fn assign_call_ids(
    calls: Vec<ToolCallRequest>,
    iteration: usize,
    seen: &mut HashSet<String>,
) -> Vec<ToolCallRequest> {
    calls
        .into_iter()
        .enumerate()
        .map(|(index, mut call)| {
            let trimmed = call.call_id.trim();
            if trimmed.is_empty() || seen.contains(trimmed) {
                let base = format!("call_{iteration}_{index}");
                let mut candidate = base.clone();
                let mut suffix = 1;
                while seen.contains(&candidate) {
                    candidate = format!("{base}_{suffix}");
                    suffix += 1;
                }
                debug!(original = %call.call_id, assigned = %candidate, "synthesized tool call id");
                call.call_id = candidate;
            }
            seen.insert(call.call_id.clone());
            call
        })
        .collect()
}

pub(crate) fn build_request(session: &Session) -> Result<TurnRequest, SessionStoreError> {
    let history = session.context()?;
    let history = window_history(history, session.settings.history_window);
    let read_only = session.plan_mode();
    Ok(TurnRequest {
        instructions: compose_instructions(
            &session.settings.system_instructions,
            session.cwd(),
            read_only,
        ),
        messages: patch_dangling_tool_calls(history),
        tools: tools::definitions(read_only),
    })
}

/// Keeps the last `window` user turns, cutting only at a user message.
fn window_history(messages: Vec<RunMessage>, window: Option<usize>) -> Vec<RunMessage> {
    let Some(window) = window else {
        return messages;
    };
    let user_positions = messages
        .iter()
        .enumerate()
        .filter(|(_, message)| matches!(message, RunMessage::UserText { .. }))
        .map(|(index, _)| index)
        .collect::<Vec<_>>();
    if user_positions.len() <= window {
        return messages;
    }
    let start = user_positions[user_positions.len() - window];
    messages.into_iter().skip(start).collect()
}

/// Adds an "interrupted" result for every tool call that never got one, so
/// providers always see answered calls. Only the request is patched.
fn patch_dangling_tool_calls(messages: Vec<RunMessage>) -> Vec<RunMessage> {
    fn flush(pending: &mut Vec<(String, String)>, patched: &mut Vec<RunMessage>) {
        for (call_id, tool_name) in pending.drain(..) {
            patched.push(RunMessage::ToolResult {
                call_id,
                tool_name,
                content: json!({ "error": INTERRUPTED_TOOL_RESULT }),
                is_error: true,
            });
        }
    }

    let mut patched = Vec::with_capacity(messages.len());
    let mut pending: Vec<(String, String)> = Vec::new();
    for message in messages {
        match &message {
            RunMessage::ToolCall {
                call_id, tool_name, ..
            } => pending.push((call_id.clone(), tool_name.clone())),
            RunMessage::ToolResult { call_id, .. } => pending.retain(|(id, _)| id != call_id),
            RunMessage::UserText { .. } | RunMessage::AssistantText { .. } => {
                flush(&mut pending, &mut patched);
            }
        }
        patched.push(message);
    }
    flush(&mut pending, &mut patched);
    patched
}

fn request_with_retry(
    session: &Session,
    request: &TurnRequest,
    cancel: &CancelSignal,
    on_event: &mut dyn FnMut(AgentEvent),
) -> Result<TurnResponse, TurnError> {
    let provider = session.provider();
    let max_attempts = session.settings.provider_max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = provider.send_turn(request, cancel, &mut |chunk| {
            on_event(AgentEvent::Chunk(chunk.to_string()));
        });

        let error = match result {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };
        if error.kind == ProviderErrorKind::Cancelled || is_cancelled(cancel) {
            return Err(cancelled(session));
        }
        if !error.retryable || attempt >= max_attempts {
            warn!(attempt, %error, "provider request failed");
            return Err(TurnError::ProviderUnavailable {
                attempts: attempt,
                error,
                latest_checkpoint: session.latest_checkpoint_id(),
            });
        }

        let delay = backoff_delay(session.settings.retry_base_delay, attempt);
        warn!(attempt, ?delay, %error, "retrying provider request");
        on_event(AgentEvent::Retrying {
            attempt,
            delay,
            error,
        });
        if !sleep_unless_cancelled(delay, cancel) {
            return Err(cancelled(session));
        }
    }
}

/// `base * 2^(attempt - 1)`, capped at eight seconds.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1_u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Returns false when cancelled before `delay` elapsed.
fn sleep_unless_cancelled(delay: Duration, cancel: &CancelSignal) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if is_cancelled(cancel) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
    }
}

/// Facts gathered while a call moves through the pipeline.
struct StepRecord<'a> {
    call: &'a ToolCallRequest,
    verdict: VerdictKind,
    warning: Option<String>,
    checkpoint_id: Option<String>,
}

impl StepRecord<'_> {
    fn audit_entry(&self, outcome: Outcome, reason: Option<&str>) -> AuditEntry {
        let mut entry = AuditEntry::new(
            self.call.call_id.clone(),
            self.call.tool_name.clone(),
            self.call.arguments.clone(),
            self.verdict,
            outcome,
        )
        .with_checkpoint(self.checkpoint_id.clone());
        if let Some(reason) = reason.or(self.warning.as_deref()) {
            entry = entry.with_reason(reason);
        }
        entry
    }
}

fn execute_tool_call(
    session: &mut Session,
    call: &ToolCallRequest,
    on_event: &mut dyn FnMut(AgentEvent),
) -> Result<(), TurnError> {
    on_event(AgentEvent::ToolStarted {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
    });
    let cwd = session.cwd().to_path_buf();
    let mut step = StepRecord {
        call,
        verdict: VerdictKind::NotEvaluated,
        warning: None,
        checkpoint_id: None,
    };

    let Some(kind) = tools::resolve(&call.tool_name) else {
        debug!(tool = %call.tool_name, "unknown tool requested");
        let message = format!("ToolNotFound: no tool named '{}'", call.tool_name);
        return finish_unexecuted(session, &step, message, on_event);
    };

    let parsed = match ToolCall::parse(kind, &call.arguments) {
        Ok(parsed) => parsed,
        Err(error) => {
            let message = format!("InvalidArguments: {error}");
            return finish_unexecuted(session, &step, message, on_event);
        }
    };

    match session.policy.validate(&call.tool_name, &call.arguments, &cwd) {
        Verdict::Deny(reason) => {
            step.verdict = VerdictKind::Deny;
            let message = format!("ValidationDenied: {reason}");
            return finish_unexecuted(session, &step, message, on_event);
        }
        Verdict::AllowWithWarning(reason) => {
            on_event(AgentEvent::Warning(format!("{}: {reason}", call.tool_name)));
            step.verdict = VerdictKind::AllowWithWarning;
            step.warning = Some(reason);
        }
        Verdict::Allow => step.verdict = VerdictKind::Allow,
    }

    let mut planned_paths = Vec::new();
    if kind.is_mutating() {
        if let Err(source) = session.audit.preflight() {
            error!(%source, "audit log unavailable before mutating tool");
            let message = format!("AuditUnavailable: {source}");
            append_result(session, error_result(call, &message, &step))?;
            return Err(TurnError::AuditWriteFailed {
                source,
                latest_checkpoint: session.latest_checkpoint_id(),
            });
        }

        if let Some(paths) = checkpoint_targets(session, &parsed, &cwd) {
            match session
                .checkpoints
                .snapshot(&paths, None, CheckpointOrigin::Auto)
            {
                Ok(checkpoint) => {
                    debug!(checkpoint_id = %checkpoint.id, files = paths.len(), "checkpoint taken");
                    step.checkpoint_id = Some(checkpoint.id);
                    planned_paths = paths;
                }
                Err(source) => {
                    error!(%source, tool = %call.tool_name, "checkpoint failed; tool not executed");
                    let message = format!("CheckpointFailure: {source}");
                    return finish_unexecuted(session, &step, message, on_event);
                }
            }
        }
    }

    let started = Instant::now();
    let executor = &mut session.executor;
    let output = match catch_unwind(AssertUnwindSafe(|| executor.execute(&parsed, &cwd))) {
        Ok(output) => output,
        Err(payload) => {
            error!(tool = %call.tool_name, "tool panicked");
            ToolOutput::fail(format!("tool panicked: {}", panic_message(payload.as_ref())))
        }
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut files_touched = output.files_touched.clone();
    if files_touched.is_empty() && kind == ToolKind::Bash && output.ok {
        files_touched = planned_paths;
    }
    let outcome = if output.ok {
        Outcome::ExecutedOk
    } else {
        Outcome::ExecutedFailed
    };
    let text = if output.ok {
        output.content
    } else {
        format!("ToolExecutionError: {}", output.content)
    };

    let audited = session.audit.record(
        step.audit_entry(outcome, None)
            .with_summary(summarize(&text))
            .with_duration_ms(duration_ms),
    );

    let mut content = Map::new();
    content.insert(
        if output.ok { "output" } else { "error" }.to_string(),
        Value::String(text),
    );
    if !files_touched.is_empty() {
        content.insert(
            "files_touched".to_string(),
            json!(relative_paths(session.project_root(), &files_touched)),
        );
    }
    if let Some(code) = output.exit_code {
        content.insert("exit_code".to_string(), json!(code));
    }
    decorate(&mut content, &step);
    let result = ToolResult {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        is_error: !output.ok,
        content: Value::Object(content),
    };
    append_result(session, result)?;

    if let Err(source) = audited {
        error!(%source, call_id = %call.call_id, "audit record lost; aborting turn");
        return Err(TurnError::AuditWriteFailed {
            source,
            latest_checkpoint: session.latest_checkpoint_id(),
        });
    }

    debug!(tool = %call.tool_name, ok = output.ok, duration_ms, "tool step finished");
    on_event(AgentEvent::ToolFinished {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        ok: output.ok,
        checkpoint_id: step.checkpoint_id,
    });
    Ok(())
}

/// Paths to snapshot before `call` runs, or `None` when nothing needs one.
fn checkpoint_targets(session: &Session, call: &ToolCall, cwd: &Path) -> Option<Vec<PathBuf>> {
    if let Some(raw) = call.target_path() {
        return session.policy.resolve(raw, cwd).ok().map(|path| vec![path]);
    }
    let ToolCall::Bash { command, .. } = call else {
        return None;
    };

    let limits = session.tree_limits();
    match session.policy.bash_mutation(command, cwd) {
        BashMutation::None => None,
        BashMutation::Paths(paths) => Some(
            paths
                .into_iter()
                .flat_map(|path| {
                    if path.is_dir() {
                        collect_tree(&path, &limits).files
                    } else {
                        vec![path]
                    }
                })
                .collect(),
        ),
        BashMutation::Workspace => Some(collect_tree(session.project_root(), &limits).files),
    }
}

/// Audits and answers a call that never reached execution.
fn finish_unexecuted(
    session: &mut Session,
    step: &StepRecord<'_>,
    message: String,
    on_event: &mut dyn FnMut(AgentEvent),
) -> Result<(), TurnError> {
    let audited = session
        .audit
        .record(step.audit_entry(Outcome::NotExecuted, Some(&message)));
    append_result(session, error_result(step.call, &message, step))?;
    if let Err(source) = audited {
        error!(%source, call_id = %step.call.call_id, "audit record lost; aborting turn");
        return Err(TurnError::AuditWriteFailed {
            source,
            latest_checkpoint: session.latest_checkpoint_id(),
        });
    }

    on_event(AgentEvent::ToolFinished {
        call_id: step.call.call_id.clone(),
        tool_name: step.call.tool_name.clone(),
        ok: false,
        checkpoint_id: step.checkpoint_id.clone(),
    });
    Ok(())
}

fn error_result(call: &ToolCallRequest, message: &str, step: &StepRecord<'_>) -> ToolResult {
    let mut content = Map::new();
    content.insert("error".to_string(), Value::String(message.to_string()));
    decorate(&mut content, step);
    ToolResult::error(call.call_id.clone(), call.tool_name.clone(), Value::Object(content))
}

fn decorate(content: &mut Map<String, Value>, step: &StepRecord<'_>) {
    if let Some(checkpoint_id) = &step.checkpoint_id {
        content.insert("checkpoint_id".to_string(), json!(checkpoint_id));
    }
    if let Some(warning) = &step.warning {
        content.insert("warning".to_string(), json!(warning));
    }
}

fn append_result(session: &mut Session, result: ToolResult) -> Result<(), TurnError> {
    session.store.append_kind(SessionEntryKind::ToolResult {
        call_id: result.call_id,
        tool_name: result.tool_name,
        content: result.content,
        is_error: result.is_error,
    })?;
    Ok(())
}

fn relative_paths(root: &Path, paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|path| {
            path.strip_prefix(root)
                .unwrap_or(path)
                .display()
                .to_string()
        })
        .collect()
}

fn summarize(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= AUDIT_SUMMARY_CHARS {
        return single_line;
    }
    let mut summary = single_line
        .chars()
        .take(AUDIT_SUMMARY_CHARS)
        .collect::<String>();
    summary.push_str("...");
    summary
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use agent_provider::{RunMessage, ToolCallRequest};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        assign_call_ids, backoff_delay, patch_dangling_tool_calls, window_history,
        INTERRUPTED_TOOL_RESULT,
    };

    fn user(text: &str) -> RunMessage {
        RunMessage::UserText {
            text: text.to_string(),
        }
    }

    fn assistant(text: &str) -> RunMessage {
        RunMessage::AssistantText {
            text: text.to_string(),
        }
    }

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: id.to_string(),
            tool_name: "read_file".to_string(),
            arguments: json!({}),
        }
    }

    #[test]
    fn blank_and_duplicate_call_ids_are_synthesized() {
        let mut seen = HashSet::new();
        let ids = assign_call_ids(vec![call(""), call("a"), call("a"), call("  ")], 2, &mut seen)
            .into_iter()
            .map(|call| call.call_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["call_2_0", "a", "call_2_2", "call_2_3"]);

        let next = assign_call_ids(vec![call("a")], 3, &mut seen);
        assert_eq!(next[0].call_id, "call_3_0");
    }

    #[test]
    fn history_window_cuts_at_user_boundaries() {
        let history = vec![
            user("one"),
            assistant("1"),
            user("two"),
            assistant("2"),
            user("three"),
        ];
        assert_eq!(
            window_history(history.clone(), Some(2)),
            vec![user("two"), assistant("2"), user("three")]
        );
        assert_eq!(window_history(history.clone(), Some(5)), history);
        assert_eq!(window_history(history.clone(), None), history);
    }

    #[test]
    fn dangling_tool_calls_get_interrupted_results() {
        let messages = vec![
            user("go"),
            RunMessage::ToolCall {
                call_id: "c1".to_string(),
                tool_name: "bash".to_string(),
                arguments: json!({"command": "ls"}),
            },
            RunMessage::ToolCall {
                call_id: "c2".to_string(),
                tool_name: "read_file".to_string(),
                arguments: json!({"path": "a"}),
            },
            RunMessage::ToolResult {
                call_id: "c2".to_string(),
                tool_name: "read_file".to_string(),
                content: json!({"output": "x"}),
                is_error: false,
            },
            user("again"),
        ];

        let patched = patch_dangling_tool_calls(messages);
        assert_eq!(patched.len(), 6);
        assert_eq!(
            patched[4],
            RunMessage::ToolResult {
                call_id: "c1".to_string(),
                tool_name: "bash".to_string(),
                content: json!({"error": INTERRUPTED_TOOL_RESULT}),
                is_error: true,
            }
        );
        assert_eq!(patched[5], user("again"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 10), Duration::from_secs(8));
    }
}
