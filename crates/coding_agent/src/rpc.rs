//! JSON-RPC 2.0 server for editor integrations.
//!
//! Messages are framed as `Content-Length: <n>\r\n\r\n<json>` on stdin and
//! stdout. Stdout carries protocol frames only; diagnostics go to stderr
//! through `tracing`.

use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use agent_provider::{CancelSignal, RunMessage, TurnRequest, TurnResponse};
use checkpoint_store::{CheckpointSummary, RestoreOutcome, RestoreReport};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{AgentEvent, TurnError};
use crate::config::AppConfig;
use crate::prompt::inline_completion_prompt;
use crate::providers::provider_for;
use crate::runtime::RuntimeController;
use crate::session::Session;
use crate::tools;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;

pub const STREAM_CHUNK_METHOD: &str = "agent/streamChunk";
const SERVER_NAME: &str = "coding-agent";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("frame is missing its Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length header value {value:?}")]
    InvalidContentLength { value: String },
}

/// Reads one framed message body. `Ok(None)` on a clean end of input.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>, RpcError> {
    let mut content_length = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if saw_header {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length =
                    Some(value.parse::<usize>().map_err(|_| RpcError::InvalidContentLength {
                        value: value.to_string(),
                    })?);
            }
        }
    }

    let length = content_length.ok_or(RpcError::MissingContentLength)?;
    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

pub fn write_frame<W: Write>(writer: &mut W, message: &Value) -> Result<(), RpcError> {
    let body = message.to_string();
    write!(writer, "Content-Length: {}\r\n\r\n{body}", body.len())?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct MethodError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl MethodError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn to_value(&self) -> Value {
        let mut error = json!({ "code": self.code, "message": self.message });
        if let (Some(data), Some(object)) = (&self.data, error.as_object_mut()) {
            object.insert("data".to_string(), data.clone());
        }
        error
    }
}

type MethodResult = Result<Value, MethodError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    provider: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineCompleteParams {
    #[serde(default)]
    code_before: String,
    #[serde(default)]
    code_after: String,
    instruction: Option<String>,
    file_path: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwitchProviderParams {
    provider: String,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RewindParams {
    checkpoint: Option<String>,
}

pub struct RpcServer<R, W> {
    reader: R,
    writer: W,
    runtime: RuntimeController,
    config: AppConfig,
    initialized: bool,
    shutdown_requested: bool,
}

impl<R: BufRead, W: Write> RpcServer<R, W> {
    pub fn new(session: Session, config: AppConfig, reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            runtime: RuntimeController::new(session),
            config,
            initialized: false,
            shutdown_requested: false,
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeController {
        &self.runtime
    }

    /// Serves requests until `exit` or end of input.
    pub fn serve(&mut self) -> Result<(), RpcError> {
        info!("rpc server started");
        while let Some(body) = read_frame(&mut self.reader)? {
            let message = match serde_json::from_slice::<Value>(&body) {
                Ok(message) => message,
                Err(error) => {
                    warn!(%error, "unparseable rpc frame");
                    let reply = MethodError::new(PARSE_ERROR, format!("Parse error: {error}"));
                    self.respond(&Value::Null, Err(reply))?;
                    continue;
                }
            };
            if !self.handle_message(message)? {
                break;
            }
        }
        info!("rpc server stopped");
        Ok(())
    }

    /// Returns `false` once the client asked the server to exit.
    fn handle_message(&mut self, message: Value) -> Result<bool, RpcError> {
        let Some(object) = message.as_object() else {
            self.respond(
                &Value::Null,
                Err(MethodError::new(INVALID_REQUEST, "Invalid request: expected an object")),
            )?;
            return Ok(true);
        };
        let id = object.get("id").cloned();
        let reply_id = id.clone().unwrap_or(Value::Null);

        if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            self.respond(
                &reply_id,
                Err(MethodError::new(INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\"")),
            )?;
            return Ok(true);
        }
        let Some(method) = object.get("method").and_then(Value::as_str) else {
            self.respond(&reply_id, Err(MethodError::new(INVALID_REQUEST, "Missing method")))?;
            return Ok(true);
        };
        let method = method.to_string();
        let params = object.get("params").cloned().unwrap_or(Value::Null);
        debug!(%method, "rpc request");

        if method == "exit" {
            return Ok(false);
        }

        let result = self.dispatch(&method, params, &reply_id);
        match id {
            Some(id) => self.respond(&id, result)?,
            None => {
                if let Err(error) = result {
                    debug!(%method, message = %error.message, "notification failed");
                }
            }
        }
        Ok(true)
    }

    fn dispatch(&mut self, method: &str, params: Value, request_id: &Value) -> MethodResult {
        if self.shutdown_requested {
            return Err(MethodError::new(INVALID_REQUEST, "Server is shutting down"));
        }
        if method == "initialize" {
            return self.initialize(params);
        }
        if !self.initialized {
            return Err(MethodError::new(
                SERVER_NOT_INITIALIZED,
                "Server not initialized. Call 'initialize' first.",
            ));
        }

        match method {
            "shutdown" => {
                self.shutdown_requested = true;
                Ok(Value::Null)
            }
            "agent/chat" => self.chat(params, request_id),
            "agent/inlineComplete" => self.inline_complete(params),
            "agent/getTools" => Ok(self.tools()),
            "agent/getProviderInfo" => Ok(self.provider_info()),
            "agent/switchProvider" => self.switch_provider(params),
            "agent/clearHistory" => {
                self.runtime
                    .session()
                    .clear_context()
                    .map_err(|error| MethodError::internal(error.to_string()))?;
                Ok(json!({ "success": true }))
            }
            "agent/listCheckpoints" => self.list_checkpoints(),
            "agent/rewind" => self.rewind(params),
            other => Err(MethodError::new(
                METHOD_NOT_FOUND,
                format!("Unknown method: {other}"),
            )),
        }
    }

    fn initialize(&mut self, params: Value) -> MethodResult {
        let params: InitializeParams = parse_params(params, true)?;
        if let Some(provider_id) = params.provider.as_deref() {
            let provider = provider_for(provider_id, params.model.as_deref(), &self.config.provider)
                .map_err(|error| MethodError::internal(format!("Initialization failed: {error}")))?;
            self.runtime.session().set_provider(provider);
        }
        self.initialized = true;

        let session_id = self.runtime.session().session_id().to_string();
        Ok(json!({
            "capabilities": {
                "chatProvider": true,
                "inlineCompletionProvider": true,
                "streaming": true,
                "checkpoints": true,
            },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            "providerInfo": self.provider_info(),
            "sessionId": session_id,
        }))
    }

    fn chat(&mut self, params: Value, request_id: &Value) -> MethodResult {
        let params: ChatParams = parse_params(params, false)?;
        if params.message.trim().is_empty() {
            return Err(MethodError::invalid_params("message must not be empty"));
        }
        let handle = self
            .runtime
            .start_turn(params.message)
            .map_err(|error| MethodError::internal(error.to_string()))?;

        let writer = &mut self.writer;
        let mut transport_error = None;
        let result = handle.wait(|event| {
            if transport_error.is_some() {
                return;
            }
            if let AgentEvent::Chunk(chunk) = event {
                if let Err(error) = write_frame(writer, &stream_chunk(request_id, &chunk, false)) {
                    transport_error = Some(error);
                }
            }
        });
        if let Some(error) = transport_error {
            return Err(MethodError::internal(format!("stream write failed: {error}")));
        }
        write_frame(&mut self.writer, &stream_chunk(request_id, "", true))
            .map_err(|error| MethodError::internal(format!("stream write failed: {error}")))?;

        match result {
            Ok(content) => Ok(json!({ "content": content, "role": "assistant" })),
            Err(TurnError::EmptyInput) => Err(MethodError::invalid_params("message must not be empty")),
            Err(error) => {
                let latest = error.latest_checkpoint().map(str::to_string);
                Err(MethodError::internal(error.to_string())
                    .with_data(json!({ "latestCheckpoint": latest })))
            }
        }
    }

    fn inline_complete(&mut self, params: Value) -> MethodResult {
        let params: InlineCompleteParams = parse_params(params, false)?;
        let prompt = inline_completion_prompt(
            &params.code_before,
            &params.code_after,
            params.instruction.as_deref(),
            params.file_path.as_deref(),
            params.language.as_deref(),
        );

        let (provider, instructions) = {
            let session = self.runtime.session();
            (session.provider(), session.settings().system_instructions.clone())
        };
        let request = TurnRequest {
            instructions,
            messages: vec![RunMessage::UserText { text: prompt }],
            tools: Vec::new(),
        };
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        let response = provider
            .send_turn(&request, &cancel, &mut |_| {})
            .map_err(|error| MethodError::internal(error.to_string()))?;

        let completion = match response {
            TurnResponse::FinalAnswer { text } => text,
            TurnResponse::ToolCalls { preamble, .. } => preamble.unwrap_or_default(),
        };
        Ok(json!({ "completion": completion, "isPartial": false }))
    }

    fn tools(&self) -> Value {
        let read_only = self.runtime.session().plan_mode();
        let tools = tools::definitions(read_only)
            .into_iter()
            .map(|definition| {
                json!({
                    "name": definition.name,
                    "description": definition.description,
                    "inputSchema": definition.input_schema,
                })
            })
            .collect::<Vec<_>>();
        json!({ "tools": tools })
    }

    fn provider_info(&self) -> Value {
        let session = self.runtime.session();
        let provider = session.provider();
        let profile = provider.profile();
        json!({
            "provider": profile.provider_id,
            "model": profile.model_id,
            "streaming": provider.supports_streaming(),
            "planMode": session.plan_mode(),
        })
    }

    fn switch_provider(&mut self, params: Value) -> MethodResult {
        let params: SwitchProviderParams = parse_params(params, false)?;
        let provider = provider_for(&params.provider, params.model.as_deref(), &self.config.provider)
            .map_err(|error| MethodError::invalid_params(error.to_string()))?;
        self.runtime.session().set_provider(provider);
        self.config.provider.id = params.provider;
        if params.model.is_some() {
            self.config.provider.model = params.model;
        }
        Ok(json!({ "success": true, "provider": self.provider_info() }))
    }

    fn list_checkpoints(&self) -> MethodResult {
        let checkpoints = self
            .runtime
            .session()
            .list_checkpoints()
            .map_err(|error| MethodError::internal(error.to_string()))?;
        let checkpoints = checkpoints.iter().map(checkpoint_json).collect::<Vec<_>>();
        Ok(json!({ "checkpoints": checkpoints }))
    }

    fn rewind(&mut self, params: Value) -> MethodResult {
        let params: RewindParams = parse_params(params, true)?;
        let selector = params.checkpoint.unwrap_or_else(|| "last".to_string());
        let report = self
            .runtime
            .session()
            .rewind(&selector)
            .map_err(|error| MethodError::internal(error.to_string()))?;
        Ok(restore_report_json(&report))
    }

    fn respond(&mut self, id: &Value, result: MethodResult) -> Result<(), RpcError> {
        let mut response = Map::new();
        response.insert("jsonrpc".to_string(), json!("2.0"));
        response.insert("id".to_string(), id.clone());
        match result {
            Ok(value) => response.insert("result".to_string(), value),
            Err(error) => response.insert("error".to_string(), error.to_value()),
        };
        write_frame(&mut self.writer, &Value::Object(response))
    }
}

/// Deserializes `params`. Absent params are accepted only when `optional`.
fn parse_params<T: for<'de> Deserialize<'de>>(params: Value, optional: bool) -> Result<T, MethodError> {
    let params = match params {
        Value::Null if optional => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(params)
        .map_err(|error| MethodError::invalid_params(format!("Invalid params: {error}")))
}

fn stream_chunk(request_id: &Value, chunk: &str, done: bool) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": STREAM_CHUNK_METHOD,
        "params": { "requestId": request_id, "chunk": chunk, "done": done },
    })
}

fn checkpoint_json(checkpoint: &CheckpointSummary) -> Value {
    json!({
        "id": checkpoint.id,
        "createdAt": checkpoint.created_at,
        "label": checkpoint.label,
        "origin": checkpoint.origin.as_str(),
        "fileCount": checkpoint.file_count,
        "totalBytes": checkpoint.total_bytes,
    })
}

fn restore_report_json(report: &RestoreReport) -> Value {
    let paths = report
        .paths
        .iter()
        .map(|(path, outcome)| {
            let (status, reason) = match outcome {
                RestoreOutcome::Restored => ("restored", None),
                RestoreOutcome::Deleted => ("deleted", None),
                RestoreOutcome::Unchanged => ("unchanged", None),
                RestoreOutcome::Failed(reason) => ("failed", Some(reason.as_str())),
            };
            json!({ "path": path.display().to_string(), "outcome": status, "reason": reason })
        })
        .collect::<Vec<_>>();
    json!({
        "checkpointId": report.checkpoint_id,
        "preRestoreId": report.pre_restore_id,
        "complete": report.is_complete(),
        "paths": paths,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::{read_frame, write_frame, RpcError};

    #[test]
    fn frames_round_trip_through_the_header() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .expect("write frame");
        assert!(buffer.starts_with(b"Content-Length: "));

        let mut reader = Cursor::new(buffer);
        let body = read_frame(&mut reader).expect("read frame").expect("one frame");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(value["method"], "initialize");
        assert!(read_frame(&mut reader).expect("clean eof").is_none());
    }

    #[test]
    fn header_names_are_case_insensitive_and_extra_headers_are_ignored() {
        let raw = b"content-length: 2\r\nContent-Type: application/json\r\n\r\n{}";
        let body = read_frame(&mut Cursor::new(&raw[..]))
            .expect("read frame")
            .expect("one frame");
        assert_eq!(body, b"{}");
    }

    #[test]
    fn missing_length_is_an_error() {
        let raw = b"Content-Type: application/json\r\n\r\n{}";
        assert!(matches!(
            read_frame(&mut Cursor::new(&raw[..])),
            Err(RpcError::MissingContentLength)
        ));
    }

    #[test]
    fn non_numeric_length_is_an_error() {
        let raw = b"Content-Length: lots\r\n\r\n{}";
        assert!(matches!(
            read_frame(&mut Cursor::new(&raw[..])),
            Err(RpcError::InvalidContentLength { .. })
        ));
    }
}
