use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use llm_api::{
    Backend, ChatTurn, LlmApiClient, LlmApiConfig, LlmApiError, WireMessage, WireTool,
};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

fn allow_local_integration() -> bool {
    std::env::var("LLM_API_ALLOW_LOCAL_INTEGRATION")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
enum ScriptedResponse {
    Respond {
        status: u16,
        content_type: &'static str,
        extra_headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<ResponseChunk>,
    },
    Reset,
}

#[derive(Debug, Clone)]
struct RecordedRequest {
    head: String,
    body: Value,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let requests = Arc::clone(&requests);

            async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, requests).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            requests,
            handle,
        }
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn response_sse(status: u16, frames: &[&str]) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "text/event-stream",
        extra_headers: Vec::new(),
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: sse_frames(frames),
        }],
    }
}

fn response_json(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status,
        content_type: "application/json",
        extra_headers: Vec::new(),
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn response_ndjson(lines: &[Value]) -> ScriptedResponse {
    ScriptedResponse::Respond {
        status: 200,
        content_type: "application/x-ndjson",
        extra_headers: Vec::new(),
        chunks: lines
            .iter()
            .map(|line| ResponseChunk {
                delay_ms: 0,
                bytes: format!("{line}\n").into_bytes(),
            })
            .collect(),
    }
}

fn sse_frames(frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();

    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }

    body.into_bytes()
}

fn sample_turn() -> ChatTurn {
    ChatTurn {
        system: "You are a coding agent.".to_string(),
        messages: vec![WireMessage::User {
            text: "list the files".to_string(),
        }],
        tools: vec![WireTool {
            name: "glob_files".to_string(),
            description: "Find files by glob pattern".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"pattern": {"type": "string"}},
                "required": ["pattern"]
            }),
        }],
    }
}

fn fast_retry(config: LlmApiConfig) -> LlmApiConfig {
    config.with_retry_policy(2, Duration::from_millis(5))
}

#[tokio::test]
async fn openai_non_streaming_retries_then_succeeds() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![
        response_json(503, r#"{"error":{"message":"overloaded"}}"#),
        response_json(
            200,
            &json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_a",
                            "type": "function",
                            "function": {"name": "glob_files", "arguments": "{\"pattern\":\"*.rs\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })
            .to_string(),
        ),
    ])
    .await;

    let config = fast_retry(
        LlmApiConfig::new(Backend::OpenAi)
            .with_api_key("sk-test")
            .with_base_url(&server.base_url)
            .with_streaming(false),
    );
    let client = LlmApiClient::new(config).expect("client");

    let completion = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect("completion after retry");

    assert_eq!(server.request_count(), 2);
    assert_eq!(completion.tool_calls.len(), 1);
    assert_eq!(completion.tool_calls[0].id, "call_a");
    assert_eq!(completion.tool_calls[0].arguments, json!({"pattern": "*.rs"}));

    let requests = server.requests();
    assert!(requests[0].request_line().starts_with("POST /chat/completions"));
    assert_eq!(requests[0].header("authorization"), Some("Bearer sk-test"));
    assert_eq!(requests[0].body["messages"][0]["role"], "system");
    assert_eq!(requests[0].body["tools"][0]["function"]["name"], "glob_files");

    server.shutdown();
}

#[tokio::test]
async fn non_retryable_status_fails_immediately() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![response_json(
        400,
        r#"{"error":{"message":"bad schema","type":"invalid_request_error"}}"#,
    )])
    .await;

    let config = fast_retry(
        LlmApiConfig::new(Backend::Anthropic)
            .with_api_key("k")
            .with_base_url(&server.base_url)
            .with_streaming(false),
    );
    let client = LlmApiClient::new(config).expect("client");

    let error = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect_err("400 should fail");

    assert!(matches!(
        error,
        LlmApiError::Status(status, ref message)
            if status.as_u16() == 400 && message.contains("bad schema")
    ));
    assert_eq!(server.request_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn rate_limit_exhaustion_reports_rate_limited() {
    if !allow_local_integration() {
        return;
    }

    let limited = ScriptedResponse::Respond {
        status: 429,
        content_type: "application/json",
        extra_headers: vec![("Retry-After", "0")],
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: br#"{"error":{"message":"slow down"}}"#.to_vec(),
        }],
    };
    let server = ScriptedServer::new(vec![limited.clone(), limited.clone(), limited]).await;

    let config = fast_retry(
        LlmApiConfig::new(Backend::OpenAi)
            .with_api_key("k")
            .with_base_url(&server.base_url)
            .with_streaming(false),
    );
    let client = LlmApiClient::new(config).expect("client");

    let error = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect_err("429 should exhaust");

    assert!(matches!(error, LlmApiError::RateLimited { .. }));
    assert_eq!(server.request_count(), 3);

    server.shutdown();
}

#[tokio::test]
async fn openai_stream_accumulates_text_and_tool_call_fragments() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Look"}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"ing."}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"glob_files","arguments":"{\"pat"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"tern\":\"src/**\"}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ],
    )])
    .await;

    let config = LlmApiConfig::new(Backend::OpenAi)
        .with_api_key("k")
        .with_base_url(&server.base_url);
    let client = LlmApiClient::new(config).expect("client");

    let mut deltas = Vec::new();
    let completion = client
        .complete(&sample_turn(), None, |delta| deltas.push(delta.to_string()))
        .await
        .expect("stream");

    assert_eq!(deltas, vec!["Look", "ing."]);
    assert_eq!(completion.text, "Looking.");
    assert_eq!(completion.tool_calls[0].name, "glob_files");
    assert_eq!(completion.tool_calls[0].arguments, json!({"pattern": "src/**"}));
    assert_eq!(completion.stop_reason.as_deref(), Some("tool_calls"));
    assert_eq!(server.requests()[0].body["stream"], true);

    server.shutdown();
}

#[tokio::test]
async fn anthropic_stream_decodes_tool_use_blocks() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"type":"message_start","message":{"id":"msg_1"}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"tu_1","name":"glob_files"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"pattern\":\"*\"}"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"}}"#,
            r#"{"type":"message_stop"}"#,
        ],
    )])
    .await;

    let config = LlmApiConfig::new(Backend::Anthropic)
        .with_api_key("ak")
        .with_base_url(&server.base_url);
    let client = LlmApiClient::new(config).expect("client");

    let completion = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect("stream");

    assert_eq!(completion.tool_calls[0].id, "tu_1");
    assert_eq!(completion.tool_calls[0].arguments, json!({"pattern": "*"}));

    let request = &server.requests()[0];
    assert!(request.request_line().starts_with("POST /v1/messages"));
    assert_eq!(request.header("x-api-key"), Some("ak"));
    assert_eq!(request.body["system"], "You are a coding agent.");

    server.shutdown();
}

#[tokio::test]
async fn gemini_stream_uses_sse_endpoint() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Done"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"."}]},"finishReason":"STOP"}]}"#,
        ],
    )])
    .await;

    let config = LlmApiConfig::new(Backend::Gemini)
        .with_api_key("gk")
        .with_base_url(&server.base_url);
    let client = LlmApiClient::new(config).expect("client");

    let completion = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect("stream");

    assert_eq!(completion.text, "Done.");
    assert_eq!(completion.stop_reason.as_deref(), Some("STOP"));

    let request = &server.requests()[0];
    assert!(request
        .request_line()
        .contains(":streamGenerateContent?alt=sse"));
    assert_eq!(request.header("x-goog-api-key"), Some("gk"));

    server.shutdown();
}

#[tokio::test]
async fn ollama_stream_reads_ndjson_lines() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![response_ndjson(&[
        json!({"message": {"role": "assistant", "content": "Hi"}, "done": false}),
        json!({"message": {"role": "assistant", "content": " there"}, "done": false}),
        json!({"message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop"}),
    ])])
    .await;

    let config = LlmApiConfig::new(Backend::Ollama).with_base_url(&server.base_url);
    let client = LlmApiClient::new(config).expect("client");

    let completion = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect("stream");

    assert_eq!(completion.text, "Hi there");
    assert!(server.requests()[0].request_line().starts_with("POST /api/chat"));
    assert_eq!(server.requests()[0].header("authorization"), None);

    server.shutdown();
}

#[tokio::test]
async fn missing_api_key_fails_before_any_request() {
    let config = LlmApiConfig::new(Backend::OpenAi).with_base_url("http://127.0.0.1:9");
    let client = LlmApiClient::new(config).expect("client");

    let error = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect_err("missing key");

    assert!(matches!(error, LlmApiError::MissingApiKey(Backend::OpenAi)));
}

#[tokio::test]
async fn cancellation_interrupts_a_slow_stream() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![ScriptedResponse::Respond {
        status: 200,
        content_type: "text/event-stream",
        extra_headers: Vec::new(),
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: sse_frames(&[r#"{"choices":[{"index":0,"delta":{"content":"a"}}]}"#]),
            },
            ResponseChunk {
                delay_ms: 5_000,
                bytes: sse_frames(&["[DONE]"]),
            },
        ],
    }])
    .await;

    let config = LlmApiConfig::new(Backend::OpenAi)
        .with_api_key("k")
        .with_base_url(&server.base_url);
    let client = LlmApiClient::new(config).expect("client");
    let cancel = Arc::new(AtomicBool::new(false));

    let trigger = Arc::clone(&cancel);
    tokio::spawn(async move {
        sleep(Duration::from_millis(100)).await;
        trigger.store(true, Ordering::Release);
    });

    let result = timeout(
        Duration::from_secs(2),
        client.complete(&sample_turn(), Some(&cancel), |_| {}),
    )
    .await
    .expect("cancellation should finish quickly");

    assert!(matches!(result, Err(LlmApiError::Cancelled)));

    server.shutdown();
}

#[tokio::test]
async fn connection_reset_is_retried() {
    if !allow_local_integration() {
        return;
    }

    let server = ScriptedServer::new(vec![
        ScriptedResponse::Reset,
        response_json(
            200,
            r#"{"message":{"role":"assistant","content":"ok"},"done":true}"#,
        ),
    ])
    .await;

    let config = fast_retry(
        LlmApiConfig::new(Backend::Ollama)
            .with_base_url(&server.base_url)
            .with_streaming(false),
    );
    let client = LlmApiClient::new(config).expect("client");

    let completion = client
        .complete(&sample_turn(), None, |_| {})
        .await
        .expect("second attempt succeeds");

    assert_eq!(completion.text, "ok");
    assert_eq!(server.request_count(), 2);

    server.shutdown();
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) {
    let Ok(recorded) = read_request(&mut socket).await else {
        return;
    };

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    if let Ok(mut requests) = requests.lock() {
        requests.push(recorded);
    }
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| response_json(500, r##"{"error":"unexpected request"}"##));

    match response {
        ScriptedResponse::Reset => {}
        ScriptedResponse::Respond {
            status,
            content_type,
            extra_headers,
            chunks,
        } => {
            let mut headers = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n",
                status_reason(status),
                content_type,
            );
            for (key, value) in extra_headers {
                headers.push_str(&format!("{key}: {value}\r\n"));
            }
            headers.push_str("\r\n");

            if socket.write_all(headers.as_bytes()).await.is_err() {
                return;
            }

            for chunk in chunks {
                if chunk.delay_ms > 0 {
                    sleep(Duration::from_millis(chunk.delay_ms)).await;
                }
                let prefix = format!("{:X}\r\n", chunk.bytes.len());
                if socket.write_all(prefix.as_bytes()).await.is_err() {
                    return;
                }
                if socket.write_all(&chunk.bytes).await.is_err() {
                    return;
                }
                if socket.write_all(b"\r\n").await.is_err() {
                    return;
                }
            }

            let _ = socket.write_all(b"0\r\n\r\n").await;
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];

    let head_end = loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break request.len();
        }
        request.extend_from_slice(&buffer[..n]);
        if let Some(position) = request.windows(4).position(|window| window == b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..head_end.min(request.len())]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while request.len() < head_end + content_length {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..n]);
    }

    let body_end = (head_end + content_length).min(request.len());
    let body = serde_json::from_slice(&request[head_end.min(body_end)..body_end])
        .unwrap_or(Value::Null);

    Ok(RecordedRequest { head, body })
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
