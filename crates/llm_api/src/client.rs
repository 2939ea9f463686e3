use std::future::Future;
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LlmApiConfig;
use crate::error::{parse_error_message, LlmApiError};
use crate::headers::build_headers;
use crate::ndjson::NdjsonStreamParser;
use crate::retry::{is_retryable_http_error, retry_after, retry_delay};
use crate::sse::SseStreamParser;
use crate::url::endpoint;
use crate::wire::{self, ChatTurn, Completion, StreamDecoder};

/// Optional cancellation signal shared across request and stream loops.
pub type CancellationSignal = Arc<AtomicBool>;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct LlmApiClient {
    http: Client,
    config: LlmApiConfig,
}

impl LlmApiClient {
    pub fn new(config: LlmApiConfig) -> Result<Self, LlmApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(LlmApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &LlmApiConfig {
        &self.config
    }

    pub fn build_headers(&self, streaming: bool) -> Result<HeaderMap, LlmApiError> {
        let headers = build_headers(&self.config, streaming)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| LlmApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    LlmApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        turn: &ChatTurn,
        streaming: bool,
    ) -> Result<reqwest::RequestBuilder, LlmApiError> {
        let headers = self.build_headers(streaming)?;
        let body = wire::request_body(&self.config, turn, streaming)?;
        Ok(self
            .http
            .post(endpoint(&self.config, streaming)?)
            .headers(headers)
            .json(&body))
    }

    /// Sends the request, retrying retryable statuses and transport failures
    /// with exponential backoff (or the server's `Retry-After`).
    pub async fn send_with_retry(
        &self,
        turn: &ChatTurn,
        streaming: bool,
        cancellation: Option<&CancellationSignal>,
    ) -> Result<Response, LlmApiError> {
        let max_retries = self.config.max_retries;
        let mut last_status: Option<StatusCode> = None;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if is_cancelled(cancellation) {
                return Err(LlmApiError::Cancelled);
            }

            let response = self.build_request(turn, streaming)?.send();
            let response = await_or_cancel(response, cancellation)
                .await?
                .map_err(LlmApiError::from);

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    last_status = Some(status);
                    let server_delay = retry_after(response.headers());
                    let body = await_or_cancel(response.text(), cancellation)
                        .await?
                        .unwrap_or_default();
                    let message = parse_error_message(status, &body);
                    last_error = Some(message.clone());

                    if attempt < max_retries && is_retryable_http_error(status.as_u16(), &body) {
                        let delay = server_delay
                            .unwrap_or_else(|| retry_delay(self.config.retry_base_delay, attempt));
                        warn!(
                            backend = %self.config.backend,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying failed request"
                        );
                        await_or_cancel(tokio::time::sleep(delay), cancellation).await?;
                        continue;
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(LlmApiError::RateLimited {
                            message,
                            retry_after: server_delay,
                        });
                    }
                    return Err(LlmApiError::Status(status, message));
                }
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt < max_retries && error.is_transient() {
                        let delay = retry_delay(self.config.retry_base_delay, attempt);
                        warn!(
                            backend = %self.config.backend,
                            attempt,
                            %error,
                            "retrying after transport error"
                        );
                        await_or_cancel(tokio::time::sleep(delay), cancellation).await?;
                        continue;
                    }
                    if !error.is_transient() {
                        return Err(error);
                    }
                    return Err(LlmApiError::RetryExhausted {
                        status: last_status,
                        last_error,
                    });
                }
            }
        }

        Err(LlmApiError::RetryExhausted {
            status: last_status,
            last_error,
        })
    }

    /// Runs one turn and returns the normalized completion.
    ///
    /// When streaming is enabled, assistant text deltas are passed to
    /// `on_delta` as frames arrive.
    pub async fn complete<F>(
        &self,
        turn: &ChatTurn,
        cancellation: Option<&CancellationSignal>,
        mut on_delta: F,
    ) -> Result<Completion, LlmApiError>
    where
        F: FnMut(&str),
    {
        let streaming = self.config.streaming;
        debug!(
            backend = %self.config.backend,
            model = %self.config.model,
            streaming,
            messages = turn.messages.len(),
            "sending turn"
        );
        let response = self.send_with_retry(turn, streaming, cancellation).await?;

        if !streaming {
            let body = await_or_cancel(response.text(), cancellation)
                .await?
                .map_err(LlmApiError::from)?;
            return wire::parse_response(self.config.backend, &body);
        }

        let backend = self.config.backend;
        let mut decoder = StreamDecoder::new(backend);
        let mut bytes = response.bytes_stream();
        let mut sse = SseStreamParser::default();
        let mut ndjson = NdjsonStreamParser::default();

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), cancellation).await? else {
                break;
            };
            if is_cancelled(cancellation) {
                return Err(LlmApiError::Cancelled);
            }
            let chunk = chunk.map_err(LlmApiError::from)?;

            if backend.streams_ndjson() {
                for frame in ndjson.feed(&chunk)? {
                    decoder.apply(&frame, &mut on_delta)?;
                }
            } else {
                for frame in sse.feed(&chunk) {
                    if frame.is_done_marker() {
                        continue;
                    }
                    decoder.apply(&parse_sse_data(&frame.data)?, &mut on_delta)?;
                }
            }
        }

        if backend.streams_ndjson() {
            if let Some(frame) = ndjson.finish()? {
                decoder.apply(&frame, &mut on_delta)?;
            }
        } else if let Some(frame) = sse.finish() {
            if !frame.is_done_marker() {
                decoder.apply(&parse_sse_data(&frame.data)?, &mut on_delta)?;
            }
        }

        if is_cancelled(cancellation) {
            return Err(LlmApiError::Cancelled);
        }

        decoder.finish()
    }
}

fn parse_sse_data(data: &str) -> Result<Value, LlmApiError> {
    serde_json::from_str(data).map_err(|error| LlmApiError::MalformedSse(error.to_string()))
}

fn is_cancelled(cancel: Option<&CancellationSignal>) -> bool {
    cancel.is_some_and(|token| token.load(Ordering::Acquire))
}

async fn await_or_cancel<F>(
    future: F,
    cancellation: Option<&CancellationSignal>,
) -> Result<F::Output, LlmApiError>
where
    F: Future,
{
    if cancellation.is_none() {
        return Ok(future.await);
    }

    let mut future = Box::pin(future);

    loop {
        if is_cancelled(cancellation) {
            return Err(LlmApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if is_cancelled(cancellation) {
                return Err(LlmApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}
