//! HTTP/SSE client implementation of the agent backend contract.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::backend_contract::{
    AgentBackend, BackendError, BackendEvent, EventStream, MessageSnapshot, PermissionDecision,
    PromptHandle,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    retry_after_seconds: Option<u64>,
) -> Duration {
    if let Some(retry_after_seconds) = retry_after_seconds {
        return Duration::from_secs(retry_after_seconds);
    }
    let exponent = attempt.saturating_sub(1).min(6) as u32;
    let scale = 2_u64.pow(exponent);
    Duration::from_millis(base_delay_ms.max(1).saturating_mul(scale))
}

pub(crate) fn is_retryable_backend_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

pub(crate) fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

fn truncate_for_error(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

/// Incremental decoder for `text/event-stream` payloads.
///
/// Accumulates `data:` lines until a blank line terminates the event;
/// comment lines and event-name lines are ignored. Chunks may split
/// anywhere, including mid-line.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut payloads = Vec::new();
        self.buffer.push_str(chunk);
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SubmitPromptResponse {
    message_id: String,
}

/// Reqwest-backed client for an agent backend speaking JSON over HTTP with
/// a server-sent-event feed per session.
#[derive(Clone)]
pub struct HttpAgentBackend {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    base_url: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl HttpAgentBackend {
    /// Builds a client pair: one with a request timeout for RPC calls, one
    /// with only a connect timeout so the event stream can stay open.
    pub fn new(
        base_url: &str,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self, BackendError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("courier-turn-relay"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .map_err(|error| BackendError::Unreachable(error.to_string()))?;
        let stream_http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .map_err(|error| BackendError::Unreachable(error.to_string()))?;

        Ok(Self {
            http,
            stream_http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    async fn request_json<T, F>(&self, operation: &str, mut builder: F) -> Result<T, BackendError>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|error| {
                            BackendError::Protocol(format!(
                                "failed to decode {operation} response: {error}"
                            ))
                        });
                    }
                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_backend_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    return Err(BackendError::Http {
                        status: status.as_u16(),
                        detail: format!("{operation}: {}", truncate_for_error(&body, 800)),
                    });
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(BackendError::Unreachable(format!("{operation}: {error}")));
                }
            }
        }
    }
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn submit_prompt(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<PromptHandle, BackendError> {
        let payload = json!({ "text": text });
        let url = format!("{}/session/{}/message", self.base_url, session_id);
        let response: SubmitPromptResponse = self
            .request_json("submit_prompt", || self.http.post(&url).json(&payload))
            .await?;
        Ok(PromptHandle {
            session_id: session_id.to_string(),
            message_id: response.message_id,
        })
    }

    async fn subscribe(&self, session_id: &str) -> Result<EventStream, BackendError> {
        let url = format!("{}/session/{}/event", self.base_url, session_id);
        let response = self
            .stream_http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|error| BackendError::Unreachable(format!("subscribe: {error}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                detail: format!("subscribe: {}", truncate_for_error(&body, 800)),
            });
        }

        let (event_tx, event_rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut body_stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = body_stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for payload in decoder.push(&String::from_utf8_lossy(&chunk)) {
                            let item = serde_json::from_str::<BackendEvent>(&payload).map_err(
                                |error| {
                                    BackendError::Protocol(format!("bad event payload: {error}"))
                                },
                            );
                            if event_tx.send(item).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "backend event stream transport error");
                        let _ = event_tx.send(Err(BackendError::StreamClosed)).await;
                        return;
                    }
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(event_rx)))
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<MessageSnapshot, BackendError> {
        let url = format!(
            "{}/session/{}/message/{}",
            self.base_url, session_id, message_id
        );
        self.request_json("get_message", || self.http.get(&url))
            .await
    }

    async fn respond_permission(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), BackendError> {
        let payload = json!({ "decision": decision.as_str() });
        let url = format!(
            "{}/session/{}/permission/{}",
            self.base_url, session_id, request_id
        );
        let _: serde_json::Value = self
            .request_json("respond_permission", || self.http.post(&url).json(&payload))
            .await?;
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<(), BackendError> {
        let url = format!("{}/session/{}/abort", self.base_url, session_id);
        let _: serde_json::Value = self.request_json("abort", || self.http.post(&url)).await?;
        Ok(())
    }
}
