//! Provider client: one Chat Completions call against one upstream.
//!
//! The same invoke path serves every provider; per-provider differences are
//! data (base URL, key, headers, timeout), not code. Gateway-only request
//! fields are stripped and `stream` is forced to match the call mode before
//! the payload crosses the wire.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::registry::ProviderDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} request failed: {message}")]
    Network { provider: String, message: String },

    #[error("{provider} timed out after {timeout:?}")]
    Timeout {
        provider: String,
        timeout: Duration,
    },
}

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Serialize the request for upstream: gateway extensions out, the
    /// native model in, `stream` pinned to the call mode.
    fn upstream_payload(
        request: &ChatCompletionRequest,
        native_model: &str,
        stream: bool,
    ) -> Value {
        let mut payload = serde_json::to_value(request).unwrap_or_else(|_| Value::Null);
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("provider");
            obj.remove("cache");
            obj.insert("model".to_string(), Value::String(native_model.to_string()));
            obj.insert("stream".to_string(), Value::Bool(stream));
        }
        payload
    }

    fn request_builder(
        &self,
        provider: &ProviderDescriptor,
        payload: &Value,
        streaming: bool,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", provider.base_url);
        let mut builder = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .bearer_auth(&provider.api_key)
            .json(payload);
        if streaming {
            builder = builder.header("accept", "text/event-stream");
        }
        for (key, value) in &provider.extra_headers {
            match (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(val)) => builder = builder.header(name, val),
                _ => warn!(provider = %provider.name, header = %key, "skipping invalid extra header"),
            }
        }
        builder
    }

    /// Unary call. The provider timeout covers the whole request including
    /// body download.
    pub async fn invoke(
        &self,
        provider: &ProviderDescriptor,
        request: &ChatCompletionRequest,
        native_model: &str,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let payload = Self::upstream_payload(request, native_model, false);
        let response = self
            .request_builder(provider, &payload, false)
            .timeout(provider.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: provider.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::Network {
                provider: provider.name.clone(),
                message: format!("invalid completion body: {e}"),
            }
        })?;
        parsed.provider = Some(provider.name.clone());
        Ok(parsed)
    }

    /// Streaming call. The provider timeout bounds the header phase; once
    /// the upstream has committed with a 200, the body streams for as long
    /// as it takes.
    pub async fn open_stream(
        &self,
        provider: &ProviderDescriptor,
        request: &ChatCompletionRequest,
        native_model: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let payload = Self::upstream_payload(request, native_model, true);
        let send = self.request_builder(provider, &payload, true).send();

        let response = tokio::time::timeout(provider.timeout, send)
            .await
            .map_err(|_| ProviderError::Timeout {
                provider: provider.name.clone(),
                timeout: provider.timeout,
            })?
            .map_err(|e| map_reqwest_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: provider.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// `GET {base_url}/models`, used by the provider health endpoint.
    pub async fn probe_models(
        &self,
        provider: &ProviderDescriptor,
    ) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", provider.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&provider.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| map_reqwest_error(provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: provider.name.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Network {
            provider: provider.name.clone(),
            message: format!("invalid model list: {e}"),
        })?;
        let models = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

fn map_reqwest_error(provider: &ProviderDescriptor, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: provider.name.clone(),
            timeout: provider.timeout,
        }
    } else {
        ProviderError::Network {
            provider: provider.name.clone(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// SSE chunk parsing
// ---------------------------------------------------------------------------

/// One parsed `text/event-stream` frame.
enum SseFrame {
    Chunk(ChatCompletionChunk),
    Done,
    /// Keepalive, comment, or malformed data; nothing to forward.
    Skip,
}

fn parse_sse_frame(frame: &[u8], provider: &str) -> SseFrame {
    let mut data_segments: Vec<&[u8]> = Vec::new();
    for line in frame.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line.starts_with(b":") {
            continue;
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let payload = trim_ascii(rest);
            if !payload.is_empty() {
                data_segments.push(payload);
            }
        }
        // `event:`/`id:` lines carry nothing for the chat protocol.
    }

    if data_segments.is_empty() {
        return SseFrame::Skip;
    }

    let payload = data_segments.join(&b'\n');
    if trim_ascii(&payload) == b"[DONE]" {
        return SseFrame::Done;
    }

    match serde_json::from_slice::<ChatCompletionChunk>(&payload) {
        Ok(chunk) => SseFrame::Chunk(chunk),
        Err(e) => {
            warn!(
                provider = %provider,
                error = %e,
                "skipping malformed stream chunk"
            );
            SseFrame::Skip
        }
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Adapts an upstream SSE byte stream into `ChatCompletionChunk`s.
///
/// Blank lines and `:` comments are skipped, `data: [DONE]` terminates, and
/// a malformed chunk is logged and dropped rather than killing the stream.
pub struct ChunkStream<S> {
    inner: S,
    provider: String,
    buffer: Vec<u8>,
    upstream_done: bool,
    finished: bool,
}

impl<S> ChunkStream<S> {
    pub fn new(inner: S, provider: impl Into<String>) -> Self {
        Self {
            inner,
            provider: provider.into(),
            buffer: Vec::new(),
            upstream_done: false,
            finished: false,
        }
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
        Some(frame)
    }
}

impl<S> Stream for ChunkStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<ChatCompletionChunk, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            while let Some(frame) = this.next_frame() {
                match parse_sse_frame(&frame, &this.provider) {
                    SseFrame::Chunk(chunk) => return Poll::Ready(Some(Ok(chunk))),
                    SseFrame::Done => {
                        this.finished = true;
                        return Poll::Ready(None);
                    }
                    SseFrame::Skip => continue,
                }
            }

            if this.upstream_done {
                // Trailing bytes without a frame terminator are parsed once.
                if !this.buffer.is_empty() {
                    let rest = std::mem::take(&mut this.buffer);
                    this.finished = true;
                    match parse_sse_frame(&rest, &this.provider) {
                        SseFrame::Chunk(chunk) => return Poll::Ready(Some(Ok(chunk))),
                        SseFrame::Done | SseFrame::Skip => return Poll::Ready(None),
                    }
                }
                this.finished = true;
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!(provider = %this.provider, error = %e, "upstream stream error");
                    this.finished = true;
                    return Poll::Ready(Some(Err(ProviderError::Network {
                        provider: this.provider.clone(),
                        message: e.to_string(),
                    })));
                }
                Poll::Ready(None) => {
                    this.upstream_done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
