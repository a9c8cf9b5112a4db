//! HTTP transport to an OpenAI-compatible chat completions endpoint.

mod wire;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::chat::create_sse_stream;
use crate::config::ProviderConfig;
use crate::error::ProviderError;

pub use wire::{
    build_wire_messages, ChatCompletionRequest, ChatCompletionResponse, FunctionFragment,
    ResponseChoice, ResponseMessage, StreamChoice, StreamDelta, StreamResponse, ToolCallFragment,
    WireContent, WireMessage, WirePart,
};

const DONE_EVENT: &str = "[DONE]";

/// Decoded streaming frames of one completion.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, ProviderError>> + Send>>;

/// Outbound seam of the request loop and the moderator.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Single JSON round-trip.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError>;

    /// Streaming round-trip; the stream ends after the terminator frame.
    async fn stream(&self, request: &ChatCompletionRequest) -> Result<FrameStream, ProviderError>;
}

/// `reqwest` implementation of [`ChatTransport`].
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    timeout_seconds: Option<u64>,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &ProviderConfig) -> Self {
        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            client,
            base_url,
            api_key: config.resolve_api_key().map(SecretString::new),
            timeout_seconds: config.timeout_seconds,
        }
    }

    pub fn completions_url(&self) -> String {
        format!("{}chat/completions", self.base_url)
    }

    fn apply_timeout(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.timeout_seconds {
            Some(timeout) => request.timeout(Duration::from_secs(timeout)),
            None => request,
        }
    }

    fn log_request_payload<T: Serialize>(&self, label: &str, body: &T) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        if let Ok(json) = serde_json::to_string(body) {
            log::trace!("{label}: {json}");
        }
    }

    fn build_request(&self, body: &ChatCompletionRequest) -> reqwest::RequestBuilder {
        let mut request = self.client.post(self.completions_url()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        request
    }

    async fn ensure_success_response(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        log::debug!("{context} HTTP status: {}", response.status());
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Status { status, body })
    }
}

#[async_trait]
impl ChatTransport for ProviderClient {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        self.log_request_payload("chat completion request", request);
        let response = self
            .apply_timeout(self.build_request(request))
            .send()
            .await?;
        let response = self
            .ensure_success_response(response, "chat completion")
            .await?;
        let resp_text = response.text().await?;
        serde_json::from_str(&resp_text).map_err(|e| ProviderError::ResponseFormatError {
            message: format!("Failed to decode chat completion response: {e}"),
            raw_response: resp_text,
        })
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<FrameStream, ProviderError> {
        self.log_request_payload("chat stream request", request);
        // No read timeout: a stream may legitimately stay open for minutes.
        let response = self.build_request(request).send().await?;
        let response = self.ensure_success_response(response, "chat stream").await?;
        Ok(frame_stream(response))
    }
}

pub(crate) fn frame_stream(response: reqwest::Response) -> FrameStream {
    let frames = create_sse_stream(response, parse_stream_frame)
        .take_while(|frame| futures::future::ready(!matches!(frame, Ok(None))))
        .filter_map(|frame| futures::future::ready(frame.transpose()));
    Box::pin(frames)
}

/// Decode one SSE event.
///
/// Returns `Ok(Some(None))` for the terminator so the caller can stop
/// reading, and `Ok(None)` for events without a data payload.
fn parse_stream_frame(event: &str) -> Result<Option<Option<StreamResponse>>, ProviderError> {
    let Some(payload) = extract_payload(event) else {
        return Ok(None);
    };
    if payload == DONE_EVENT {
        return Ok(Some(None));
    }
    let frame = serde_json::from_str(&payload).map_err(|e| ProviderError::ResponseFormatError {
        message: format!("Failed to decode stream frame: {e}"),
        raw_response: payload.clone(),
    })?;
    Ok(Some(Some(frame)))
}

/// Data lines of one event, joined with `\n`.
fn extract_payload(event: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in event.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.trim() == DONE_EVENT {
            return Some(DONE_EVENT.to_string());
        }
        lines.push(data);
    }
    let payload = lines.join("\n");
    if payload.trim().is_empty() {
        None
    } else {
        Some(payload)
    }
}

#[cfg(test)]
mod tests;
