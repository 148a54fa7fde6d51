//! Anthropic messages-API adapter.
//!
//! Translates the normalized chat format to the messages wire shape and
//! reduces the vendor's typed SSE events (`message_start`,
//! `content_block_delta`, `message_delta`, `message_stop`) to the uniform
//! [`StreamEvent`] sequence.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{provider_error, EventStream, Provider, SseParser};
use crate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, StreamEvent, UsageInfo,
};
use crate::GatewayError;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    content: Vec<WireContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// One SSE event body, dispatched on `type`.
#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<WireStreamMessage>,
    #[serde(default)]
    delta: Option<WireStreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Adapter for Anthropic-compatible message endpoints.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Override the API base URL (compatible endpoints, mock servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn split_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut wire = Vec::new();
        for msg in messages {
            match msg.role.as_str() {
                "system" => system = Some(msg.text_content()),
                "user" | "assistant" => wire.push(WireMessage {
                    role: msg.role.clone(),
                    content: msg.text_content(),
                }),
                _ => {}
            }
        }
        (system, wire)
    }

    fn build_body<'a>(
        &self,
        request: &'a ChatCompletionRequest,
        model: &'a str,
        stream: bool,
    ) -> WireRequest<'a> {
        let (system, messages) = Self::split_messages(&request.messages);
        WireRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(4096),
            messages,
            system,
            temperature: request.temperature,
            tools: request.tools.clone(),
            stream,
        }
    }

    async fn send(
        &self,
        body: &WireRequest<'_>,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| provider_error("anthropic", 0, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(provider_error("anthropic", status.as_u16(), text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        let body = self.build_body(request, model, false);
        let response = self.send(&body).await?;

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| provider_error("anthropic", 0, format!("malformed response: {e}")))?;

        let content = wire
            .content
            .first()
            .and_then(|c| c.text.clone())
            .unwrap_or_default();
        let usage = wire
            .usage
            .map(|u| UsageInfo::new(u.input_tokens, u.output_tokens));

        debug!(model, id = %wire.id, "anthropic completion");
        Ok(ChatCompletionResponse::assembled(
            wire.id,
            model,
            content,
            wire.stop_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
        ))
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<EventStream, GatewayError> {
        let body = self.build_body(request, model, true);
        let response = self.send(&body).await?;

        let (mut tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut prompt_tokens = 0u32;
            let mut role_sent = false;

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(provider_error("anthropic", 0, e.to_string())))
                            .await;
                        return;
                    }
                };
                for payload in parser.push(&String::from_utf8_lossy(&chunk)) {
                    let Ok(event) = serde_json::from_str::<WireStreamEvent>(&payload) else {
                        continue;
                    };
                    match event.kind.as_str() {
                        "message_start" => {
                            prompt_tokens = event
                                .message
                                .and_then(|m| m.usage)
                                .map(|u| u.input_tokens)
                                .unwrap_or(0);
                            if !role_sent {
                                role_sent = true;
                                if tx
                                    .send(Ok(StreamEvent::RoleDelta("assistant".into())))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                        "content_block_delta" => {
                            if let Some(text) = event.delta.and_then(|d| d.text) {
                                if tx.send(Ok(StreamEvent::TextDelta(text))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        "message_delta" => {
                            if let Some(reason) =
                                event.delta.as_ref().and_then(|d| d.stop_reason.clone())
                            {
                                let _ = tx.send(Ok(StreamEvent::FinishReason(reason))).await;
                            }
                            if let Some(u) = event.usage {
                                let _ = tx
                                    .send(Ok(StreamEvent::Usage(UsageInfo::new(
                                        prompt_tokens,
                                        u.output_tokens,
                                    ))))
                                    .await;
                            }
                        }
                        "message_stop" => return,
                        _ => {}
                    }
                }
            }
        });

        Ok(Box::pin(rx))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
