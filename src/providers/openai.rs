//! OpenAI chat-completions adapter.
//!
//! Also serves any OpenAI-compatible endpoint (vLLM, local proxies) — pass
//! a different base URL and, for keyless servers, an empty credential.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::{provider_error, EventStream, Provider, SseParser};
use crate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, StreamEvent, UsageInfo,
};
use crate::GatewayError;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
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
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireChoiceMessage>,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Adapter for OpenAI-compatible chat endpoints.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    name: String,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            name: "openai".to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Override the API base URL (vLLM, Azure, mock servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Re-label the adapter, e.g. `vllm` for a self-hosted endpoint.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_body<'a>(
        &self,
        request: &'a ChatCompletionRequest,
        model: &'a str,
        stream: bool,
    ) -> WireRequest<'a> {
        WireRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.clone(),
                    content: m.text_content(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request.tools.clone(),
            stream,
        }
    }

    async fn send(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, GatewayError> {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .json(body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| provider_error(&self.name, 0, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(provider_error(&self.name, status.as_u16(), text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
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
            .map_err(|e| provider_error(&self.name, 0, format!("malformed response: {e}")))?;

        let choice = wire
            .choices
            .first()
            .ok_or_else(|| provider_error(&self.name, 0, "no choices in response"))?;
        let content = choice
            .message
            .as_ref()
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        let finish = choice.finish_reason.clone().unwrap_or_else(|| "stop".into());
        let usage = wire
            .usage
            .map(|u| UsageInfo::new(u.prompt_tokens, u.completion_tokens));

        Ok(ChatCompletionResponse::assembled(wire.id, model, content, finish, usage))
    }

    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<EventStream, GatewayError> {
        let body = self.build_body(request, model, true);
        let response = self.send(&body).await?;
        let name = self.name.clone();

        let (mut tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(provider_error(&name, 0, e.to_string()))).await;
                        return;
                    }
                };
                for payload in parser.push(&String::from_utf8_lossy(&chunk)) {
                    if payload == "[DONE]" {
                        return;
                    }
                    let Ok(wire) = serde_json::from_str::<WireResponse>(&payload) else {
                        continue;
                    };
                    if let Some(u) = wire.usage {
                        let _ = tx
                            .send(Ok(StreamEvent::Usage(UsageInfo::new(
                                u.prompt_tokens,
                                u.completion_tokens,
                            ))))
                            .await;
                    }
                    let Some(choice) = wire.choices.first() else {
                        continue;
                    };
                    if let Some(delta) = &choice.delta {
                        if let Some(role) = &delta.role {
                            if tx.send(Ok(StreamEvent::RoleDelta(role.clone()))).await.is_err() {
                                return;
                            }
                        }
                        if let Some(text) = &delta.content {
                            if tx.send(Ok(StreamEvent::TextDelta(text.clone()))).await.is_err() {
                                return;
                            }
                        }
                        if let Some(tcs) = &delta.tool_calls {
                            for tc in tcs {
                                let _ = tx.send(Ok(StreamEvent::ToolCallDelta(tc.clone()))).await;
                            }
                        }
                    }
                    if let Some(reason) = &choice.finish_reason {
                        let _ = tx.send(Ok(StreamEvent::FinishReason(reason.clone()))).await;
                    }
                }
            }
        });

        Ok(Box::pin(rx))
    }

    async fn health_check(&self) -> bool {
        let mut builder = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(3));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        builder
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
