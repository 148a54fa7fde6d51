//! Ollama adapter for self-hosted open-weight models.
//!
//! Ollama streams newline-delimited JSON objects rather than SSE frames;
//! the adapter reduces both modes to the shared [`StreamEvent`] sequence.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::{provider_error, EventStream, Provider};
use crate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, StreamEvent, UsageInfo,
};
use crate::GatewayError;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    message: Option<WireResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: String,
}

/// Adapter for a local or fleet Ollama server.
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(300),
        }
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
        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(WireOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };
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
            stream,
            options,
        }
    }

    async fn send(&self, body: &WireRequest<'_>) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| provider_error("ollama", 0, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(provider_error("ollama", status.as_u16(), text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
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
            .map_err(|e| provider_error("ollama", 0, format!("malformed response: {e}")))?;

        let content = wire.message.map(|m| m.content).unwrap_or_default();
        let usage = Some(UsageInfo::new(
            wire.prompt_eval_count.unwrap_or(0),
            wire.eval_count.unwrap_or(0),
        ));
        Ok(ChatCompletionResponse::assembled(
            format!("ollama-{}", uuid::Uuid::new_v4().simple()),
            model,
            content,
            wire.done_reason.unwrap_or_else(|| "stop".to_string()),
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
            let mut buffer = String::new();
            let mut role_sent = false;

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(provider_error("ollama", 0, e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..pos + 1).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(wire) = serde_json::from_str::<WireResponse>(line) else {
                        continue;
                    };
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
                    if let Some(msg) = &wire.message {
                        if !msg.content.is_empty()
                            && tx
                                .send(Ok(StreamEvent::TextDelta(msg.content.clone())))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                    if wire.done {
                        let _ = tx
                            .send(Ok(StreamEvent::FinishReason(
                                wire.done_reason.clone().unwrap_or_else(|| "stop".into()),
                            )))
                            .await;
                        let _ = tx
                            .send(Ok(StreamEvent::Usage(UsageInfo::new(
                                wire.prompt_eval_count.unwrap_or(0),
                                wire.eval_count.unwrap_or(0),
                            ))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(rx))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, RequestIdentity};
    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(text: &str, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "auto".into(),
            messages: vec![ChatMessage::text("user", text)],
            stream,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            user: None,
            identity: RequestIdentity::default(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_chat_success_includes_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "local answer"},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 7,
                "eval_count": 3
            })))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(server.uri());
        let resp = provider.chat(&request("hi", false), "llama3.1:8b").await.expect("test: chat");
        let msg = resp.choices[0].message.as_ref().expect("test: message");
        assert_eq!(msg.content.as_deref(), Some("local answer"));
        assert_eq!(resp.usage.as_ref().expect("test: usage").total_tokens, 10);
    }

    #[tokio::test]
    async fn test_stream_parses_json_per_line() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"a\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"b\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":5,\"eval_count\":2}\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(server.uri());
        let stream = provider.chat_stream(&request("hi", true), "m").await.expect("test: stream");
        let events: Vec<StreamEvent> = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|e| e.expect("test: ok"))
            .collect();

        assert_eq!(events[0], StreamEvent::RoleDelta("assistant".into()));
        assert_eq!(events[1], StreamEvent::TextDelta("a".into()));
        assert_eq!(events[2], StreamEvent::TextDelta("b".into()));
        assert!(events.contains(&StreamEvent::FinishReason("stop".into())));
        assert!(events.contains(&StreamEvent::Usage(UsageInfo::new(5, 2))));
    }

    #[tokio::test]
    async fn test_500_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(server.uri());
        let err = provider.chat(&request("hi", false), "m").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_health_check_uses_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"models": []})))
            .mount(&server)
            .await;

        let provider = OllamaProvider::new(server.uri());
        assert!(provider.health_check().await);
    }
}
