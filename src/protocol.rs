//! OpenAI-compatible wire types and the normalized streaming event model.
//!
//! All vendor wire formats (event-stream JSON deltas, JSON-per-line long
//! polls) are translated into [`StreamEvent`] so the executor and the SSE
//! serializer stay provider-agnostic.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel model name that requests routed model selection.
pub const AUTO_MODEL: &str = "auto";

/// One part of a multi-part message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<HashMap<String, String>>,
}

/// Message content: plain string or structured parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessageContentPart>),
}

/// A single chat message in the OpenAI shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

impl ChatMessage {
    /// Convenience constructor for plain-text messages.
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(MessageContent::Text(content.into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Flatten the message body to plain text, ignoring non-text parts.
    pub fn text_content(&self) -> String {
        match &self.content {
            Some(MessageContent::Text(s)) => s.clone(),
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join(" "),
            None => String::new(),
        }
    }
}

/// Identity triple resolved from request headers by the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestIdentity {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub department: Option<String>,
}

impl RequestIdentity {
    pub fn tenant(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("unknown")
    }

    pub fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or("unknown")
    }
}

/// Inbound chat-completion request in the OpenAI shape.
///
/// `model` may be the `auto` sentinel, which requests full routed selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Identity resolved from extension headers; never part of the JSON body.
    #[serde(skip)]
    pub identity: RequestIdentity,
    /// Optional idempotency key echoed into the decision record.
    #[serde(skip)]
    pub idempotency_key: Option<String>,
}

fn default_model() -> String {
    AUTO_MODEL.to_string()
}

impl ChatCompletionRequest {
    /// Concatenated text of every user message, used by analysis stages.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == "user")
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Concatenated text of every message regardless of role.
    pub fn full_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Token accounting in the OpenAI shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl UsageInfo {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Assistant message or delta within a choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<serde_json::Value>>,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChoice {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<MessageDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Buffered chat-completion response in the OpenAI shape.
///
/// `x_routing_decision` is the gateway extension carrying the full routing
/// decision; it is injected by the server for non-streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x_routing_decision: Option<serde_json::Value>,
}

impl ChatCompletionResponse {
    /// Assemble a buffered response from accumulated text and usage.
    pub fn assembled(
        id: impl Into<String>,
        model: impl Into<String>,
        content: String,
        finish_reason: String,
        usage: Option<UsageInfo>,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Some(MessageDelta {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                    tool_calls: None,
                }),
                delta: None,
                finish_reason: Some(finish_reason),
            }],
            usage,
            x_routing_decision: None,
        }
    }
}

/// Normalized streaming event.
///
/// Every provider stream — SSE JSON deltas of different shapes or
/// JSON-per-line long polls — is reduced to this enumeration before it
/// reaches the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The assistant role announcement, emitted at most once per stream.
    RoleDelta(String),
    /// A chunk of generated text.
    TextDelta(String),
    /// An incremental tool-call payload, passed through untouched.
    ToolCallDelta(serde_json::Value),
    /// Terminal finish reason (`stop`, `length`, `tool_calls`, …).
    FinishReason(String),
    /// Token usage, typically arriving at stream end.
    Usage(UsageInfo),
}

/// Serialize a [`StreamEvent`] into an OpenAI `chat.completion.chunk` body.
pub fn chunk_for_event(
    event: &StreamEvent,
    chunk_id: &str,
    model: &str,
    created: i64,
) -> serde_json::Value {
    let (delta, finish_reason, usage) = match event {
        StreamEvent::RoleDelta(role) => (serde_json::json!({ "role": role }), None, None),
        StreamEvent::TextDelta(text) => (serde_json::json!({ "content": text }), None, None),
        StreamEvent::ToolCallDelta(tc) => (serde_json::json!({ "tool_calls": [tc] }), None, None),
        StreamEvent::FinishReason(r) => (serde_json::json!({}), Some(r.clone()), None),
        StreamEvent::Usage(u) => (serde_json::json!({}), None, Some(u.clone())),
    };
    let mut body = serde_json::json!({
        "id": chunk_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{ "index": 0, "delta": delta, "finish_reason": finish_reason }],
    });
    if let Some(u) = usage {
        body["usage"] = serde_json::to_value(u).unwrap_or(serde_json::Value::Null);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: AUTO_MODEL.into(),
            messages,
            stream: false,
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

    #[test]
    fn test_text_content_plain_string() {
        let m = ChatMessage::text("user", "hello");
        assert_eq!(m.text_content(), "hello");
    }

    #[test]
    fn test_text_content_multipart_joins_text_parts() {
        let m = ChatMessage {
            role: "user".into(),
            content: Some(MessageContent::Parts(vec![
                MessageContentPart {
                    kind: "text".into(),
                    text: Some("first".into()),
                    image_url: None,
                },
                MessageContentPart {
                    kind: "image_url".into(),
                    text: None,
                    image_url: None,
                },
                MessageContentPart {
                    kind: "text".into(),
                    text: Some("second".into()),
                    image_url: None,
                },
            ])),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(m.text_content(), "first second");
    }

    #[test]
    fn test_user_text_skips_non_user_roles() {
        let req = request_with(vec![
            ChatMessage::text("system", "you are helpful"),
            ChatMessage::text("user", "question one"),
            ChatMessage::text("assistant", "answer"),
            ChatMessage::text("user", "question two"),
        ]);
        assert_eq!(req.user_text(), "question one question two");
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#)
                .expect("test: parse minimal request");
        assert_eq!(req.model, AUTO_MODEL);
        assert!(!req.stream);
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn test_chunk_for_text_delta_has_openai_shape() {
        let chunk = chunk_for_event(
            &StreamEvent::TextDelta("hi".into()),
            "mg-abc",
            "llama3.1:8b",
            1_700_000_000,
        );
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
        assert!(chunk["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn test_chunk_for_finish_reason_sets_field() {
        let chunk = chunk_for_event(
            &StreamEvent::FinishReason("stop".into()),
            "mg-abc",
            "m",
            0,
        );
        assert_eq!(chunk["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_usage_new_totals() {
        let u = UsageInfo::new(10, 5);
        assert_eq!(u.total_tokens, 15);
    }
}
