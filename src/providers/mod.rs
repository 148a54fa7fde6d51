//! Provider abstraction: uniform call interface over heterogeneous vendors.
//!
//! Each adapter translates the internal normalized chat format to its
//! vendor's wire format and reduces the response — SSE JSON deltas or
//! JSON-per-line long polls alike — to the shared [`StreamEvent`] sequence,
//! so everything downstream is provider-agnostic.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::catalog::ProviderClass;
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse, StreamEvent};
use crate::GatewayError;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod registry;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;

/// A provider's normalized output stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>;

/// Observed health of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Failing,
}

/// Static metadata declared per provider binding.
#[derive(Debug, Clone)]
pub struct ProviderBinding {
    pub name: String,
    /// Data-residency class consumed by the risk gate.
    pub class: ProviderClass,
    /// Per-provider concurrent-call ceiling.
    pub max_concurrent: usize,
    /// Per-call timeout ceiling; the effective timeout is the lower of this
    /// and the policy-declared timeout.
    pub timeout: Duration,
}

impl ProviderBinding {
    pub fn new(name: impl Into<String>, class: ProviderClass) -> Self {
        Self {
            name: name.into(),
            class,
            max_concurrent: 32,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Uniform call interface implemented by every vendor adapter.
///
/// Implementations must be thread-safe; they are shared across request
/// tasks behind `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Buffered chat completion.
    async fn chat(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, GatewayError>;

    /// Streaming chat completion, normalized to [`StreamEvent`]s.
    async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<EventStream, GatewayError>;

    /// Cheap reachability probe used by the background pinger.
    async fn health_check(&self) -> bool;
}

/// Status codes the executor may retry via the fallback chain.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// Classify a provider failure and build the gateway error for it.
///
/// Status 0 marks transport-level failures (connect, TLS, timeout), which
/// are always transient.
pub fn provider_error(provider: &str, status: u16, message: impl Into<String>) -> GatewayError {
    GatewayError::Provider {
        provider: provider.to_string(),
        status,
        message: message.into(),
        transient: status == 0 || RETRYABLE_STATUSES.contains(&status),
    }
}

/// Incremental parser for `text/event-stream` payloads.
///
/// Feeds on raw byte chunks and yields complete `data:` payloads; handles
/// frames split across chunk boundaries and ignores comments and `event:`
/// lines (the adapters dispatch on the JSON body instead).
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk; returns every complete data payload it unlocked.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if !data_lines.is_empty() {
                payloads.push(data_lines.join("\n"));
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_single_frame() {
        let mut p = SseParser::new();
        let out = p.push("data: {\"a\":1}\n\n");
        assert_eq!(out, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_sse_parser_frame_split_across_chunks() {
        let mut p = SseParser::new();
        assert!(p.push("data: {\"a\"").is_empty());
        let out = p.push(":1}\n\n");
        assert_eq!(out, vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_sse_parser_multiple_frames_one_chunk() {
        let mut p = SseParser::new();
        let out = p.push("data: one\n\ndata: two\n\n");
        assert_eq!(out, vec!["one", "two"]);
    }

    #[test]
    fn test_sse_parser_ignores_event_lines_and_comments() {
        let mut p = SseParser::new();
        let out = p.push("event: message_start\n: keepalive\ndata: body\n\n");
        assert_eq!(out, vec!["body"]);
    }

    #[test]
    fn test_sse_parser_done_sentinel_passes_through() {
        let mut p = SseParser::new();
        let out = p.push("data: [DONE]\n\n");
        assert_eq!(out, vec!["[DONE]"]);
    }

    #[test]
    fn test_transient_classification() {
        assert!(provider_error("p", 503, "x").is_transient());
        assert!(provider_error("p", 429, "x").is_transient());
        assert!(provider_error("p", 0, "connect refused").is_transient());
        assert!(!provider_error("p", 400, "x").is_transient());
        assert!(!provider_error("p", 404, "x").is_transient());
    }
}
