//! # modelgate
//!
//! A policy-driven routing proxy for OpenAI-compatible LLM requests.
//!
//! ## Architecture
//!
//! Five-stage decision pipeline executed per request:
//! ```text
//! Request → PreAnalyzer → RiskAnalyzer → Classifier → PolicyEngine → Executor
//! ```
//!
//! Every stage enriches a routing context; the committed decision is written
//! to an append-only audit sink whether the provider call succeeds or not.

use thiserror::Error;

pub mod analysis;
pub mod audit;
pub mod budget;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod protocol;
pub mod providers;
pub mod server;

// Re-exports
pub use engine::{RoutingEngine, RoutingOutcome};
pub use protocol::{ChatCompletionRequest, ChatCompletionResponse, StreamEvent};

/// Gateway-wide error taxonomy.
///
/// Every client-visible error maps to a stable machine-readable code and an
/// HTTP status; see [`server`] for the mapping.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The risk gate stripped every candidate model. Rendered as HTTP 451.
    #[error("governance blocked: {rationale}")]
    GovernanceBlocked {
        /// Human-readable explanation quoting the risk rationale.
        rationale: String,
        /// Models that were considered before being stripped.
        models_tried: Vec<String>,
    },

    /// Every model in the fallback chain failed. Rendered as HTTP 502.
    #[error("all providers failed: tried {}", models_tried.join(", "))]
    AllProvidersFailed {
        models_tried: Vec<String>,
        last_error: String,
    },

    /// A single provider attempt failed.
    #[error("provider '{provider}' error (status {status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
        /// Whether the executor may advance to the next fallback.
        transient: bool,
    },

    /// The caller disconnected while a provider call was in flight.
    #[error("client cancelled request")]
    ClientCancelled,

    /// Policy files could not be loaded or validated.
    #[error("policy load failed: {0}")]
    PolicyLoad(String),

    /// Startup configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for internal invariant breaks.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code carried on every client-visible error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GovernanceBlocked { .. } => "governance_blocked",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::Provider { .. } => "provider_error",
            Self::ClientCancelled => "client_cancelled",
            Self::PolicyLoad(_) => "policy_load_failed",
            Self::Config(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// True when the executor is allowed to advance to the next fallback.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }
}

/// Unique request identifier, stable across fallback attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a fresh id with the `mg-` prefix.
    pub fn generate() -> Self {
        Self(format!("mg-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Initialise tracing with env-filter support. Call once at binary startup.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_generate_has_prefix_and_length() {
        let id = RequestId::generate();
        assert!(id.as_str().starts_with("mg-"));
        assert_eq!(id.as_str().len(), 15);
    }

    #[test]
    fn test_request_id_generate_is_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_error_codes_are_stable() {
        let e = GatewayError::GovernanceBlocked {
            rationale: "x".into(),
            models_tried: vec![],
        };
        assert_eq!(e.code(), "governance_blocked");
        assert_eq!(GatewayError::ClientCancelled.code(), "client_cancelled");
    }

    #[test]
    fn test_transient_flag_only_on_transient_provider_errors() {
        let transient = GatewayError::Provider {
            provider: "ollama".into(),
            status: 503,
            message: "overloaded".into(),
            transient: true,
        };
        let permanent = GatewayError::Provider {
            provider: "anthropic".into(),
            status: 400,
            message: "bad request".into(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
        assert!(!GatewayError::ClientCancelled.is_transient());
    }
}
