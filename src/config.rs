//! Environment-driven gateway settings.
//!
//! Provider credentials and file paths come from `MG_*` environment
//! variables; everything structural (policies, catalog) lives in YAML files
//! those paths point at. Startup validation failures exit with code 2,
//! policy load failures with 64.

use std::path::PathBuf;
use std::time::Duration;

use crate::GatewayError;

/// Exit code for configuration errors at startup.
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Exit code for a failed (retryable) policy load.
pub const EXIT_POLICY_LOAD_FAILED: i32 = 64;

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,

    // Provider credentials and endpoints
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub ollama_base_url: String,
    pub vllm_base_url: Option<String>,

    // Advisory classifier
    pub classifier_model: String,
    pub classifier_timeout: Duration,
    pub classifier_confidence_threshold: f64,

    // File-driven configuration
    pub catalog_path: PathBuf,
    pub policies_dir: PathBuf,
    pub audit_log_path: PathBuf,

    // Routing knobs
    pub long_context_tokens: u32,
    pub emergency_default_model: Option<String>,
    pub max_concurrent_requests: usize,
    pub health_ping_interval: Duration,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, GatewayError> {
    match env(name) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| GatewayError::Config(format!("{name} has invalid value '{v}'"))),
    }
}

impl Settings {
    /// Read settings from the environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        Ok(Self {
            host: env("MG_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: env_parse("MG_PORT", 8080)?,
            anthropic_api_key: env("ANTHROPIC_API_KEY"),
            openai_api_key: env("OPENAI_API_KEY"),
            ollama_base_url: env("MG_OLLAMA_URL").unwrap_or_else(|| "http://localhost:11434".into()),
            vllm_base_url: env("MG_VLLM_URL"),
            classifier_model: env("MG_CLASSIFIER_MODEL")
                .unwrap_or_else(|| "claude-haiku-4-5-20251001".into()),
            classifier_timeout: Duration::from_secs(env_parse("MG_CLASSIFIER_TIMEOUT_SECS", 3)?),
            classifier_confidence_threshold: env_parse("MG_CLASSIFIER_CONFIDENCE", 0.6)?,
            catalog_path: PathBuf::from(
                env("MG_CATALOG_PATH").unwrap_or_else(|| "config/models.yaml".into()),
            ),
            policies_dir: PathBuf::from(
                env("MG_POLICIES_DIR").unwrap_or_else(|| "config/policies".into()),
            ),
            audit_log_path: PathBuf::from(
                env("MG_AUDIT_LOG").unwrap_or_else(|| "logs/audit.jsonl".into()),
            ),
            long_context_tokens: env_parse("MG_LONG_CONTEXT_TOKENS", 8000)?,
            emergency_default_model: env("MG_EMERGENCY_DEFAULT_MODEL"),
            max_concurrent_requests: env_parse("MG_MAX_CONCURRENT_REQUESTS", 512)?,
            health_ping_interval: Duration::from_secs(env_parse("MG_HEALTH_PING_SECS", 30)?),
        })
    }

    /// Semantic validation beyond parsing.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !(0.0..=1.0).contains(&self.classifier_confidence_threshold) {
            return Err(GatewayError::Config(
                "MG_CLASSIFIER_CONFIDENCE must be within [0.0, 1.0]".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(GatewayError::Config(
                "MG_MAX_CONCURRENT_REQUESTS must be positive".into(),
            ));
        }
        if !self.catalog_path.exists() {
            return Err(GatewayError::Config(format!(
                "catalog file {} does not exist",
                self.catalog_path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let catalog = dir.path().join("models.yaml");
        std::fs::write(&catalog, "models: []\n").expect("test: write");

        let mut settings = Settings {
            host: "127.0.0.1".into(),
            port: 0,
            anthropic_api_key: None,
            openai_api_key: None,
            ollama_base_url: "http://localhost:11434".into(),
            vllm_base_url: None,
            classifier_model: "m".into(),
            classifier_timeout: Duration::from_secs(3),
            classifier_confidence_threshold: 1.4,
            catalog_path: catalog,
            policies_dir: dir.path().to_path_buf(),
            audit_log_path: dir.path().join("audit.jsonl"),
            long_context_tokens: 8000,
            emergency_default_model: None,
            max_concurrent_requests: 16,
            health_ping_interval: Duration::from_secs(30),
        };
        assert!(settings.validate().is_err());

        settings.classifier_confidence_threshold = 0.6;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_catalog() {
        let settings = Settings {
            host: "127.0.0.1".into(),
            port: 0,
            anthropic_api_key: None,
            openai_api_key: None,
            ollama_base_url: String::new(),
            vllm_base_url: None,
            classifier_model: "m".into(),
            classifier_timeout: Duration::from_secs(3),
            classifier_confidence_threshold: 0.6,
            catalog_path: PathBuf::from("/nonexistent/models.yaml"),
            policies_dir: PathBuf::from("/nonexistent"),
            audit_log_path: PathBuf::from("/tmp/audit.jsonl"),
            long_context_tokens: 8000,
            emergency_default_model: None,
            max_concurrent_requests: 16,
            health_ping_interval: Duration::from_secs(30),
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }
}
