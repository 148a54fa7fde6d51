//! Advisory classifier: task type, complexity, and capability tagging.
//!
//! Issues a single call to a designated fast LLM with a hard deadline. The
//! call is advisory only — a timeout, malformed JSON, or low confidence is
//! *not* an error; the classifier degrades to a deterministic heuristic
//! derived from the pre-analysis and the request keeps flowing. Its output
//! is never used to overrule the risk gate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::PreAnalysis;
use crate::metrics;
use crate::GatewayError;

/// Closed task-type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    CodeReview,
    TestGeneration,
    Debugging,
    ArchitectureDesign,
    Documentation,
    RequirementAnalysis,
    QuestionAnswer,
    DataAnalysis,
    MathReasoning,
    General,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeReview => "code_review",
            Self::TestGeneration => "test_generation",
            Self::Debugging => "debugging",
            Self::ArchitectureDesign => "architecture_design",
            Self::Documentation => "documentation",
            Self::RequirementAnalysis => "requirement_analysis",
            Self::QuestionAnswer => "question_answer",
            Self::DataAnalysis => "data_analysis",
            Self::MathReasoning => "math_reasoning",
            Self::General => "general",
        }
    }
}

/// Request complexity estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

/// Known departments; anything else maps to `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    Rd,
    Sales,
    Marketing,
    Hr,
    Finance,
    General,
}

impl Department {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rd => "rd",
            Self::Sales => "sales",
            Self::Marketing => "marketing",
            Self::Hr => "hr",
            Self::Finance => "finance",
            Self::General => "general",
        }
    }

    /// Lenient parse: unknown names fall back to `General`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "rd" | "r&d" | "engineering" => Self::Rd,
            "sales" => Self::Sales,
            "marketing" => Self::Marketing,
            "hr" => Self::Hr,
            "finance" => Self::Finance,
            _ => Self::General,
        }
    }
}

/// Which path produced the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedBy {
    AdvisoryLlm,
    HeuristicFallback,
}

impl ClassifiedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdvisoryLlm => "advisory_llm",
            Self::HeuristicFallback => "heuristic_fallback",
        }
    }
}

/// The classifier's verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub department: Department,
    /// Open capability vocabulary, e.g. `deep_reasoning`, `long_context`.
    pub required_capability: Vec<String>,
    /// In `[0.0, 1.0]`; the heuristic path always reports 0.5.
    pub confidence: f64,
    pub classified_by: ClassifiedBy,
    pub rationale: String,
}

/// Confidence below which the advisory result is discarded.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Hard deadline for the advisory call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const SYSTEM_PROMPT_VERSION: &str = "v3";

const SYSTEM_PROMPT: &str = r#"You classify LLM requests. Return ONLY a JSON object, no markdown fences:
{
  "task_type": "code_generation|code_review|test_generation|debugging|architecture_design|documentation|requirement_analysis|question_answer|data_analysis|math_reasoning|general",
  "complexity": "simple|medium|complex",
  "department": "rd|sales|marketing|hr|finance|general",
  "required_capability": ["..."],
  "confidence": 0.0,
  "rationale": "one sentence"
}"#;

/// Heuristic mapping from pre-analysis signals, used only on fallback.
///
/// | Signals | task_type | complexity |
/// |---|---|---|
/// | code keyword + short | code_generation | simple |
/// | code keyword + long | code_generation | complex |
/// | review + code | code_review | medium |
/// | debug / error / stack trace | debugging | medium |
/// | architecture / design / tradeoff | architecture_design | complex |
/// | test | test_generation | simple |
/// | math / algorithm | math_reasoning | complex |
/// | otherwise | general | medium |
pub fn heuristic_fallback(pre: &PreAnalysis) -> Classification {
    let has = |kw: &str| pre.detected_keywords.iter().any(|k| k == kw);

    let (task_type, complexity) = if has("review") && (pre.has_code_blocks || has("code")) {
        (TaskType::CodeReview, Complexity::Medium)
    } else if has("debug") || has("error") || has("stack trace") || has("traceback") {
        (TaskType::Debugging, Complexity::Medium)
    } else if has("architecture") || has("design") || has("tradeoff") || has("trade-off") {
        (TaskType::ArchitectureDesign, Complexity::Complex)
    } else if has("test") || has("tests") {
        (TaskType::TestGeneration, Complexity::Simple)
    } else if has("math") || has("algorithm") || has("proof") {
        (TaskType::MathReasoning, Complexity::Complex)
    } else if pre.heuristic_task_type == Some(TaskType::CodeGeneration) || has("code") {
        if pre.estimated_tokens > 800 {
            (TaskType::CodeGeneration, Complexity::Complex)
        } else {
            (TaskType::CodeGeneration, Complexity::Simple)
        }
    } else if let (Some(t), Some(c)) = (pre.heuristic_task_type, pre.heuristic_complexity) {
        (t, c)
    } else {
        (TaskType::General, Complexity::Medium)
    };

    Classification {
        task_type,
        complexity,
        department: pre
            .department_hint
            .as_deref()
            .map(Department::parse)
            .unwrap_or(Department::General),
        required_capability: Vec::new(),
        confidence: 0.5,
        classified_by: ClassifiedBy::HeuristicFallback,
        rationale: "heuristic fallback from pre-analysis signals".to_string(),
    }
}

#[derive(Debug, Serialize)]
struct AdvisoryRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    system: &'a str,
    messages: Vec<AdvisoryMessage>,
}

#[derive(Debug, Serialize)]
struct AdvisoryMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AdvisoryResponse {
    content: Vec<AdvisoryContent>,
}

#[derive(Debug, Deserialize)]
struct AdvisoryContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    task_type: TaskType,
    complexity: Complexity,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    required_capability: Vec<String>,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

/// Advisory LLM classifier with heuristic degradation.
pub struct Classifier {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    confidence_threshold: f64,
}

impl Classifier {
    /// Create a classifier. A `None` api key disables the advisory call
    /// entirely — every request takes the heuristic path.
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout: DEFAULT_TIMEOUT,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    /// Override the API base URL (compatible endpoints, mock servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the hard deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the confidence threshold.
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Classify the request. Never errors: every failure mode degrades to
    /// [`heuristic_fallback`].
    pub async fn classify(&self, pre: &PreAnalysis, excerpt: &str) -> Classification {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!("classifier skipped: no credential configured");
            metrics::record_classifier("skipped");
            return heuristic_fallback(pre);
        };

        match tokio::time::timeout(self.timeout, self.call(api_key, pre, excerpt)).await {
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "classifier timeout");
                metrics::record_classifier("timeout");
                heuristic_fallback(pre)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "classifier call failed");
                metrics::record_classifier("schema_error");
                heuristic_fallback(pre)
            }
            Ok(Ok(raw)) => {
                if raw.confidence < self.confidence_threshold {
                    warn!(
                        confidence = raw.confidence,
                        threshold = self.confidence_threshold,
                        "classifier low confidence"
                    );
                    metrics::record_classifier("low_confidence");
                    return heuristic_fallback(pre);
                }
                metrics::record_classifier("success");
                let department = raw
                    .department
                    .as_deref()
                    .map(Department::parse)
                    .or_else(|| pre.department_hint.as_deref().map(Department::parse))
                    .unwrap_or(Department::General);
                debug!(
                    task_type = raw.task_type.as_str(),
                    complexity = raw.complexity.as_str(),
                    confidence = raw.confidence,
                    "classifier verdict"
                );
                Classification {
                    task_type: raw.task_type,
                    complexity: raw.complexity,
                    department,
                    required_capability: raw.required_capability,
                    confidence: raw.confidence.clamp(0.0, 1.0),
                    classified_by: ClassifiedBy::AdvisoryLlm,
                    rationale: raw.rationale,
                }
            }
        }
    }

    async fn call(
        &self,
        api_key: &str,
        pre: &PreAnalysis,
        excerpt: &str,
    ) -> Result<RawClassification, GatewayError> {
        let user_message = format!(
            "Classify this request.\n\
             Estimated tokens: {}\nHas code blocks: {}\nLanguages: {:?}\n\
             Keywords: {:?}\nDepartment hint: {}\nTurns: {}\n\n\
             Excerpt (first 1000 chars):\n{}",
            pre.estimated_tokens,
            pre.has_code_blocks,
            pre.detected_languages,
            pre.detected_keywords,
            pre.department_hint.as_deref().unwrap_or("none"),
            pre.conversation_turns,
            excerpt.chars().take(1000).collect::<String>(),
        );

        let body = AdvisoryRequest {
            model: &self.model,
            max_tokens: 512,
            temperature: 0.1,
            system: SYSTEM_PROMPT,
            messages: vec![AdvisoryMessage {
                role: "user",
                content: user_message,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("x-prompt-version", SYSTEM_PROMPT_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Internal(format!("classifier request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Internal(format!(
                "classifier status {}",
                response.status()
            )));
        }

        let parsed: AdvisoryResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Internal(format!("classifier response malformed: {e}")))?;

        let text = parsed
            .content
            .first()
            .and_then(|c| c.text.as_deref())
            .ok_or_else(|| GatewayError::Internal("classifier response empty".to_string()))?;

        let json = strip_fences(text);
        serde_json::from_str(json)
            .map_err(|e| GatewayError::Internal(format!("classification schema mismatch: {e}")))
    }
}

/// Remove markdown code fences some models wrap JSON in.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.trim_end_matches('`').trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pre_with(keywords: &[&str], tokens: u32) -> PreAnalysis {
        PreAnalysis {
            estimated_tokens: tokens,
            detected_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            ..PreAnalysis::default()
        }
    }

    fn advisory_body(json: &str) -> serde_json::Value {
        serde_json::json!({ "content": [{ "type": "text", "text": json }] })
    }

    const GOOD_JSON: &str = r#"{"task_type":"code_generation","complexity":"simple","department":"rd","required_capability":["low_latency"],"confidence":0.92,"rationale":"short codegen ask"}"#;

    // ── Heuristic fallback table ──────────────────────────────────────────

    #[test]
    fn test_heuristic_code_keyword_short_is_simple_codegen() {
        let c = heuristic_fallback(&pre_with(&["code", "write"], 150));
        assert_eq!(c.task_type, TaskType::CodeGeneration);
        assert_eq!(c.complexity, Complexity::Simple);
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
        assert!((c.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_heuristic_code_keyword_long_is_complex_codegen() {
        let c = heuristic_fallback(&pre_with(&["code"], 2500));
        assert_eq!(c.task_type, TaskType::CodeGeneration);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn test_heuristic_review_plus_code_is_code_review() {
        let mut pre = pre_with(&["review", "code"], 400);
        pre.has_code_blocks = true;
        let c = heuristic_fallback(&pre);
        assert_eq!(c.task_type, TaskType::CodeReview);
        assert_eq!(c.complexity, Complexity::Medium);
    }

    #[test]
    fn test_heuristic_debug_is_debugging_medium() {
        let c = heuristic_fallback(&pre_with(&["debug"], 300));
        assert_eq!(c.task_type, TaskType::Debugging);
        assert_eq!(c.complexity, Complexity::Medium);
    }

    #[test]
    fn test_heuristic_architecture_is_complex() {
        let c = heuristic_fallback(&pre_with(&["architecture"], 300));
        assert_eq!(c.task_type, TaskType::ArchitectureDesign);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn test_heuristic_test_is_test_generation_simple() {
        let c = heuristic_fallback(&pre_with(&["test"], 300));
        assert_eq!(c.task_type, TaskType::TestGeneration);
        assert_eq!(c.complexity, Complexity::Simple);
    }

    #[test]
    fn test_heuristic_math_is_math_reasoning_complex() {
        let c = heuristic_fallback(&pre_with(&["algorithm"], 300));
        assert_eq!(c.task_type, TaskType::MathReasoning);
        assert_eq!(c.complexity, Complexity::Complex);
    }

    #[test]
    fn test_heuristic_no_signals_is_general_medium() {
        let c = heuristic_fallback(&PreAnalysis::default());
        assert_eq!(c.task_type, TaskType::General);
        assert_eq!(c.complexity, Complexity::Medium);
    }

    #[test]
    fn test_heuristic_department_from_hint() {
        let mut pre = PreAnalysis::default();
        pre.department_hint = Some("finance".into());
        assert_eq!(heuristic_fallback(&pre).department, Department::Finance);
    }

    // ── Advisory path ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_classify_success_uses_advisory_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(advisory_body(GOOD_JSON)))
            .mount(&server)
            .await;

        let classifier =
            Classifier::new(Some("test-key".into()), "fast-model").with_base_url(server.uri());
        let c = classifier.classify(&PreAnalysis::default(), "write hello world").await;
        assert_eq!(c.classified_by, ClassifiedBy::AdvisoryLlm);
        assert_eq!(c.task_type, TaskType::CodeGeneration);
        assert_eq!(c.department, Department::Rd);
        assert_eq!(c.required_capability, vec!["low_latency".to_string()]);
    }

    #[tokio::test]
    async fn test_classify_low_confidence_falls_back() {
        let low = r#"{"task_type":"general","complexity":"medium","confidence":0.4}"#;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(advisory_body(low)))
            .mount(&server)
            .await;

        let classifier =
            Classifier::new(Some("test-key".into()), "fast-model").with_base_url(server.uri());
        let c = classifier.classify(&pre_with(&["debug"], 100), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
        assert_eq!(c.task_type, TaskType::Debugging);
        assert!((c.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_classify_non_json_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(advisory_body("not json at all")),
            )
            .mount(&server)
            .await;

        let classifier =
            Classifier::new(Some("test-key".into()), "fast-model").with_base_url(server.uri());
        let c = classifier.classify(&PreAnalysis::default(), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
    }

    #[tokio::test]
    async fn test_classify_timeout_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(advisory_body(GOOD_JSON))
                    .set_delay(Duration::from_millis(400)),
            )
            .mount(&server)
            .await;

        let classifier = Classifier::new(Some("test-key".into()), "fast-model")
            .with_base_url(server.uri())
            .with_timeout(Duration::from_millis(50));
        let c = classifier.classify(&PreAnalysis::default(), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
    }

    #[tokio::test]
    async fn test_classify_http_error_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let classifier =
            Classifier::new(Some("test-key".into()), "fast-model").with_base_url(server.uri());
        let c = classifier.classify(&PreAnalysis::default(), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
    }

    #[tokio::test]
    async fn test_classify_without_credential_skips_network() {
        // No mock server: a network attempt would error loudly.
        let classifier = Classifier::new(None, "fast-model");
        let c = classifier.classify(&pre_with(&["test"], 100), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::HeuristicFallback);
        assert_eq!(c.task_type, TaskType::TestGeneration);
    }

    #[tokio::test]
    async fn test_classify_strips_markdown_fences() {
        let fenced = format!("```json\n{GOOD_JSON}\n```");
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(advisory_body(&fenced)))
            .mount(&server)
            .await;

        let classifier =
            Classifier::new(Some("test-key".into()), "fast-model").with_base_url(server.uri());
        let c = classifier.classify(&PreAnalysis::default(), "x").await;
        assert_eq!(c.classified_by, ClassifiedBy::AdvisoryLlm);
    }

    #[test]
    fn test_department_parse_lenient() {
        assert_eq!(Department::parse("RD"), Department::Rd);
        assert_eq!(Department::parse("engineering"), Department::Rd);
        assert_eq!(Department::parse("warehouse"), Department::General);
    }

    #[test]
    fn test_strip_fences_variants() {
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
