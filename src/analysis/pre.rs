//! Pre-analysis: cheap deterministic feature extraction.
//!
//! Runs first in the pipeline and never fails — malformed messages degrade
//! to empty features plus a `parse_warnings` entry. Everything here is an
//! O(n) scan over the request text; the stage carries no timeout because the
//! work is CPU-bounded.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classifier::{Complexity, TaskType};
use crate::protocol::ChatCompletionRequest;

/// Keyword vocabulary per task type, matched whole-word and case-insensitive.
///
/// Single words are matched against the tokenized text; multi-word phrases
/// are matched by substring on the lowercased text.
const TASK_KEYWORDS: &[(TaskType, &[&str])] = &[
    (
        TaskType::CodeGeneration,
        &[
            "write", "implement", "create", "build", "generate", "code", "function", "class",
            "module", "script", "program",
        ],
    ),
    (
        TaskType::CodeReview,
        &["review", "audit", "critique", "feedback", "improve", "issues", "suggestions"],
    ),
    (
        TaskType::TestGeneration,
        &[
            "test", "tests", "unit test", "integration test", "test case", "test suite",
            "coverage", "e2e", "automated test",
        ],
    ),
    (
        TaskType::Debugging,
        &[
            "debug", "bug", "error", "exception", "traceback", "stack trace", "fix", "broken",
            "failing", "crash", "not working", "unexpected",
        ],
    ),
    (
        TaskType::ArchitectureDesign,
        &[
            "architecture", "design", "system design", "trade-off", "tradeoff", "scalability",
            "microservice", "diagram", "component", "pattern", "schema",
        ],
    ),
    (
        TaskType::Documentation,
        &["document", "documentation", "readme", "docstring", "explain", "describe", "summarize"],
    ),
    (
        TaskType::RequirementAnalysis,
        &["requirement", "requirements", "specification", "user story", "acceptance criteria", "feasibility", "scope"],
    ),
    (
        TaskType::DataAnalysis,
        &["analyze", "analysis", "dataset", "statistics", "metrics", "csv", "sql", "query", "logs", "report"],
    ),
    (
        TaskType::MathReasoning,
        &[
            "math", "algorithm", "complexity", "proof", "equation", "optimize", "big o",
            "dynamic programming", "graph", "sorting",
        ],
    ),
    (
        TaskType::QuestionAnswer,
        &["what is", "how does", "explain", "tell me", "can you"],
    ),
];

const COMPLEXITY_HIGH_SIGNALS: &[&str] = &[
    "complex", "advanced", "production", "scale", "distributed", "multi", "architecture",
    "system design", "novel", "algorithm", "optimize", "performance", "security", "enterprise",
];

const COMPLEXITY_LOW_SIGNALS: &[&str] = &[
    "simple", "basic", "quick", "small", "beginner", "starter", "boilerplate", "template",
    "hello world", "example",
];

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\w+-]*\n[\s\S]+?```").expect("static code-block pattern"));

static LANG_HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(python|javascript|typescript|go|rust|java|cpp|c\+\+|ruby|php|swift|kotlin|bash|sql)")
        .expect("static language-hint pattern")
});

/// Derived, immutable request features.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreAnalysis {
    /// BPE-compatible token estimate (length/4 heuristic, ±10%).
    pub estimated_tokens: u32,
    pub has_code_blocks: bool,
    /// Language hints from fenced code blocks, deduplicated.
    pub detected_languages: Vec<String>,
    /// Matched keyword tags, capped at 10, in vocabulary order.
    pub detected_keywords: Vec<String>,
    pub department_hint: Option<String>,
    /// Count of user + assistant messages.
    pub conversation_turns: u32,
    pub heuristic_task_type: Option<TaskType>,
    pub heuristic_complexity: Option<Complexity>,
    /// Non-fatal oddities found while reading the messages.
    pub parse_warnings: Vec<String>,
}

/// Estimate token count from character length.
///
/// A length/4 approximation tracks cl100k-family tokenizers within the
/// accepted ±10% for mixed prose and code.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

fn matches_keyword(keyword: &str, lower_text: &str, words: &[&str]) -> bool {
    if keyword.contains(' ') || keyword.contains('-') {
        lower_text.contains(keyword)
    } else {
        words.contains(&keyword)
    }
}

/// Analyze a request. Pure, deterministic, never fails.
pub fn analyze(request: &ChatCompletionRequest) -> PreAnalysis {
    let mut warnings = Vec::new();

    let raw_text = request.full_text();
    let lower_text = raw_text.to_lowercase();
    let words: Vec<&str> = lower_text
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '+')
        .filter(|w| !w.is_empty())
        .collect();

    for (i, msg) in request.messages.iter().enumerate() {
        if !matches!(msg.role.as_str(), "system" | "user" | "assistant" | "tool") {
            warnings.push(format!("message {i}: unknown role '{}'", msg.role));
        }
        if msg.content.is_none() && msg.tool_calls.is_none() {
            warnings.push(format!("message {i}: empty content"));
        }
    }

    let estimated_tokens = estimate_tokens(&raw_text);

    let has_code_blocks = CODE_BLOCK_RE.is_match(&raw_text);
    let mut detected_languages: Vec<String> = Vec::new();
    for cap in LANG_HINT_RE.captures_iter(&lower_text) {
        let lang = cap[1].to_string();
        if !detected_languages.contains(&lang) {
            detected_languages.push(lang);
        }
    }

    // Keyword scan, scored per task type; highest score wins the hint.
    let mut detected_keywords: Vec<String> = Vec::new();
    let mut best: Option<(TaskType, usize)> = None;
    for (task, keywords) in TASK_KEYWORDS {
        let mut score = 0usize;
        for kw in *keywords {
            if matches_keyword(kw, &lower_text, &words) {
                score += 1;
                if detected_keywords.len() < 10 && !detected_keywords.contains(&kw.to_string()) {
                    detected_keywords.push(kw.to_string());
                }
            }
        }
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((*task, score));
        }
    }
    let heuristic_task_type = best.map(|(t, _)| t);

    let department_hint = request.identity.department.clone().or_else(|| {
        let code_hints = ["code", "debug", "architecture", "test", "deploy"];
        if code_hints.iter().any(|h| words.contains(h)) {
            Some("rd".to_string())
        } else {
            None
        }
    });

    let high_signals = COMPLEXITY_HIGH_SIGNALS
        .iter()
        .filter(|s| matches_keyword(s, &lower_text, &words))
        .count();
    let low_signals = COMPLEXITY_LOW_SIGNALS
        .iter()
        .filter(|s| matches_keyword(s, &lower_text, &words))
        .count();

    let heuristic_complexity = Some(if estimated_tokens > 3000 || high_signals >= 2 {
        Complexity::Complex
    } else if estimated_tokens > 800 || high_signals >= 1 {
        Complexity::Medium
    } else if low_signals >= 1 || estimated_tokens < 200 {
        Complexity::Simple
    } else {
        Complexity::Medium
    });

    let conversation_turns = request
        .messages
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .count() as u32;

    PreAnalysis {
        estimated_tokens,
        has_code_blocks,
        detected_languages,
        detected_keywords,
        department_hint,
        conversation_turns,
        heuristic_task_type,
        heuristic_complexity,
        parse_warnings: warnings,
    }
}
