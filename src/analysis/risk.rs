//! Risk analysis: deterministic sensitivity classification.
//!
//! Runs before the classifier; its level is authoritative and propagates
//! unchanged through the rest of the pipeline. Risk constrains which
//! provider *classes* are allowed, never which model tier is picked.
//!
//! Signal families are evaluated in order regulated → high → medium; the
//! first family with a match fixes the level, so a match can only ever
//! elevate. The gate itself is a set filter applied later by the policy
//! engine: it removes candidates, it never picks a model.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::protocol::ChatCompletionRequest;

/// Sensitivity level, ordered `low < medium < high < regulated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Regulated,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Regulated => "regulated",
        }
    }
}

/// One triggered signal: the family category and the term that matched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskSignal {
    /// Family-scoped category, e.g. `regulated.pii_phi`.
    pub category: String,
    /// The matched text, truncated for the audit record.
    pub matched: String,
}

/// The risk gate's verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub signals: Vec<RiskSignal>,
    /// When true no direct-commercial provider may serve this request.
    pub direct_commercial_forbidden: bool,
    pub audit_required: bool,
    /// Quotes at most one matched signal verbatim (truncated).
    pub rationale: String,
    /// Operator-facing note on where this content is allowed to travel.
    pub data_residency_note: String,
}

impl RiskAssessment {
    fn low() -> Self {
        Self {
            level: RiskLevel::Low,
            signals: Vec::new(),
            direct_commercial_forbidden: false,
            audit_required: false,
            rationale: "no sensitive signals detected".to_string(),
            data_residency_note: String::new(),
        }
    }
}

struct SignalFamily {
    category: &'static str,
    patterns: Vec<Regex>,
}

fn compile(category: &'static str, patterns: &[&str]) -> SignalFamily {
    SignalFamily {
        category,
        patterns: patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}")).expect("static risk pattern must compile")
            })
            .collect(),
    }
}

// Regulated: PII/PHI and financial/legal regulation. Forbids direct
// commercial providers and forces the audit flag.
static REGULATED_FAMILIES: LazyLock<Vec<SignalFamily>> = LazyLock::new(|| {
    vec![
        compile(
            "regulated.pii_phi",
            &[
                r"\b\d{3}-\d{2}-\d{4}\b",
                r"\bssn\b",
                r"\bsocial security\b",
                r"\bdate of birth\b",
                r"\bmedical record\b",
                r"\bpatient\b",
                r"\bdiagnos\w+\b",
                r"\bprescription\b",
                r"\bhipaa\b",
                r"\bphi\b",
                r"\bpii\b",
                r"\behr\b",
            ],
        ),
        compile(
            "regulated.financial",
            &[
                r"\bsox\b",
                r"\bsarbanes\b",
                r"\bpci[- ]?dss\b",
                r"\bglba\b",
                r"\baml\b",
                r"\bkyc\b",
                r"\bfinra\b",
                r"\bsec filing\b",
                r"\bregulatory filing\b",
            ],
        ),
        compile(
            "regulated.privacy",
            &[r"\bgdpr\b", r"\bccpa\b", r"\bdata protection\b", r"\bcompliance report\b"],
        ),
    ]
});

// High: legal/contract, exec/financial-sensitive, credentials. Forbids
// direct commercial providers.
static HIGH_FAMILIES: LazyLock<Vec<SignalFamily>> = LazyLock::new(|| {
    vec![
        compile(
            "high.legal_contract",
            &[
                r"\bnda\b",
                r"\bnon[- ]?disclosure\b",
                r"\bindemnif\w+\b",
                r"\bliabilit\w+\b",
                r"\blitigation\b",
                r"\bsettlement\b",
                r"\barbitration\b",
                r"\bintellectual property\b",
            ],
        ),
        compile(
            "high.financial_sensitive",
            &[
                r"\bm&a\b",
                r"\bacquisition\b",
                r"\bmerger\b",
                r"\bvaluation\b",
                r"\bterm sheet\b",
                r"\bcap table\b",
                r"\bsalary\b",
                r"\bpayroll\b",
            ],
        ),
        compile(
            "high.executive",
            &[
                r"\bboard of directors\b",
                r"\bc-suite\b",
                r"\bconfidential\b",
                r"\btrade secret\b",
                r"\bproprietary\b",
            ],
        ),
        compile(
            "high.credentials",
            &[
                r"\bpassword\b",
                r"\bcredential\b",
                r"\bapi[- ]?key\b",
                r"\bprivate[- ]?key\b",
                r"\baccess[- ]?token\b",
            ],
        ),
    ]
});

// Medium: business-sensitive, no hard regulatory requirement. Direct
// commercial stays allowed (but logged).
static MEDIUM_FAMILIES: LazyLock<Vec<SignalFamily>> = LazyLock::new(|| {
    vec![
        compile(
            "medium.customer_data",
            &[r"\bcustomer\b", r"\buser data\b", r"\bemail address\b", r"\bphone number\b", r"\bsubscriber\b"],
        ),
        compile(
            "medium.business",
            &[
                r"\bforecast\b",
                r"\brevenue\b",
                r"\bchurn\b",
                r"\bkpi\b",
                r"\binternal pricing\b",
                r"\bperformance review\b",
                r"\bhiring\b",
            ],
        ),
        compile(
            "medium.external_comms",
            &[r"\bproposal\b", r"\bpitch\b", r"\bclient\b", r"\bprospect\b", r"\bpress release\b"],
        ),
    ]
});

const RATIONALE_QUOTE_MAX: usize = 40;

fn scan(text: &str, families: &[SignalFamily]) -> Vec<RiskSignal> {
    let mut signals = Vec::new();
    for family in families {
        for pattern in &family.patterns {
            if let Some(m) = pattern.find(text) {
                let mut matched = m.as_str().to_string();
                matched.truncate(RATIONALE_QUOTE_MAX);
                signals.push(RiskSignal {
                    category: family.category.to_string(),
                    matched,
                });
                // One signal per family keeps the audit record compact.
                break;
            }
        }
    }
    signals
}

fn rationale_for(label: &str, signals: &[RiskSignal]) -> String {
    match signals.first() {
        Some(s) => format!("{label} content detected (matched \"{}\")", s.matched),
        None => format!("{label} content detected"),
    }
}

/// Assess the request's sensitivity. Pure and side-effect free.
pub fn assess(request: &ChatCompletionRequest) -> RiskAssessment {
    let text = request.full_text();

    let regulated = scan(&text, &REGULATED_FAMILIES);
    let high = scan(&text, &HIGH_FAMILIES);
    let medium = scan(&text, &MEDIUM_FAMILIES);

    let mut all = Vec::new();
    all.extend(regulated.iter().cloned());
    all.extend(high.iter().cloned());
    all.extend(medium.iter().cloned());

    if !regulated.is_empty() {
        return RiskAssessment {
            level: RiskLevel::Regulated,
            rationale: rationale_for("regulated", &regulated),
            signals: all,
            direct_commercial_forbidden: true,
            audit_required: true,
            data_residency_note: "direct commercial providers forbidden; \
                self-hosted or compliant-cloud (BAA/DPA) only"
                .to_string(),
        };
    }

    if !high.is_empty() {
        return RiskAssessment {
            level: RiskLevel::High,
            rationale: rationale_for("high-risk", &high),
            signals: all,
            direct_commercial_forbidden: true,
            audit_required: true,
            data_residency_note: "sensitive business content; direct commercial providers \
                forbidden, use self-hosted or compliant cloud"
                .to_string(),
        };
    }

    if !medium.is_empty() {
        return RiskAssessment {
            level: RiskLevel::Medium,
            rationale: rationale_for("business-sensitive", &medium),
            signals: all,
            direct_commercial_forbidden: false,
            audit_required: false,
            data_residency_note: "commercial providers allowed; usage is logged".to_string(),
        };
    }

    RiskAssessment::low()
}
