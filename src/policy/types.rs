//! Policy data model: rules, budget thresholds, and the decision trace.

use serde::{Deserialize, Serialize};

use crate::analysis::RiskLevel;
use crate::catalog::ModelTier;
use crate::classifier::{Complexity, Department, TaskType};

/// Predicate bundle for one rule. Unspecified fields are wildcards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Rule applies only when the assessed risk is at or below this level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_max: Option<RiskLevel>,
    /// Rule applies only when the request requires all listed capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities_required: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<Department>,
}

/// What a matched rule selects.
///
/// Exactly one of `virtual_model` / `primary_model` must be set; the loader
/// enforces this.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuleAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_models: Vec<String>,
    pub model_tier: ModelTier,
    #[serde(default)]
    pub rationale: String,
}

/// One ordered routing rule. First match wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRule {
    pub name: String,
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    pub action: RuleAction,
}

/// Budget thresholds for a department.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetControls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit_usd_per_user: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit_usd_per_tenant: Option<f64>,
    /// Demote the selection by one tier at this utilization percentage.
    #[serde(default = "default_downgrade_pct")]
    pub downgrade_at_pct: f64,
    /// Replace the selection with the cheap base fallback at this percentage.
    #[serde(default = "default_force_cheap_pct")]
    pub force_cheap_at_pct: f64,
    /// Static tier ceiling regardless of utilization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tier: Option<ModelTier>,
}

fn default_downgrade_pct() -> f64 {
    80.0
}

fn default_force_cheap_pct() -> f64 {
    100.0
}

impl Default for BudgetControls {
    fn default() -> Self {
        Self {
            daily_limit_usd_per_user: None,
            daily_limit_usd_per_tenant: None,
            downgrade_at_pct: default_downgrade_pct(),
            force_cheap_at_pct: default_force_cheap_pct(),
            max_tier: None,
        }
    }
}

/// A department's ordered rule set plus budget thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepartmentPolicy {
    /// Optional tenant scope; `None` means the policy applies to all tenants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub department: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub budget: BudgetControls,
    /// Used when no rule matches, and as the budget force-cheap target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fallback: Option<RuleAction>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Outcome of considering one rule (or one gate) during a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceResult {
    Matched,
    Skipped,
    NotEvaluated,
    RiskOverride,
    BudgetOverride,
    CapabilityUnmet,
    FallbackFiltered,
}

/// One entry of the policy trace. The trace is a faithful record: exactly
/// one entry is `matched`, all rules before it are `skipped` with a reason,
/// all rules after it are `not_evaluated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyTraceEntry {
    pub rule: String,
    pub result: TraceResult,
    pub reason: String,
}

impl PolicyTraceEntry {
    pub fn new(rule: impl Into<String>, result: TraceResult, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            result,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_yaml_round_trip() {
        let yaml = r#"
name: simple_codegen
match:
  task_type: code_generation
  complexity: simple
action:
  virtual_model: "rb://fast_cheap_code"
  model_tier: fast_cheap
  rationale: cheap pool for simple codegen
"#;
        let rule: PolicyRule = serde_yaml::from_str(yaml).expect("test: parse rule");
        assert_eq!(rule.name, "simple_codegen");
        assert_eq!(rule.matcher.task_type, Some(TaskType::CodeGeneration));
        assert_eq!(rule.action.model_tier, ModelTier::FastCheap);

        let back = serde_yaml::to_string(&rule).expect("test: serialize rule");
        let reparsed: PolicyRule = serde_yaml::from_str(&back).expect("test: reparse rule");
        assert_eq!(rule, reparsed);
    }

    #[test]
    fn test_unspecified_match_fields_deserialize_as_wildcards() {
        let rule: PolicyRule = serde_yaml::from_str(
            "name: catch_all\naction:\n  primary_model: m\n  model_tier: balanced\n",
        )
        .expect("test: parse rule");
        assert_eq!(rule.matcher, RuleMatch::default());
    }

    #[test]
    fn test_budget_controls_defaults() {
        let b: BudgetControls = serde_yaml::from_str("{}").expect("test: parse empty budget");
        assert!((b.downgrade_at_pct - 80.0).abs() < f64::EPSILON);
        assert!((b.force_cheap_at_pct - 100.0).abs() < f64::EPSILON);
        assert!(b.max_tier.is_none());
    }

    #[test]
    fn test_trace_result_serializes_snake_case() {
        let json = serde_json::to_string(&TraceResult::CapabilityUnmet).expect("test: serialize");
        assert_eq!(json, "\"capability_unmet\"");
    }
}
