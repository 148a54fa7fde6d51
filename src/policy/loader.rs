//! Policy file loading.
//!
//! Reads YAML policy files from a directory, parses them into
//! [`DepartmentPolicy`] values, and validates semantic constraints before
//! anything reaches the live store. I/O, parse, and validation failures are
//! distinguished so startup can exit with the right code.

use std::path::Path;

use tracing::{info, warn};

use super::types::{DepartmentPolicy, PolicyRule};
use crate::GatewayError;

/// File stem that marks the tenant-wide base policy.
pub const BASE_POLICY_STEM: &str = "base";

/// Parse and validate a single policy from YAML text.
pub fn load_from_str(content: &str, source_name: &str) -> Result<DepartmentPolicy, GatewayError> {
    let policy: DepartmentPolicy = serde_yaml::from_str(content)
        .map_err(|e| GatewayError::PolicyLoad(format!("{source_name}: parse error: {e}")))?;
    validate(&policy).map_err(|e| GatewayError::PolicyLoad(format!("{source_name}: {e}")))?;
    Ok(policy)
}

/// Load and validate a single policy file.
pub fn load_from_file(path: &Path) -> Result<DepartmentPolicy, GatewayError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::PolicyLoad(format!("{}: {e}", path.display())))?;
    load_from_str(&content, &path.display().to_string())
}

/// Load every `*.yaml` file in a directory.
///
/// Returns the loaded policies along with whether each came from the base
/// file. A single malformed file fails the whole load — partial policy sets
/// must never go live.
pub fn load_dir(dir: &Path) -> Result<Vec<(DepartmentPolicy, bool)>, GatewayError> {
    if !dir.is_dir() {
        return Err(GatewayError::PolicyLoad(format!(
            "policy directory {} does not exist",
            dir.display()
        )));
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| GatewayError::PolicyLoad(format!("{}: {e}", dir.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "yaml" || x == "yml").unwrap_or(false))
        .collect();
    entries.sort();

    let mut loaded = Vec::new();
    for path in entries {
        let policy = load_from_file(&path)?;
        let is_base = path
            .file_stem()
            .map(|s| s == BASE_POLICY_STEM)
            .unwrap_or(false);
        info!(
            file = %path.display(),
            department = %policy.department,
            version = %policy.version,
            rules = policy.rules.len(),
            "policy loaded"
        );
        loaded.push((policy, is_base));
    }

    if loaded.is_empty() {
        warn!(dir = %dir.display(), "no policy files found");
    }
    Ok(loaded)
}

/// Serialize a policy back to YAML. Round-trips structurally.
pub fn to_yaml(policy: &DepartmentPolicy) -> Result<String, GatewayError> {
    serde_yaml::to_string(policy)
        .map_err(|e| GatewayError::Internal(format!("policy serialize error: {e}")))
}

fn validate(policy: &DepartmentPolicy) -> Result<(), String> {
    if policy.department.trim().is_empty() {
        return Err("department must not be empty".to_string());
    }
    if policy.budget.downgrade_at_pct < 0.0 || policy.budget.force_cheap_at_pct < 0.0 {
        return Err("budget thresholds must be non-negative".to_string());
    }
    if policy.budget.downgrade_at_pct > policy.budget.force_cheap_at_pct {
        return Err(format!(
            "downgrade_at_pct ({}) must not exceed force_cheap_at_pct ({})",
            policy.budget.downgrade_at_pct, policy.budget.force_cheap_at_pct
        ));
    }

    let mut names = std::collections::HashSet::new();
    for rule in &policy.rules {
        validate_rule(rule)?;
        if !names.insert(rule.name.as_str()) {
            return Err(format!("duplicate rule name '{}'", rule.name));
        }
    }

    if let Some(fb) = &policy.base_fallback {
        if fb.virtual_model.is_none() && fb.primary_model.is_none() {
            return Err("base_fallback must name a virtual_model or primary_model".to_string());
        }
    }
    Ok(())
}

fn validate_rule(rule: &PolicyRule) -> Result<(), String> {
    if rule.name.trim().is_empty() {
        return Err("rule name must not be empty".to_string());
    }
    match (&rule.action.virtual_model, &rule.action.primary_model) {
        (None, None) => Err(format!(
            "rule '{}' must name a virtual_model or primary_model",
            rule.name
        )),
        (Some(_), Some(_)) => Err(format!(
            "rule '{}' must not name both virtual_model and primary_model",
            rule.name
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelTier;

    pub(crate) const RD_POLICY_YAML: &str = r#"
department: rd
version: "2.1"
description: engineering routing
rules:
  - name: simple_codegen
    match:
      task_type: code_generation
      complexity: simple
    action:
      virtual_model: "rb://fast_cheap_code"
      model_tier: fast_cheap
      rationale: cheap pool for simple codegen
  - name: deep_design
    match:
      task_type: architecture_design
    action:
      virtual_model: "rb://balanced_reasoning"
      model_tier: balanced
      rationale: design work needs reasoning depth
budget:
  daily_limit_usd_per_tenant: 100.0
  downgrade_at_pct: 80
  force_cheap_at_pct: 95
base_fallback:
  primary_model: haiku-fast
  fallback_models: ["llama3.1:8b"]
  model_tier: fast_cheap
  rationale: department default
"#;

    #[test]
    fn test_load_valid_policy() {
        let p = load_from_str(RD_POLICY_YAML, "rd.yaml").expect("test: valid policy");
        assert_eq!(p.department, "rd");
        assert_eq!(p.version, "2.1");
        assert_eq!(p.rules.len(), 2);
        assert!(p.base_fallback.is_some());
        assert!((p.budget.force_cheap_at_pct - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_yaml_is_policy_load_error() {
        let err = load_from_str("rules: [[[", "bad.yaml").unwrap_err();
        assert_eq!(err.code(), "policy_load_failed");
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_rule_without_model_rejected() {
        let yaml = r#"
department: rd
rules:
  - name: broken
    action:
      model_tier: balanced
"#;
        let err = load_from_str(yaml, "x.yaml").unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_rule_with_both_models_rejected() {
        let yaml = r#"
department: rd
rules:
  - name: double
    action:
      virtual_model: "rb://a"
      primary_model: b
      model_tier: balanced
"#;
        assert!(load_from_str(yaml, "x.yaml").is_err());
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let yaml = r#"
department: rd
rules:
  - name: same
    action:
      primary_model: a
      model_tier: local
  - name: same
    action:
      primary_model: b
      model_tier: local
"#;
        assert!(load_from_str(yaml, "x.yaml").is_err());
    }

    #[test]
    fn test_inverted_budget_thresholds_rejected() {
        let yaml = r#"
department: rd
budget:
  downgrade_at_pct: 95
  force_cheap_at_pct: 80
"#;
        assert!(load_from_str(yaml, "x.yaml").is_err());
    }

    #[test]
    fn test_yaml_round_trip_structural_equality() {
        let p = load_from_str(RD_POLICY_YAML, "rd.yaml").expect("test: valid policy");
        let yaml = to_yaml(&p).expect("test: serialize");
        let back = load_from_str(&yaml, "round.yaml").expect("test: reparse");
        assert_eq!(p, back);
    }

    #[test]
    fn test_load_dir_reads_all_files_and_marks_base() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        std::fs::write(dir.path().join("rd.yaml"), RD_POLICY_YAML).expect("test: write");
        std::fs::write(
            dir.path().join("base.yaml"),
            "department: general\nbase_fallback:\n  primary_model: haiku-fast\n  model_tier: fast_cheap\n",
        )
        .expect("test: write");

        let loaded = load_dir(dir.path()).expect("test: load dir");
        assert_eq!(loaded.len(), 2);
        let base_count = loaded.iter().filter(|(_, is_base)| *is_base).count();
        assert_eq!(base_count, 1);
    }

    #[test]
    fn test_load_dir_one_bad_file_fails_whole_load() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        std::fs::write(dir.path().join("rd.yaml"), RD_POLICY_YAML).expect("test: write");
        std::fs::write(dir.path().join("zz.yaml"), "department: ''\n").expect("test: write");
        assert!(load_dir(dir.path()).is_err());
    }

    #[test]
    fn test_missing_dir_is_policy_load_error() {
        let err = load_dir(Path::new("/nonexistent/policies")).unwrap_err();
        assert_eq!(err.code(), "policy_load_failed");
    }

    #[test]
    fn test_tier_parses_snake_case() {
        let p = load_from_str(RD_POLICY_YAML, "rd.yaml").expect("test: valid policy");
        assert_eq!(p.rules[0].action.model_tier, ModelTier::FastCheap);
    }
}
