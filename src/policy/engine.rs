//! The policy decision engine.
//!
//! Fuses classification, risk, pre-analysis, and budget into one concrete
//! route. Ordering is load-bearing and must not be rearranged:
//!
//! 1. ordered first-match rule scan (department rules, then base fallback)
//! 2. virtual-model resolution + capability filter
//! 3. risk gate — a set filter that strips candidates, never picks one
//! 4. budget guardrails — may downgrade tier, never upgrade, never
//!    override the risk gate
//! 5. health filter over the fallback chain only
//!
//! Every rule considered leaves a trace entry; callers and the simulate
//! endpoint rely on the trace being a faithful record.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::{
    DepartmentPolicy, PolicyTraceEntry, RuleAction, RuleMatch, TraceResult,
};
use crate::analysis::{PreAnalysis, RiskAssessment};
use crate::catalog::{ModelCatalog, ModelTier};
use crate::classifier::Classification;
use crate::providers::ProviderHealth;

/// Budget utilization as seen at decision time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetReading {
    /// Current-period utilization percentage.
    Known(f64),
    /// The counter store did not answer in time; downgrade is not applied.
    Unknown,
}

/// One concrete candidate surviving resolution.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    model_id: String,
    provider: String,
    tier: ModelTier,
}

/// The committed selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedRoute {
    pub primary_model: String,
    pub provider: String,
    pub tier: ModelTier,
    /// Deduplicated; never contains the primary.
    pub fallback_models: Vec<String>,
    pub rule_matched: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_model_id: Option<String>,
    pub policy_version: String,
    pub trace: Vec<PolicyTraceEntry>,
    pub constraints_applied: Vec<String>,
}

/// Terminal non-selection outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockedRoute {
    pub rationale: String,
    pub models_tried: Vec<String>,
    pub policy_version: String,
    pub trace: Vec<PolicyTraceEntry>,
    pub constraints_applied: Vec<String>,
}

/// Result of one decision pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    Selected(SelectedRoute),
    /// The risk gate stripped every candidate.
    Blocked(BlockedRoute),
    /// No rule, no base fallback, no emergency default.
    NoRuleMatched {
        policy_version: String,
        trace: Vec<PolicyTraceEntry>,
        constraints_applied: Vec<String>,
    },
}

/// The engine itself. Stateless between requests; all mutable inputs arrive
/// as pinned snapshots.
pub struct PolicyEngine {
    /// Last-resort action when a policy has neither a matching rule nor a
    /// base fallback.
    emergency_default: Option<RuleAction>,
    /// Token estimate above which `long_context` joins the requirement set.
    long_context_tokens: u32,
}

impl PolicyEngine {
    pub fn new(emergency_default: Option<RuleAction>, long_context_tokens: u32) -> Self {
        Self {
            emergency_default,
            long_context_tokens,
        }
    }

    /// Run the full decision pass against one pinned policy snapshot.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        policy: &DepartmentPolicy,
        catalog: &ModelCatalog,
        classification: &Classification,
        risk: &RiskAssessment,
        pre: &PreAnalysis,
        budget: BudgetReading,
        health: &dyn Fn(&str) -> ProviderHealth,
    ) -> PolicyOutcome {
        let mut trace: Vec<PolicyTraceEntry> = Vec::new();
        let mut constraints: Vec<String> = Vec::new();

        let mut required = classification.required_capability.clone();
        if pre.estimated_tokens > self.long_context_tokens
            && !required.iter().any(|c| c == "long_context")
        {
            required.push("long_context".to_string());
        }

        // ── Ordered rule scan, first match wins ────────────────────────────
        let mut selection: Option<(String, Option<String>, Vec<Candidate>)> = None;
        for rule in &policy.rules {
            if selection.is_some() {
                trace.push(PolicyTraceEntry::new(
                    &rule.name,
                    TraceResult::NotEvaluated,
                    "earlier rule already matched",
                ));
                continue;
            }
            if let Some(reason) = predicate_mismatch(&rule.matcher, classification, risk, &required)
            {
                trace.push(PolicyTraceEntry::new(&rule.name, TraceResult::Skipped, reason));
                continue;
            }
            match resolve_action(&rule.action, catalog, &required) {
                Resolution::Candidates(cands, virtual_id) => {
                    trace.push(PolicyTraceEntry::new(
                        &rule.name,
                        TraceResult::Matched,
                        format!(
                            "task={} complexity={}",
                            classification.task_type.as_str(),
                            classification.complexity.as_str()
                        ),
                    ));
                    selection = Some((rule.name.clone(), virtual_id, cands));
                }
                Resolution::CapabilityUnmet(reason) => {
                    trace.push(PolicyTraceEntry::new(
                        &rule.name,
                        TraceResult::CapabilityUnmet,
                        reason,
                    ));
                }
                Resolution::Unresolvable(reason) => {
                    trace.push(PolicyTraceEntry::new(&rule.name, TraceResult::Skipped, reason));
                }
            }
        }

        // ── Base fallback, then emergency default ──────────────────────────
        let (rule_matched, virtual_model_id, mut candidates) = match selection {
            Some(s) => s,
            None => {
                if let Some(fb) = &policy.base_fallback {
                    if let Resolution::Candidates(cands, vid) = resolve_action(fb, catalog, &[]) {
                        trace.push(PolicyTraceEntry::new(
                            "base_fallback",
                            TraceResult::Matched,
                            "no specific rule matched, using department default",
                        ));
                        ("base_fallback".to_string(), vid, cands)
                    } else {
                        return self.emergency_or_unmatched(policy, catalog, trace, constraints);
                    }
                } else {
                    return self.emergency_or_unmatched(policy, catalog, trace, constraints);
                }
            }
        };

        // ── Risk gate: strip forbidden provider classes ────────────────────
        if risk.direct_commercial_forbidden {
            constraints.push(format!("risk_floor_{}", risk.level.as_str()));
            let before: Vec<String> = candidates.iter().map(|c| c.model_id.clone()).collect();
            candidates.retain(|c| {
                catalog
                    .provider_class(&c.provider)
                    .allowed_when_commercial_forbidden()
            });
            let stripped = before.len() - candidates.len();
            if candidates.is_empty() {
                trace.push(PolicyTraceEntry::new(
                    format!("risk_gate_{}", risk.level.as_str()),
                    TraceResult::RiskOverride,
                    "all candidates use direct-commercial providers",
                ));
                return PolicyOutcome::Blocked(BlockedRoute {
                    rationale: risk.rationale.clone(),
                    models_tried: before,
                    policy_version: policy.version.clone(),
                    trace,
                    constraints_applied: constraints,
                });
            }
            if stripped > 0 {
                trace.push(PolicyTraceEntry::new(
                    format!("risk_gate_{}", risk.level.as_str()),
                    TraceResult::RiskOverride,
                    format!(
                        "stripped {stripped} of {} candidates (direct commercial forbidden)",
                        before.len()
                    ),
                ));
            }
        }

        // ── Budget guardrails (after the risk gate, never overriding it) ──
        match budget {
            BudgetReading::Unknown => {
                constraints.push("budget_unknown".to_string());
            }
            BudgetReading::Known(pct) => {
                if pct >= policy.budget.force_cheap_at_pct {
                    if let Some(replacement) =
                        self.force_cheap_candidates(policy, catalog, risk)
                    {
                        candidates = replacement;
                        trace.push(PolicyTraceEntry::new(
                            "budget_guard_force_cheap",
                            TraceResult::BudgetOverride,
                            format!(
                                "budget {pct:.0}% >= force threshold {:.0}%",
                                policy.budget.force_cheap_at_pct
                            ),
                        ));
                        constraints.push("budget_force_cheap".to_string());
                    }
                } else if pct >= policy.budget.downgrade_at_pct {
                    let current = candidates[0].tier;
                    let target = current.demoted();
                    if target != current
                        && demote_candidates(&mut candidates, target, policy, catalog, risk)
                    {
                        trace.push(PolicyTraceEntry::new(
                            "budget_guard_downgrade",
                            TraceResult::BudgetOverride,
                            format!(
                                "budget {pct:.0}% >= downgrade threshold {:.0}%, tier {} -> {}",
                                policy.budget.downgrade_at_pct,
                                current.as_str(),
                                candidates[0].tier.as_str()
                            ),
                        ));
                        constraints.push("budget_downgrade".to_string());
                    }
                }
            }
        }

        // Static tier ceiling applies regardless of utilization.
        if let Some(max_tier) = policy.budget.max_tier {
            let current = candidates[0].tier;
            if current.rank() > max_tier.rank()
                && demote_candidates(&mut candidates, max_tier, policy, catalog, risk)
            {
                trace.push(PolicyTraceEntry::new(
                    "budget_guard_max_tier",
                    TraceResult::BudgetOverride,
                    format!("tier {} exceeds max_tier {}", current.as_str(), max_tier.as_str()),
                ));
                constraints.push("max_tier_clamp".to_string());
            }
        }

        // ── Health filter: fallbacks only, never the primary ──────────────
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for (i, c) in candidates.into_iter().enumerate() {
            if i > 0 && health(&c.provider) == ProviderHealth::Failing {
                removed.push(c.model_id);
            } else {
                kept.push(c);
            }
        }
        if !removed.is_empty() {
            trace.push(PolicyTraceEntry::new(
                "health_filter",
                TraceResult::FallbackFiltered,
                format!("removed failing fallbacks: {}", removed.join(", ")),
            ));
        }
        let candidates = kept;

        // ── Commit ─────────────────────────────────────────────────────────
        let primary = candidates[0].clone();
        let mut fallback_models = Vec::new();
        for c in candidates.into_iter().skip(1) {
            if c.model_id != primary.model_id && !fallback_models.contains(&c.model_id) {
                fallback_models.push(c.model_id);
            }
        }

        debug!(
            rule = %rule_matched,
            model = %primary.model_id,
            tier = primary.tier.as_str(),
            fallbacks = fallback_models.len(),
            "policy decision committed"
        );

        PolicyOutcome::Selected(SelectedRoute {
            primary_model: primary.model_id,
            provider: primary.provider,
            tier: primary.tier,
            fallback_models,
            rule_matched,
            virtual_model_id,
            policy_version: policy.version.clone(),
            trace,
            constraints_applied: constraints,
        })
    }

    fn emergency_or_unmatched(
        &self,
        policy: &DepartmentPolicy,
        catalog: &ModelCatalog,
        mut trace: Vec<PolicyTraceEntry>,
        mut constraints: Vec<String>,
    ) -> PolicyOutcome {
        if let Some(em) = &self.emergency_default {
            if let Resolution::Candidates(candidates, vid) = resolve_action(em, catalog, &[]) {
                trace.push(PolicyTraceEntry::new(
                    "emergency_default",
                    TraceResult::Matched,
                    "no rule and no base fallback, using emergency default",
                ));
                constraints.push("emergency_default".to_string());
                let primary = candidates[0].clone();
                let fallback_models = candidates
                    .into_iter()
                    .skip(1)
                    .map(|c| c.model_id)
                    .filter(|m| *m != primary.model_id)
                    .collect();
                return PolicyOutcome::Selected(SelectedRoute {
                    primary_model: primary.model_id,
                    provider: primary.provider,
                    tier: primary.tier,
                    fallback_models,
                    rule_matched: "emergency_default".to_string(),
                    virtual_model_id: vid,
                    policy_version: policy.version.clone(),
                    trace,
                    constraints_applied: constraints,
                });
            }
        }
        PolicyOutcome::NoRuleMatched {
            policy_version: policy.version.clone(),
            trace,
            constraints_applied: constraints,
        }
    }

    /// Candidates for the force-cheap replacement: the base fallback,
    /// risk-filtered. Returns `None` when nothing survives — budget must
    /// never make governance worse, so the current selection stands.
    fn force_cheap_candidates(
        &self,
        policy: &DepartmentPolicy,
        catalog: &ModelCatalog,
        risk: &RiskAssessment,
    ) -> Option<Vec<Candidate>> {
        let fb = policy.base_fallback.as_ref()?;
        let Resolution::Candidates(mut cands, _) = resolve_action(fb, catalog, &[]) else {
            return None;
        };
        if risk.direct_commercial_forbidden {
            cands.retain(|c| {
                catalog
                    .provider_class(&c.provider)
                    .allowed_when_commercial_forbidden()
            });
        }
        if cands.is_empty() {
            None
        } else {
            Some(cands)
        }
    }
}

/// Demote the primary to the first candidate at or below `target`.
///
/// Searches the current (already risk-filtered) candidate list first, then
/// the base fallback. Returns true when the primary changed.
fn demote_candidates(
    candidates: &mut Vec<Candidate>,
    target: ModelTier,
    policy: &DepartmentPolicy,
    catalog: &ModelCatalog,
    risk: &RiskAssessment,
) -> bool {
    if candidates[0].tier.rank() <= target.rank() {
        return false;
    }
    if let Some(pos) = candidates.iter().position(|c| c.tier.rank() <= target.rank()) {
        let chosen = candidates.remove(pos);
        candidates.insert(0, chosen);
        return true;
    }
    // Nothing cheap enough in the chain; borrow from the base fallback.
    if let Some(fb) = &policy.base_fallback {
        if let Resolution::Candidates(fb_cands, _) = resolve_action(fb, catalog, &[]) {
            let allowed = |c: &Candidate| {
                !risk.direct_commercial_forbidden
                    || catalog
                        .provider_class(&c.provider)
                        .allowed_when_commercial_forbidden()
            };
            if let Some(chosen) = fb_cands
                .into_iter()
                .find(|c| c.tier.rank() <= target.rank() && allowed(c))
            {
                candidates.retain(|c| c.model_id != chosen.model_id);
                candidates.insert(0, chosen);
                return true;
            }
        }
    }
    false
}

enum Resolution {
    Candidates(Vec<Candidate>, Option<String>),
    CapabilityUnmet(String),
    Unresolvable(String),
}

/// Resolve a rule action to concrete candidates.
///
/// Virtual references are resolved through the catalog and filtered by the
/// required capability set. Explicit concrete chains are taken as the
/// operator wrote them (no capability filter).
fn resolve_action(action: &RuleAction, catalog: &ModelCatalog, required: &[String]) -> Resolution {
    if let Some(vid) = &action.virtual_model {
        let resolved = catalog.resolve(vid);
        if resolved.is_empty() {
            return Resolution::Unresolvable(format!("virtual model '{vid}' not in catalog"));
        }
        let covered: Vec<Candidate> = resolved
            .iter()
            .filter(|m| m.covers(required))
            .map(|m| Candidate {
                model_id: m.model_id.clone(),
                provider: m.provider.clone(),
                tier: m.tier,
            })
            .collect();
        if covered.is_empty() {
            return Resolution::CapabilityUnmet(format!(
                "no model in '{vid}' covers required capabilities [{}]",
                required.join(", ")
            ));
        }
        return Resolution::Candidates(covered, Some(vid.clone()));
    }

    if let Some(primary) = &action.primary_model {
        let mut cands = Vec::new();
        for id in std::iter::once(primary).chain(action.fallback_models.iter()) {
            for m in catalog.resolve(id) {
                cands.push(Candidate {
                    model_id: m.model_id.clone(),
                    provider: m.provider.clone(),
                    tier: m.tier,
                });
            }
        }
        if cands.is_empty() {
            return Resolution::Unresolvable(format!("model '{primary}' not in catalog"));
        }
        return Resolution::Candidates(cands, None);
    }

    Resolution::Unresolvable("rule action names no model".to_string())
}

fn predicate_mismatch(
    matcher: &RuleMatch,
    classification: &Classification,
    risk: &RiskAssessment,
    required: &[String],
) -> Option<String> {
    if let Some(t) = matcher.task_type {
        if t != classification.task_type {
            return Some(format!(
                "task_type '{}' != '{}'",
                t.as_str(),
                classification.task_type.as_str()
            ));
        }
    }
    if let Some(c) = matcher.complexity {
        if c != classification.complexity {
            return Some(format!(
                "complexity '{}' != '{}'",
                c.as_str(),
                classification.complexity.as_str()
            ));
        }
    }
    if let Some(d) = matcher.department {
        if d != classification.department {
            return Some(format!(
                "department '{}' != '{}'",
                d.as_str(),
                classification.department.as_str()
            ));
        }
    }
    if let Some(max) = matcher.risk_max {
        if risk.level > max {
            return Some(format!(
                "risk '{}' exceeds risk_max '{}'",
                risk.level.as_str(),
                max.as_str()
            ));
        }
    }
    if let Some(caps) = &matcher.capabilities_required {
        for cap in caps {
            if !required.contains(cap) {
                return Some(format!("request does not require capability '{cap}'"));
            }
        }
    }
    None
}
