//! The routing engine: composes the pipeline stages per request.
//!
//! Stage order is fixed: pre-analysis → risk → classifier → policy →
//! executor → recorder. A request pins one policy snapshot and one catalog
//! for its whole lifetime; the risk level assessed here propagates into the
//! decision record unchanged. Exactly one audit record is emitted per
//! request, whatever the outcome.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::analysis::{self, PreAnalysis, RiskAssessment};
use crate::audit::{
    AttemptRecord, ClassificationSnapshot, DecisionRecord, DecisionRecorder, LatencyBreakdown,
};
use crate::budget::{read_budget, BudgetStore};
use crate::catalog::{ModelCatalog, ModelTier};
use crate::classifier::{Classification, Classifier, ClassifiedBy, Complexity, Department, TaskType};
use crate::executor::{Executor, StreamOutcome};
use crate::metrics;
use crate::policy::engine::BudgetReading;
use crate::policy::{PolicyEngine, PolicyOutcome, PolicyStore, SelectedRoute};
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse, UsageInfo};
use crate::providers::{EventStream, ProviderHealth, ProviderRegistry};
use crate::{GatewayError, RequestId};

/// Response body produced by a routed request.
pub enum RoutedResponse {
    Buffered(ChatCompletionResponse),
    Stream(EventStream),
}

impl std::fmt::Debug for RoutedResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(r) => f.debug_tuple("Buffered").field(r).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Everything the transport layer needs to render routing metadata.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub request_id: String,
    pub model_used: String,
    pub provider_used: String,
    pub tier: ModelTier,
    pub rule_matched: String,
    pub virtual_model_id: Option<String>,
    pub policy_version: String,
    pub classification: Classification,
    pub risk: RiskAssessment,
    pub policy_trace: Vec<crate::policy::PolicyTraceEntry>,
    pub constraints_applied: Vec<String>,
    pub fallback_used: bool,
    pub latency: LatencyBreakdown,
    pub usage: Option<UsageInfo>,
    pub estimated_cost_usd: f64,
}

impl RoutingOutcome {
    /// The `x_routing_decision` payload embedded in responses.
    pub fn decision_json(&self) -> serde_json::Value {
        serde_json::json!({
            "request_id": self.request_id,
            "task_type": self.classification.task_type.as_str(),
            "complexity": self.classification.complexity.as_str(),
            "department": self.classification.department.as_str(),
            "confidence": self.classification.confidence,
            "classified_by": self.classification.classified_by.as_str(),
            "model_selected": self.model_used,
            "provider": self.provider_used,
            "model_tier": self.tier.as_str(),
            "rule_matched": self.rule_matched,
            "virtual_model_id": self.virtual_model_id,
            "policy_version": self.policy_version,
            "policy_trace": self.policy_trace,
            "constraints_applied": self.constraints_applied,
            "fallback_used": self.fallback_used,
            "risk_level": self.risk.level.as_str(),
            "risk_rationale": self.risk.rationale,
            "audit_required": self.risk.audit_required,
            "data_residency_note": self.risk.data_residency_note,
            "latency_ms": self.latency.total_ms,
            "estimated_cost_usd": self.estimated_cost_usd,
        })
    }
}

/// Input for the offline simulation endpoint: stages C2–C4 with a synthetic
/// classification, no provider call.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulateSpec {
    pub department: Department,
    pub task_type: TaskType,
    pub complexity: Complexity,
    #[serde(default)]
    pub required_capability: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub budget_pct: Option<f64>,
}

/// The assembled gateway core.
pub struct RoutingEngine {
    classifier: Classifier,
    policy_store: Arc<PolicyStore>,
    policy_engine: PolicyEngine,
    catalog: ArcSwap<ModelCatalog>,
    registry: Arc<ProviderRegistry>,
    executor: Executor,
    budget: Arc<dyn BudgetStore>,
    recorder: Arc<DecisionRecorder>,
}

impl RoutingEngine {
    pub fn new(
        classifier: Classifier,
        policy_store: Arc<PolicyStore>,
        policy_engine: PolicyEngine,
        catalog: ModelCatalog,
        registry: Arc<ProviderRegistry>,
        budget: Arc<dyn BudgetStore>,
        recorder: Arc<DecisionRecorder>,
    ) -> Self {
        Self {
            classifier,
            policy_store,
            policy_engine,
            catalog: ArcSwap::from_pointee(catalog),
            registry: Arc::clone(&registry),
            executor: Executor::new(registry),
            budget,
            recorder,
        }
    }

    /// Swap the model catalog; takes effect on the next request.
    pub fn swap_catalog(&self, catalog: ModelCatalog) {
        self.catalog.store(Arc::new(catalog));
    }

    pub fn catalog(&self) -> Arc<ModelCatalog> {
        self.catalog.load_full()
    }

    pub fn policy_store(&self) -> &Arc<PolicyStore> {
        &self.policy_store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn budget_store(&self) -> &Arc<dyn BudgetStore> {
        &self.budget
    }

    pub fn recorder(&self) -> &Arc<DecisionRecorder> {
        &self.recorder
    }

    /// Route one request end to end.
    ///
    /// The caller provides the request id so error responses, headers, and
    /// the audit record all agree. On success the caller gets the response
    /// (buffered or stream) plus the outcome for header/metadata rendering.
    /// The audit record is emitted on a detached task in every path, so
    /// caller cancellation cannot lose it.
    pub async fn route(
        &self,
        request: ChatCompletionRequest,
        request_id: RequestId,
    ) -> Result<(RoutedResponse, RoutingOutcome), GatewayError> {
        let started = Instant::now();
        let mut latency = LatencyBreakdown::default();

        // C1 — pre-analysis
        let stage = Instant::now();
        let pre = analysis::analyze(&request);
        latency.pre_analysis_ms = stage.elapsed().as_millis() as u64;
        metrics::record_stage_duration("pre_analysis", stage.elapsed());
        info!(
            request_id = %request_id,
            tokens = pre.estimated_tokens,
            keywords = pre.detected_keywords.len(),
            turns = pre.conversation_turns,
            "pre_analysis_complete"
        );

        // C2 — risk gate input (authoritative, never softened later)
        let risk = analysis::assess(&request);
        info!(
            request_id = %request_id,
            risk_level = risk.level.as_str(),
            direct_commercial_forbidden = risk.direct_commercial_forbidden,
            audit_required = risk.audit_required,
            rationale = %risk.rationale,
            "risk_assessment"
        );

        // C3 — advisory classification
        let stage = Instant::now();
        let classification = self.classifier.classify(&pre, &request.user_text()).await;
        latency.classifier_ms = stage.elapsed().as_millis() as u64;
        metrics::record_stage_duration("classifier", stage.elapsed());

        // C4 — policy decision against pinned snapshots
        let stage = Instant::now();
        let snapshot = self.policy_store.snapshot();
        let catalog = self.catalog.load_full();
        let tenant = request.identity.tenant().to_string();
        let user = request.identity.user().to_string();

        let policy = snapshot
            .resolve(request.identity.tenant_id.as_deref(), classification.department.as_str())
            .ok_or_else(|| {
                GatewayError::PolicyLoad(format!(
                    "no policy for department '{}'",
                    classification.department.as_str()
                ))
            })?;

        let budget_reading = read_budget(self.budget.as_ref(), &tenant, &user, &policy.budget).await;

        let registry = Arc::clone(&self.registry);
        let health = move |provider: &str| -> ProviderHealth { registry.health(provider) };
        let outcome = self.policy_engine.decide(
            &policy,
            &catalog,
            &classification,
            &risk,
            &pre,
            budget_reading,
            &health,
        );
        latency.policy_ms = stage.elapsed().as_millis() as u64;
        metrics::record_stage_duration("policy", stage.elapsed());

        let route = match outcome {
            PolicyOutcome::Selected(route) => route,
            PolicyOutcome::Blocked(blocked) => {
                metrics::record_governance_blocked();
                metrics::record_request("governance_blocked");
                latency.total_ms = started.elapsed().as_millis() as u64;
                self.spawn_record(blocked_record(
                    &request_id,
                    &request,
                    &pre,
                    &risk,
                    &classification,
                    &blocked,
                    latency,
                ));
                return Err(GatewayError::GovernanceBlocked {
                    rationale: format!(
                        "{} — direct commercial providers are forbidden for this content; \
                         models tried: {}",
                        blocked.rationale,
                        blocked.models_tried.join(", ")
                    ),
                    models_tried: blocked.models_tried,
                });
            }
            PolicyOutcome::NoRuleMatched {
                policy_version,
                trace,
                constraints_applied,
            } => {
                metrics::record_request("no_rule_matched");
                latency.total_ms = started.elapsed().as_millis() as u64;
                let mut record = base_record(&request_id, &request, &pre, &risk, &classification);
                record.policy_version = policy_version;
                record.policy_trace = trace;
                record.constraints_applied = constraints_applied;
                record.rule_matched = "none".into();
                record.latency = latency;
                record.error = Some("no_rule_matched".into());
                self.spawn_record(record);
                return Err(GatewayError::Internal(
                    "no routing rule matched and no emergency default is configured".into(),
                ));
            }
        };

        info!(
            request_id = %request_id,
            model = %route.primary_model,
            provider = %route.provider,
            tier = route.tier.as_str(),
            rule = %route.rule_matched,
            task_type = classification.task_type.as_str(),
            complexity = classification.complexity.as_str(),
            confidence = classification.confidence,
            risk_level = risk.level.as_str(),
            "routing_decision"
        );

        // C5/C6 — execution
        if request.stream {
            self.route_stream(request_id, request, pre, risk, classification, route, latency, started, catalog)
                .await
        } else {
            self.route_buffered(request_id, request, pre, risk, classification, route, latency, started, catalog)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn route_buffered(
        &self,
        request_id: RequestId,
        request: ChatCompletionRequest,
        pre: PreAnalysis,
        risk: RiskAssessment,
        classification: Classification,
        route: SelectedRoute,
        mut latency: LatencyBreakdown,
        started: Instant,
        catalog: Arc<ModelCatalog>,
    ) -> Result<(RoutedResponse, RoutingOutcome), GatewayError> {
        let stage = Instant::now();
        let result = self
            .executor
            .execute_buffered(&route, &catalog, &request)
            .await;
        latency.provider_ms = stage.elapsed().as_millis() as u64;
        metrics::record_stage_duration("provider", stage.elapsed());
        latency.total_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(execution) => {
                let usage = execution.response.usage.clone();
                let (prompt_tokens, completion_tokens) = usage
                    .as_ref()
                    .map(|u| (u.prompt_tokens, u.completion_tokens))
                    .unwrap_or((pre.estimated_tokens, 0));
                let cost =
                    catalog.estimate_cost_usd(&execution.model_used, prompt_tokens, completion_tokens);

                let tier = catalog
                    .get(&execution.model_used)
                    .map(|m| m.tier)
                    .unwrap_or(route.tier);
                let outcome = RoutingOutcome {
                    request_id: request_id.to_string(),
                    model_used: execution.model_used.clone(),
                    provider_used: execution.provider_used.clone(),
                    tier,
                    rule_matched: route.rule_matched.clone(),
                    virtual_model_id: route.virtual_model_id.clone(),
                    policy_version: route.policy_version.clone(),
                    classification: classification.clone(),
                    risk: risk.clone(),
                    policy_trace: route.trace.clone(),
                    constraints_applied: route.constraints_applied.clone(),
                    fallback_used: execution.fallback_used,
                    latency: latency.clone(),
                    usage,
                    estimated_cost_usd: cost,
                };

                self.spawn_spend(&request, cost);
                let mut record = base_record(&request_id, &request, &pre, &risk, &classification);
                fill_selection(&mut record, &route, &outcome, execution.attempts);
                record.prompt_tokens = prompt_tokens;
                record.completion_tokens = completion_tokens;
                record.estimated_cost_usd = cost;
                record.latency = latency;
                self.spawn_record(record);

                metrics::record_request("ok");
                Ok((RoutedResponse::Buffered(execution.response), outcome))
            }
            Err((error, attempts)) => {
                metrics::record_request(error.code());
                let mut record = base_record(&request_id, &request, &pre, &risk, &classification);
                let placeholder = RoutingOutcome {
                    request_id: request_id.to_string(),
                    model_used: route.primary_model.clone(),
                    provider_used: route.provider.clone(),
                    tier: route.tier,
                    rule_matched: route.rule_matched.clone(),
                    virtual_model_id: route.virtual_model_id.clone(),
                    policy_version: route.policy_version.clone(),
                    classification: classification.clone(),
                    risk: risk.clone(),
                    policy_trace: route.trace.clone(),
                    constraints_applied: route.constraints_applied.clone(),
                    fallback_used: attempts.len() > 1,
                    latency: latency.clone(),
                    usage: None,
                    estimated_cost_usd: 0.0,
                };
                fill_selection(&mut record, &route, &placeholder, attempts);
                record.latency = latency;
                record.error = Some(format!("{}: {error}", error.code()));
                self.spawn_record(record);
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn route_stream(
        &self,
        request_id: RequestId,
        request: ChatCompletionRequest,
        pre: PreAnalysis,
        risk: RiskAssessment,
        classification: Classification,
        route: SelectedRoute,
        mut latency: LatencyBreakdown,
        started: Instant,
        catalog: Arc<ModelCatalog>,
    ) -> Result<(RoutedResponse, RoutingOutcome), GatewayError> {
        let (stream, summary_rx) = self
            .executor
            .execute_stream(&route, &catalog, &request)
            .await;
        latency.total_ms = started.elapsed().as_millis() as u64;

        // Headers and the initial routing_decision event describe the plan's
        // primary; a mid-flight fallback keeps the same request id.
        let outcome = RoutingOutcome {
            request_id: request_id.to_string(),
            model_used: route.primary_model.clone(),
            provider_used: route.provider.clone(),
            tier: route.tier,
            rule_matched: route.rule_matched.clone(),
            virtual_model_id: route.virtual_model_id.clone(),
            policy_version: route.policy_version.clone(),
            classification: classification.clone(),
            risk: risk.clone(),
            policy_trace: route.trace.clone(),
            constraints_applied: route.constraints_applied.clone(),
            fallback_used: false,
            latency: latency.clone(),
            usage: None,
            estimated_cost_usd: 0.0,
        };

        // The audit record is written when the stream actually ends.
        let recorder = Arc::clone(&self.recorder);
        let budget = Arc::clone(&self.budget);
        let catalog_for_summary = Arc::clone(&catalog);
        let mut record = base_record(&request_id, &request, &pre, &risk, &classification);
        record.latency = latency.clone();
        let route_for_summary = route.clone();
        let tenant = request.identity.tenant().to_string();
        let user = request.identity.user().to_string();
        let request_started = started;
        tokio::spawn(async move {
            let Ok(summary) = summary_rx.await else {
                warn!("stream summary channel dropped without a value");
                return;
            };
            let (prompt_tokens, completion_tokens) = summary
                .usage
                .as_ref()
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or((0, 0));
            let cost = catalog_for_summary.estimate_cost_usd(
                &summary.model_used,
                prompt_tokens,
                completion_tokens,
            );
            if cost > 0.0 {
                budget.record_spend(&tenant, &user, cost).await;
            }

            record.model_selected = summary.model_used.clone();
            record.provider = summary.provider_used.clone();
            record.model_tier = catalog_for_summary
                .get(&summary.model_used)
                .map(|m| m.tier.as_str().to_string())
                .unwrap_or_else(|| route_for_summary.tier.as_str().to_string());
            record.virtual_model_id = route_for_summary.virtual_model_id.clone();
            record.policy_version = route_for_summary.policy_version.clone();
            record.rule_matched = route_for_summary.rule_matched.clone();
            record.policy_trace = route_for_summary.trace.clone();
            record.constraints_applied = route_for_summary.constraints_applied.clone();
            record.fallback_used = summary.fallback_used;
            record.attempts = summary.attempts.clone();
            record.prompt_tokens = prompt_tokens;
            record.completion_tokens = completion_tokens;
            record.estimated_cost_usd = cost;
            record.latency.provider_ms = request_started.elapsed().as_millis() as u64;
            record.latency.total_ms = request_started.elapsed().as_millis() as u64;
            let outcome_label = match &summary.outcome {
                StreamOutcome::Completed => "ok",
                StreamOutcome::TerminatedMidStream(m) => {
                    record.error = Some(format!("terminated_mid_stream: {m}"));
                    "terminated_mid_stream"
                }
                StreamOutcome::AllProvidersFailed(m) => {
                    record.error = Some(format!("all_providers_failed: {m}"));
                    "all_providers_failed"
                }
                StreamOutcome::ClientCancelled => {
                    record.error = Some("client_cancelled".into());
                    "client_cancelled"
                }
            };
            metrics::record_request(outcome_label);
            recorder.record(&record).await;
        });

        Ok((RoutedResponse::Stream(stream), outcome))
    }

    /// Stages C2–C4 only, with a caller-supplied synthetic classification.
    /// Nothing is executed and nothing is recorded.
    pub fn simulate(&self, spec: &SimulateSpec) -> Result<PolicyOutcome, GatewayError> {
        let classification = Classification {
            task_type: spec.task_type,
            complexity: spec.complexity,
            department: spec.department,
            required_capability: spec.required_capability.clone(),
            confidence: 1.0,
            classified_by: ClassifiedBy::AdvisoryLlm,
            rationale: "synthetic classification (simulation)".into(),
        };
        let synthetic_request = ChatCompletionRequest {
            model: "auto".into(),
            messages: vec![crate::protocol::ChatMessage::text("user", spec.text.clone())],
            stream: false,
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            user: None,
            identity: Default::default(),
            idempotency_key: None,
        };
        let pre = analysis::analyze(&synthetic_request);
        let risk = analysis::assess(&synthetic_request);

        let snapshot = self.policy_store.snapshot();
        let policy = snapshot
            .resolve(spec.tenant_id.as_deref(), spec.department.as_str())
            .ok_or_else(|| {
                GatewayError::PolicyLoad(format!(
                    "no policy for department '{}'",
                    spec.department.as_str()
                ))
            })?;
        let catalog = self.catalog.load_full();
        let budget = match spec.budget_pct {
            Some(pct) => BudgetReading::Known(pct),
            None => BudgetReading::Known(0.0),
        };
        let registry = Arc::clone(&self.registry);
        let health = move |provider: &str| -> ProviderHealth { registry.health(provider) };
        Ok(self
            .policy_engine
            .decide(&policy, &catalog, &classification, &risk, &pre, budget, &health))
    }

    fn spawn_record(&self, record: DecisionRecord) {
        let recorder = Arc::clone(&self.recorder);
        tokio::spawn(async move {
            recorder.record(&record).await;
        });
    }

    fn spawn_spend(&self, request: &ChatCompletionRequest, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        let budget = Arc::clone(&self.budget);
        let tenant = request.identity.tenant().to_string();
        let user = request.identity.user().to_string();
        tokio::spawn(async move {
            budget.record_spend(&tenant, &user, cost).await;
        });
    }
}

fn base_record(
    request_id: &RequestId,
    request: &ChatCompletionRequest,
    _pre: &PreAnalysis,
    risk: &RiskAssessment,
    classification: &Classification,
) -> DecisionRecord {
    DecisionRecord {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now(),
        tenant_id: request.identity.tenant().to_string(),
        user_id: request.identity.user().to_string(),
        department: classification.department.as_str().to_string(),
        policy_version: String::new(),
        rule_matched: String::new(),
        policy_trace: Vec::new(),
        constraints_applied: Vec::new(),
        risk_level: risk.level.as_str().to_string(),
        risk_rationale: risk.rationale.clone(),
        risk_signals: risk.signals.iter().map(|s| s.category.clone()).collect(),
        audit_required: risk.audit_required,
        data_residency_note: risk.data_residency_note.clone(),
        classification: Some(ClassificationSnapshot {
            task_type: classification.task_type.as_str().to_string(),
            complexity: classification.complexity.as_str().to_string(),
            confidence: classification.confidence,
            classified_by: classification.classified_by.as_str().to_string(),
            department: classification.department.as_str().to_string(),
            required_capability: classification.required_capability.clone(),
        }),
        model_selected: String::new(),
        provider: String::new(),
        model_tier: String::new(),
        virtual_model_id: None,
        fallback_used: false,
        attempts: Vec::new(),
        latency: LatencyBreakdown::default(),
        prompt_tokens: 0,
        completion_tokens: 0,
        estimated_cost_usd: 0.0,
        idempotency_key: request.idempotency_key.clone(),
        error: None,
    }
}

fn fill_selection(
    record: &mut DecisionRecord,
    route: &SelectedRoute,
    outcome: &RoutingOutcome,
    attempts: Vec<AttemptRecord>,
) {
    record.policy_version = route.policy_version.clone();
    record.rule_matched = route.rule_matched.clone();
    record.policy_trace = route.trace.clone();
    record.constraints_applied = route.constraints_applied.clone();
    record.model_selected = outcome.model_used.clone();
    record.provider = outcome.provider_used.clone();
    record.model_tier = outcome.tier.as_str().to_string();
    record.virtual_model_id = route.virtual_model_id.clone();
    record.fallback_used = outcome.fallback_used;
    record.attempts = attempts;
}

fn blocked_record(
    request_id: &RequestId,
    request: &ChatCompletionRequest,
    pre: &PreAnalysis,
    risk: &RiskAssessment,
    classification: &Classification,
    blocked: &crate::policy::engine::BlockedRoute,
    latency: LatencyBreakdown,
) -> DecisionRecord {
    let mut record = base_record(request_id, request, pre, risk, classification);
    record.policy_version = blocked.policy_version.clone();
    record.rule_matched = "none".into();
    record.policy_trace = blocked.trace.clone();
    record.constraints_applied = blocked.constraints_applied.clone();
    record.latency = latency;
    record.error = Some(format!(
        "governance_blocked: models tried: {}",
        blocked.models_tried.join(", ")
    ));
    record
}
