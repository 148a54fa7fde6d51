//! Shared harness for the end-to-end routing tests: a scriptable provider,
//! a small catalog/policy fixture, and an engine builder.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use modelgate::audit::{DecisionRecorder, MemorySink};
use modelgate::budget::{BudgetStore, MemoryBudgetStore};
use modelgate::catalog::{ModelCatalog, ProviderClass};
use modelgate::classifier::Classifier;
use modelgate::engine::RoutingEngine;
use modelgate::policy::{loader, PolicyEngine, PolicyStore};
use modelgate::protocol::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, RequestIdentity, StreamEvent,
    UsageInfo,
};
use modelgate::providers::{
    provider_error, EventStream, Provider, ProviderBinding, ProviderRegistry,
};
use modelgate::GatewayError;

pub const CATALOG_YAML: &str = r#"
providers:
  commercial: direct_commercial
  onprem: self_hosted

models:
  - model_id: fast-commercial
    provider: commercial
    tier: fast_cheap
    capabilities: [low_latency]
    input_cost_per_mtok: 0.8
    output_cost_per_mtok: 4.0
  - model_id: strong-commercial
    provider: commercial
    tier: powerful
    capabilities: [deep_reasoning, long_context]
    input_cost_per_mtok: 15.0
    output_cost_per_mtok: 75.0
  - model_id: balanced-commercial
    provider: commercial
    tier: balanced
    capabilities: [deep_reasoning, long_context]
    input_cost_per_mtok: 3.0
    output_cost_per_mtok: 15.0
  - model_id: local-llama
    provider: onprem
    tier: local
    capabilities: [low_latency]

virtual_models:
  "rb://cheap_pool":
    models: [fast-commercial, local-llama]
  "rb://deep_pool":
    models: [strong-commercial, balanced-commercial, local-llama]
"#;

pub const RD_POLICY_YAML: &str = r#"
department: rd
version: "9.1"
rules:
  - name: simple_codegen
    match:
      task_type: code_generation
      complexity: simple
    action:
      virtual_model: "rb://cheap_pool"
      model_tier: fast_cheap
  - name: architecture
    match:
      task_type: architecture_design
    action:
      virtual_model: "rb://deep_pool"
      model_tier: powerful
budget:
  daily_limit_usd_per_tenant: 100.0
  downgrade_at_pct: 80
  force_cheap_at_pct: 95
base_fallback:
  primary_model: fast-commercial
  fallback_models: [local-llama]
  model_tier: fast_cheap
"#;

/// A department whose entire fleet is direct commercial: high-risk traffic
/// into it has nothing left after the risk gate.
pub const SALES_POLICY_YAML: &str = r#"
department: sales
version: "3.0"
rules:
  - name: everything_commercial
    action:
      primary_model: fast-commercial
      fallback_models: [balanced-commercial]
      model_tier: fast_cheap
"#;

/// How a scripted provider behaves per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    Ok,
    /// Always fail with this status.
    FailStatus(u16),
    /// Streaming only: emit N text deltas then a transport error.
    FailMidStream(usize),
}

pub struct ScriptedProvider {
    name: String,
    script: Script,
    pub calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &str, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        _request: &ChatCompletionRequest,
        model: &str,
    ) -> Result<ChatCompletionResponse, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Ok => Ok(ChatCompletionResponse::assembled(
                format!("resp-{}", self.name),
                model,
                format!("answer via {}", self.name),
                "stop".into(),
                Some(UsageInfo::new(10, 20)),
            )),
            Script::FailStatus(status) => Err(provider_error(&self.name, status, "scripted failure")),
            Script::FailMidStream(_) => Err(provider_error(&self.name, 500, "stream-only script")),
        }
    }

    async fn chat_stream(
        &self,
        _request: &ChatCompletionRequest,
        _model: &str,
    ) -> Result<EventStream, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Ok => {
                let items: Vec<Result<StreamEvent, GatewayError>> = vec![
                    Ok(StreamEvent::RoleDelta("assistant".into())),
                    Ok(StreamEvent::TextDelta("streamed ".into())),
                    Ok(StreamEvent::TextDelta("answer".into())),
                    Ok(StreamEvent::FinishReason("stop".into())),
                    Ok(StreamEvent::Usage(UsageInfo::new(10, 4))),
                ];
                Ok(Box::pin(futures::stream::iter(items)))
            }
            Script::FailStatus(status) => Err(provider_error(&self.name, status, "scripted failure")),
            Script::FailMidStream(n) => {
                let name = self.name.clone();
                let mut items: Vec<Result<StreamEvent, GatewayError>> =
                    vec![Ok(StreamEvent::RoleDelta("assistant".into()))];
                items.extend((0..n).map(|i| Ok(StreamEvent::TextDelta(format!("part{i} ")))));
                items.push(Err(provider_error(&name, 0, "connection reset mid-stream")));
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub engine: Arc<RoutingEngine>,
    pub sink: Arc<MemorySink>,
    pub budget: Arc<MemoryBudgetStore>,
    pub policy_store: Arc<PolicyStore>,
}

/// Build an engine with scripted providers and the fixture policy set.
pub fn harness(commercial: Script, onprem: Script) -> Harness {
    let catalog = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: catalog");

    let mut registry = ProviderRegistry::new();
    registry.register(
        ProviderBinding::new("commercial", ProviderClass::DirectCommercial),
        Arc::new(ScriptedProvider::new("commercial", commercial)),
    );
    registry.register(
        ProviderBinding::new("onprem", ProviderClass::SelfHosted),
        Arc::new(ScriptedProvider::new("onprem", onprem)),
    );

    let rd = loader::load_from_str(RD_POLICY_YAML, "rd.yaml").expect("test: policy");
    let sales = loader::load_from_str(SALES_POLICY_YAML, "sales.yaml").expect("test: policy");
    let policy_store = Arc::new(PolicyStore::from_policies(vec![(rd, true), (sales, false)]));

    let sink = Arc::new(MemorySink::new());
    let recorder = Arc::new(DecisionRecorder::new(vec![sink.clone()]));
    let budget = Arc::new(MemoryBudgetStore::new());

    let budget_store: Arc<dyn BudgetStore> = budget.clone();
    let engine = Arc::new(RoutingEngine::new(
        // No credential: every request takes the deterministic heuristic path.
        Classifier::new(None, "fast-model"),
        Arc::clone(&policy_store),
        PolicyEngine::new(None, 8000),
        catalog,
        Arc::new(registry),
        budget_store,
        recorder,
    ));

    Harness {
        engine,
        sink,
        budget,
        policy_store,
    }
}

pub fn request(text: &str, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "auto".into(),
        messages: vec![ChatMessage::text("user", text)],
        stream,
        temperature: None,
        max_tokens: None,
        top_p: None,
        stop: None,
        tools: None,
        tool_choice: None,
        user: None,
        identity: RequestIdentity {
            tenant_id: Some("acme".into()),
            user_id: Some("u1".into()),
            department: Some("rd".into()),
        },
        idempotency_key: None,
    }
}

/// Wait until the memory sink holds at least `n` records.
pub async fn wait_for_records(sink: &MemorySink, n: usize) {
    for _ in 0..100 {
        if sink.len().await >= n {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("audit sink never reached {n} records");
}
