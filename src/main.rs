//! Gateway binary: wires configuration, catalog, policies, and providers,
//! then serves the HTTP surface.
//!
//! Exit codes: 0 clean shutdown, 2 configuration error, 64 policy load
//! failure (retryable).

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use modelgate::audit::{DecisionRecorder, JsonlSink, MemorySink};
use modelgate::budget::MemoryBudgetStore;
use modelgate::catalog::{ModelCatalog, ModelTier, ProviderClass};
use modelgate::classifier::Classifier;
use modelgate::config::{Settings, EXIT_CONFIG_ERROR, EXIT_POLICY_LOAD_FAILED};
use modelgate::engine::RoutingEngine;
use modelgate::policy::types::RuleAction;
use modelgate::policy::{store::spawn_policy_watcher, PolicyEngine, PolicyStore};
use modelgate::providers::registry::spawn_health_pinger;
use modelgate::providers::{
    AnthropicProvider, OllamaProvider, OpenAiProvider, ProviderBinding, ProviderRegistry,
};
use modelgate::{init_tracing, metrics, server, GatewayError};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let settings = match Settings::from_env().and_then(|s| s.validate().map(|_| s)) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_ERROR as u8);
        }
    };

    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "metrics initialisation failed");
        return ExitCode::from(EXIT_CONFIG_ERROR as u8);
    }

    let catalog = match ModelCatalog::from_file(&settings.catalog_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "catalog load failed");
            return ExitCode::from(EXIT_CONFIG_ERROR as u8);
        }
    };

    let policy_store = match PolicyStore::load(&settings.policies_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "policy load failed");
            return ExitCode::from(EXIT_POLICY_LOAD_FAILED as u8);
        }
    };

    let registry = match build_registry(&settings, &catalog) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "provider setup failed");
            return ExitCode::from(EXIT_CONFIG_ERROR as u8);
        }
    };

    let classifier = Classifier::new(
        settings.anthropic_api_key.clone(),
        settings.classifier_model.clone(),
    )
    .with_timeout(settings.classifier_timeout)
    .with_confidence_threshold(settings.classifier_confidence_threshold);

    let emergency_default = settings.emergency_default_model.as_ref().map(|model| {
        let tier = catalog.get(model).map(|m| m.tier).unwrap_or(ModelTier::FastCheap);
        RuleAction {
            primary_model: Some(model.clone()),
            model_tier: tier,
            rationale: "configured emergency default".into(),
            ..RuleAction::default()
        }
    });
    let policy_engine = PolicyEngine::new(emergency_default, settings.long_context_tokens);

    let recorder = Arc::new(DecisionRecorder::new(vec![
        Arc::new(JsonlSink::new(&settings.audit_log_path)),
        Arc::new(MemorySink::new()),
    ]));

    let engine = Arc::new(RoutingEngine::new(
        classifier,
        Arc::clone(&policy_store),
        policy_engine,
        catalog,
        Arc::clone(&registry),
        Arc::new(MemoryBudgetStore::new()),
        recorder,
    ));

    // Keep the watcher handle alive for the life of the process.
    let _policy_watcher = match spawn_policy_watcher(Arc::clone(&policy_store)) {
        Ok(w) => Some(w),
        Err(e) => {
            error!(error = %e, "policy watcher unavailable, reload endpoint still works");
            None
        }
    };
    spawn_health_pinger(Arc::clone(&registry), settings.health_ping_interval);

    info!(
        policies = policy_store.snapshot().departments().len(),
        providers = registry.provider_names().len(),
        "gateway starting"
    );

    match server::start_server(&settings, engine).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server terminated");
            ExitCode::from(EXIT_CONFIG_ERROR as u8)
        }
    }
}

fn build_registry(
    settings: &Settings,
    catalog: &ModelCatalog,
) -> Result<ProviderRegistry, GatewayError> {
    let mut registry = ProviderRegistry::new();

    // Ollama is always registered: self-hosted inference must be reachable
    // for high/regulated traffic even with no commercial credentials.
    registry.register(
        ProviderBinding::new("ollama", ProviderClass::SelfHosted),
        Arc::new(OllamaProvider::new(settings.ollama_base_url.clone())),
    );

    if let Some(key) = &settings.anthropic_api_key {
        registry.register(
            ProviderBinding::new("anthropic", ProviderClass::DirectCommercial),
            Arc::new(AnthropicProvider::new(key.clone())),
        );
    }
    if let Some(key) = &settings.openai_api_key {
        registry.register(
            ProviderBinding::new("openai", ProviderClass::DirectCommercial),
            Arc::new(OpenAiProvider::new(key.clone())),
        );
    }
    if let Some(url) = &settings.vllm_base_url {
        registry.register(
            ProviderBinding::new("vllm", ProviderClass::SelfHosted),
            Arc::new(OpenAiProvider::new(String::new()).with_base_url(url.clone()).with_name("vllm")),
        );
    }

    // Models whose provider has no credentials stay in the catalog; the
    // executor skips them at call time. Surface the gap at startup.
    for name in catalog.provider_names() {
        if registry.get(&name).is_none() {
            tracing::warn!(
                provider = %name,
                "catalog references a provider with no configured credentials or endpoint"
            );
        }
    }
    Ok(registry)
}
