//! Model catalog: concrete models, virtual identifiers, pricing.
//!
//! Policies reference stable virtual ids (`rb://…`); the catalog resolves
//! them to preference-ordered concrete model lists at decision time, so a
//! catalog update takes effect on the next request without touching any
//! policy file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::GatewayError;

/// Prefix marking a virtual model identifier.
pub const VIRTUAL_PREFIX: &str = "rb://";

/// Cost/capability tier, ordered `local < fast_cheap < balanced < powerful`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Local,
    FastCheap,
    Balanced,
    Powerful,
}

impl ModelTier {
    /// Rank for tier comparisons; higher is more powerful.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Local => 0,
            Self::FastCheap => 1,
            Self::Balanced => 2,
            Self::Powerful => 3,
        }
    }

    /// One budget-demotion step: powerful → balanced → fast_cheap.
    /// `local` and `fast_cheap` are unaffected.
    pub fn demoted(&self) -> Self {
        match self {
            Self::Powerful => Self::Balanced,
            Self::Balanced => Self::FastCheap,
            Self::FastCheap => Self::FastCheap,
            Self::Local => Self::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::FastCheap => "fast_cheap",
            Self::Balanced => "balanced",
            Self::Powerful => "powerful",
        }
    }
}

/// Data-residency class of a provider, consumed by the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    /// Runs on our own infrastructure; content never leaves.
    SelfHosted,
    /// Vendor API without a data-protection addendum.
    DirectCommercial,
    /// Managed cloud with BAA/DPA; allowed for high and regulated content.
    CompliantCloud,
}

impl ProviderClass {
    /// Whether this class may serve a request that forbids direct commercial.
    pub fn allowed_when_commercial_forbidden(&self) -> bool {
        !matches!(self, Self::DirectCommercial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfHosted => "self_hosted",
            Self::DirectCommercial => "direct_commercial",
            Self::CompliantCloud => "compliant_cloud",
        }
    }
}

/// One routable concrete model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub model_id: String,
    pub provider: String,
    pub tier: ModelTier,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    #[serde(default)]
    pub context_window: u32,
}

impl ModelEntry {
    /// True when this model's capability set covers every required tag.
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.capabilities.contains(r))
    }
}

/// A virtual identifier mapping to an ordered concrete preference list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualModel {
    pub models: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Raw YAML document shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    virtual_models: HashMap<String, VirtualModel>,
    #[serde(default)]
    providers: HashMap<String, ProviderClass>,
}

/// Per-tier fallback rate ($/Mtok, input+output blended) used when a model
/// has no explicit pricing.
fn tier_fallback_rate(tier: ModelTier) -> f64 {
    match tier {
        ModelTier::FastCheap => 0.80,
        ModelTier::Balanced => 3.00,
        ModelTier::Powerful => 15.00,
        ModelTier::Local => 0.0,
    }
}

/// The loaded catalog. Immutable after construction; swap the whole value
/// to update.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelEntry>,
    order: Vec<String>,
    virtual_models: HashMap<String, VirtualModel>,
    provider_classes: HashMap<String, ProviderClass>,
}

impl ModelCatalog {
    /// Parse and validate a catalog from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, GatewayError> {
        let doc: CatalogDocument = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("catalog parse error: {e}")))?;

        let mut models = HashMap::new();
        let mut order = Vec::new();
        for entry in doc.models {
            if models.contains_key(&entry.model_id) {
                return Err(GatewayError::Config(format!(
                    "duplicate model id '{}' in catalog",
                    entry.model_id
                )));
            }
            order.push(entry.model_id.clone());
            models.insert(entry.model_id.clone(), entry);
        }

        for (vid, vm) in &doc.virtual_models {
            if !vid.starts_with(VIRTUAL_PREFIX) {
                return Err(GatewayError::Config(format!(
                    "virtual model id '{vid}' must start with {VIRTUAL_PREFIX}"
                )));
            }
            if vm.models.is_empty() {
                return Err(GatewayError::Config(format!(
                    "virtual model '{vid}' has an empty preference list"
                )));
            }
            for m in &vm.models {
                if !models.contains_key(m) {
                    return Err(GatewayError::Config(format!(
                        "virtual model '{vid}' references unknown model '{m}'"
                    )));
                }
            }
        }

        Ok(Self {
            models,
            order,
            virtual_models: doc.virtual_models,
            provider_classes: doc.providers,
        })
    }

    /// Load the catalog from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    pub fn is_virtual(model_id: &str) -> bool {
        model_id.starts_with(VIRTUAL_PREFIX)
    }

    /// Look up a concrete model.
    pub fn get(&self, model_id: &str) -> Option<&ModelEntry> {
        self.models.get(model_id)
    }

    /// Resolve an id (virtual or concrete) to its preference-ordered
    /// concrete entries. Unknown ids resolve to an empty list.
    pub fn resolve(&self, model_id: &str) -> Vec<&ModelEntry> {
        if Self::is_virtual(model_id) {
            self.virtual_models
                .get(model_id)
                .map(|vm| vm.models.iter().filter_map(|m| self.models.get(m)).collect())
                .unwrap_or_default()
        } else {
            self.models.get(model_id).into_iter().collect()
        }
    }

    /// Data-residency class for a provider name. Unknown providers are
    /// treated as direct commercial so the risk gate errs toward stripping.
    pub fn provider_class(&self, provider: &str) -> ProviderClass {
        self.provider_classes
            .get(provider)
            .copied()
            .unwrap_or(ProviderClass::DirectCommercial)
    }

    /// Estimated cost in USD for a call against `model_id`.
    pub fn estimate_cost_usd(
        &self,
        model_id: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> f64 {
        match self.models.get(model_id) {
            Some(m) => {
                (prompt_tokens as f64 / 1_000_000.0) * m.input_cost_per_mtok
                    + (completion_tokens as f64 / 1_000_000.0) * m.output_cost_per_mtok
            }
            None => {
                let rate = tier_fallback_rate(ModelTier::Balanced);
                ((prompt_tokens + completion_tokens) as f64 / 1_000_000.0) * rate
            }
        }
    }

    /// Concrete models in declaration order.
    pub fn concrete_models(&self) -> Vec<&ModelEntry> {
        self.order.iter().filter_map(|id| self.models.get(id)).collect()
    }

    /// Virtual model ids and their mappings.
    pub fn virtual_models(&self) -> &HashMap<String, VirtualModel> {
        &self.virtual_models
    }

    /// Provider names referenced by concrete models, deduplicated in order.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for id in &self.order {
            if let Some(m) = self.models.get(id) {
                if !names.contains(&m.provider) {
                    names.push(m.provider.clone());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const CATALOG_YAML: &str = r#"
providers:
  ollama: self_hosted
  vllm: self_hosted
  anthropic: direct_commercial
  openai: direct_commercial
  bedrock: compliant_cloud

models:
  - model_id: llama3.1:8b
    provider: ollama
    tier: local
    capabilities: [low_latency]
    context_window: 131072
  - model_id: haiku-fast
    provider: anthropic
    tier: fast_cheap
    capabilities: [low_latency, tool_calling_stable]
    input_cost_per_mtok: 0.8
    output_cost_per_mtok: 4.0
    context_window: 200000
  - model_id: sonnet-balanced
    provider: anthropic
    tier: balanced
    capabilities: [deep_reasoning, long_context, tool_calling_stable]
    input_cost_per_mtok: 3.0
    output_cost_per_mtok: 15.0
    context_window: 200000
  - model_id: bedrock-sonnet
    provider: bedrock
    tier: balanced
    capabilities: [deep_reasoning, long_context]
    input_cost_per_mtok: 3.0
    output_cost_per_mtok: 15.0
    context_window: 200000

virtual_models:
  "rb://fast_cheap_code":
    description: cheap codegen pool
    models: [haiku-fast, llama3.1:8b]
  "rb://balanced_reasoning":
    description: balanced reasoning pool
    models: [sonnet-balanced, bedrock-sonnet, llama3.1:8b]
"#;

    #[test]
    fn test_catalog_parses_and_indexes() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        assert_eq!(cat.concrete_models().len(), 4);
        assert!(cat.get("haiku-fast").is_some());
        assert!(cat.get("missing").is_none());
    }

    #[test]
    fn test_resolve_virtual_preserves_preference_order() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        let resolved = cat.resolve("rb://balanced_reasoning");
        let ids: Vec<&str> = resolved.iter().map(|m| m.model_id.as_str()).collect();
        assert_eq!(ids, vec!["sonnet-balanced", "bedrock-sonnet", "llama3.1:8b"]);
    }

    #[test]
    fn test_resolve_concrete_returns_single_entry() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        let resolved = cat.resolve("haiku-fast");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].provider, "anthropic");
    }

    #[test]
    fn test_resolve_unknown_is_empty() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        assert!(cat.resolve("rb://nope").is_empty());
        assert!(cat.resolve("nope").is_empty());
    }

    #[test]
    fn test_unknown_provider_defaults_to_direct_commercial() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        assert_eq!(cat.provider_class("mystery"), ProviderClass::DirectCommercial);
        assert_eq!(cat.provider_class("ollama"), ProviderClass::SelfHosted);
        assert_eq!(cat.provider_class("bedrock"), ProviderClass::CompliantCloud);
    }

    #[test]
    fn test_virtual_referencing_unknown_model_rejected() {
        let bad = r#"
models:
  - model_id: a
    provider: ollama
    tier: local
virtual_models:
  "rb://x":
    models: [a, ghost]
"#;
        let err = ModelCatalog::from_yaml(bad).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_virtual_without_prefix_rejected() {
        let bad = r#"
models:
  - model_id: a
    provider: ollama
    tier: local
virtual_models:
  "plain_name":
    models: [a]
"#;
        assert!(ModelCatalog::from_yaml(bad).is_err());
    }

    #[test]
    fn test_duplicate_model_id_rejected() {
        let bad = r#"
models:
  - model_id: a
    provider: ollama
    tier: local
  - model_id: a
    provider: ollama
    tier: local
"#;
        assert!(ModelCatalog::from_yaml(bad).is_err());
    }

    #[test]
    fn test_covers_requires_all_capabilities() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        let sonnet = cat.get("sonnet-balanced").expect("test: model exists");
        assert!(sonnet.covers(&["deep_reasoning".into(), "long_context".into()]));
        assert!(!sonnet.covers(&["vision".into()]));
        assert!(sonnet.covers(&[]));
    }

    #[test]
    fn test_tier_demotion_chain() {
        assert_eq!(ModelTier::Powerful.demoted(), ModelTier::Balanced);
        assert_eq!(ModelTier::Balanced.demoted(), ModelTier::FastCheap);
        assert_eq!(ModelTier::FastCheap.demoted(), ModelTier::FastCheap);
        assert_eq!(ModelTier::Local.demoted(), ModelTier::Local);
    }

    #[test]
    fn test_cost_estimate_uses_model_pricing() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        // 1M prompt tokens at $3 + 1M completion at $15
        let cost = cat.estimate_cost_usd("sonnet-balanced", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_estimate_unknown_model_uses_tier_fallback() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        let cost = cat.estimate_cost_usd("mystery", 500_000, 500_000);
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_provider_names_deduplicated_in_order() {
        let cat = ModelCatalog::from_yaml(CATALOG_YAML).expect("test: parse catalog");
        assert_eq!(cat.provider_names(), vec!["ollama", "anthropic", "bedrock"]);
    }
}
