//! Provider registry: binding resolution, health tracking, call ceilings.
//!
//! Health transitions are driven by per-call outcomes and a background
//! pinger: consecutive failures degrade a provider (2 → Degraded,
//! 4 → Failing); the first success resets it to Healthy. Readers take a
//! point-in-time copy — health is advisory and eventually consistent, the
//! risk gate never depends on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{Provider, ProviderBinding, ProviderHealth};

/// Consecutive failures before a provider is marked degraded.
const DEGRADED_AFTER: u32 = 2;
/// Consecutive failures before a provider is marked failing.
const FAILING_AFTER: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct HealthState {
    consecutive_failures: u32,
}

impl HealthState {
    fn status(&self) -> ProviderHealth {
        if self.consecutive_failures >= FAILING_AFTER {
            ProviderHealth::Failing
        } else if self.consecutive_failures >= DEGRADED_AFTER {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Healthy
        }
    }
}

/// Long-lived map from provider name to adapter, binding, and health.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    bindings: HashMap<String, ProviderBinding>,
    limits: HashMap<String, Arc<Semaphore>>,
    health: DashMap<String, HealthState>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            bindings: HashMap::new(),
            limits: HashMap::new(),
            health: DashMap::new(),
        }
    }

    /// Register an adapter under its binding.
    pub fn register(&mut self, binding: ProviderBinding, provider: Arc<dyn Provider>) {
        info!(
            provider = %binding.name,
            class = binding.class.as_str(),
            max_concurrent = binding.max_concurrent,
            "provider registered"
        );
        self.limits.insert(
            binding.name.clone(),
            Arc::new(Semaphore::new(binding.max_concurrent)),
        );
        self.health
            .insert(binding.name.clone(), HealthState { consecutive_failures: 0 });
        self.providers.insert(binding.name.clone(), provider);
        self.bindings.insert(binding.name.clone(), binding);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).map(Arc::clone)
    }

    pub fn binding(&self, name: &str) -> Option<&ProviderBinding> {
        self.bindings.get(name)
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current health for one provider. Unregistered names read as failing
    /// so they are filtered from fallback chains.
    pub fn health(&self, name: &str) -> ProviderHealth {
        self.health
            .get(name)
            .map(|s| s.status())
            .unwrap_or(ProviderHealth::Failing)
    }

    /// Point-in-time copy of the whole health map.
    pub fn health_snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.health
            .iter()
            .map(|e| (e.key().clone(), e.value().status()))
            .collect()
    }

    /// Record a successful call; resets the failure streak.
    pub fn record_success(&self, name: &str) {
        if let Some(mut state) = self.health.get_mut(name) {
            if state.consecutive_failures > 0 {
                debug!(provider = name, "provider recovered");
            }
            state.consecutive_failures = 0;
        }
    }

    /// Record a failed call; may push the provider to degraded/failing.
    pub fn record_failure(&self, name: &str) {
        if let Some(mut state) = self.health.get_mut(name) {
            state.consecutive_failures += 1;
            let status = state.status();
            if status != ProviderHealth::Healthy {
                warn!(
                    provider = name,
                    consecutive_failures = state.consecutive_failures,
                    status = ?status,
                    "provider health degraded"
                );
            }
        }
    }

    /// Acquire a slot under the provider's concurrent-call ceiling.
    pub async fn acquire(&self, name: &str) -> Option<OwnedSemaphorePermit> {
        let sem = self.limits.get(name)?.clone();
        sem.acquire_owned().await.ok()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically probe every provider and fold the outcome into its health
/// streak, so an idle provider's recovery is noticed without live traffic.
pub fn spawn_health_pinger(registry: Arc<ProviderRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for name in registry.provider_names() {
                if let Some(provider) = registry.get(&name) {
                    if provider.health_check().await {
                        registry.record_success(&name);
                    } else {
                        registry.record_failure(&name);
                    }
                }
            }
        }
    });
}
