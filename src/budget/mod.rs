//! Budget accounting: per-tenant/user daily spend counters.
//!
//! The counter store is an external collaborator specified by the
//! [`BudgetStore`] trait; [`MemoryBudgetStore`] is the in-process
//! implementation used for single-node deployments and tests. Reads are
//! bounded by a 50 ms deadline — when the store does not answer in time the
//! decision proceeds with [`BudgetReading::Unknown`] and no downgrade is
//! applied. Budget is a soft constraint: it clamps tiers, it never rejects
//! a request.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::policy::engine::BudgetReading;
use crate::policy::types::BudgetControls;

/// Deadline for budget counter reads.
pub const BUDGET_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Current-day spend counters for one identity.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SpendCounters {
    pub tenant_spend_usd: f64,
    pub user_spend_usd: f64,
    pub date_key: String,
}

/// Per-tenant/user daily counter store.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Current-period utilization percentage against the policy's limits.
    /// Returns 0.0 when the policy declares no limits.
    async fn budget_pct(&self, tenant: &str, user: &str, controls: &BudgetControls) -> f64;

    /// Fold a completed call's cost into the counters.
    async fn record_spend(&self, tenant: &str, user: &str, amount_usd: f64);

    /// Raw counters, for the budget status endpoint.
    async fn spend(&self, tenant: &str, user: &str) -> SpendCounters;

    async fn health_check(&self) -> bool;
}

/// Read the budget with the stage deadline applied.
pub async fn read_budget(
    store: &dyn BudgetStore,
    tenant: &str,
    user: &str,
    controls: &BudgetControls,
) -> BudgetReading {
    match tokio::time::timeout(BUDGET_READ_TIMEOUT, store.budget_pct(tenant, user, controls)).await
    {
        Ok(pct) => BudgetReading::Known(pct),
        Err(_) => {
            warn!(tenant, user, "budget store read timed out, proceeding without downgrade");
            BudgetReading::Unknown
        }
    }
}

fn date_key() -> String {
    chrono::Utc::now().format("%Y%m%d").to_string()
}

/// In-process counter store with UTC-day scoping.
///
/// Counters roll over at UTC midnight by construction: the day is part of
/// the key, and stale keys are dropped lazily on write.
#[derive(Debug, Default)]
pub struct MemoryBudgetStore {
    counters: DashMap<String, f64>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant_key(tenant: &str) -> String {
        format!("budget:tenant:{tenant}:{}", date_key())
    }

    fn user_key(tenant: &str, user: &str) -> String {
        format!("budget:user:{tenant}:{user}:{}", date_key())
    }

    fn read(&self, key: &str) -> f64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0.0)
    }
}

#[async_trait]
impl BudgetStore for MemoryBudgetStore {
    async fn budget_pct(&self, tenant: &str, user: &str, controls: &BudgetControls) -> f64 {
        let tenant_limit = controls.daily_limit_usd_per_tenant;
        let user_limit = controls.daily_limit_usd_per_user;
        if tenant_limit.is_none() && user_limit.is_none() {
            return 0.0;
        }

        let tenant_pct = tenant_limit
            .filter(|l| *l > 0.0)
            .map(|l| self.read(&Self::tenant_key(tenant)) / l * 100.0)
            .unwrap_or(0.0);
        let user_pct = user_limit
            .filter(|l| *l > 0.0)
            .map(|l| self.read(&Self::user_key(tenant, user)) / l * 100.0)
            .unwrap_or(0.0);

        tenant_pct.max(user_pct)
    }

    async fn record_spend(&self, tenant: &str, user: &str, amount_usd: f64) {
        if amount_usd <= 0.0 {
            return;
        }
        let today = date_key();
        // Lazy rollover: drop counters from previous days.
        self.counters.retain(|k, _| k.ends_with(&today));
        *self.counters.entry(Self::tenant_key(tenant)).or_insert(0.0) += amount_usd;
        *self.counters.entry(Self::user_key(tenant, user)).or_insert(0.0) += amount_usd;
    }

    async fn spend(&self, tenant: &str, user: &str) -> SpendCounters {
        SpendCounters {
            tenant_spend_usd: self.read(&Self::tenant_key(tenant)),
            user_spend_usd: self.read(&Self::user_key(tenant, user)),
            date_key: date_key(),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}
