//! Policy store: atomic snapshots with hot reload.
//!
//! The live policy set is one immutable [`PolicySnapshot`] behind an
//! [`ArcSwap`]. A request pins the snapshot once at decision start and keeps
//! that `Arc` for its whole lifetime, so a concurrent reload can never show
//! it a torn or mixed view; the old snapshot is freed when the last
//! in-flight request drops its reference. Reloads validate the entire
//! directory before swapping — a half-loaded policy set is never visible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use super::loader;
use super::types::DepartmentPolicy;
use crate::GatewayError;

/// Immutable view of every loaded policy.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    /// Keyed by `(tenant_id, department)`; `None` tenant means global.
    policies: HashMap<(Option<String>, String), Arc<DepartmentPolicy>>,
    base: Option<Arc<DepartmentPolicy>>,
}

impl PolicySnapshot {
    fn from_loaded(loaded: Vec<(DepartmentPolicy, bool)>) -> Self {
        let mut policies = HashMap::new();
        let mut base = None;
        for (policy, is_base) in loaded {
            let policy = Arc::new(policy);
            if is_base {
                base = Some(Arc::clone(&policy));
            }
            policies.insert(
                (policy.tenant_id.clone(), policy.department.clone()),
                policy,
            );
        }
        Self { policies, base }
    }

    /// Resolve the policy for an identity: tenant-scoped first, then the
    /// global department policy, then the base policy.
    pub fn resolve(
        &self,
        tenant_id: Option<&str>,
        department: &str,
    ) -> Option<Arc<DepartmentPolicy>> {
        if let Some(tenant) = tenant_id {
            let key = (Some(tenant.to_string()), department.to_string());
            if let Some(p) = self.policies.get(&key) {
                return Some(Arc::clone(p));
            }
        }
        if let Some(p) = self.policies.get(&(None, department.to_string())) {
            return Some(Arc::clone(p));
        }
        self.base.as_ref().map(Arc::clone)
    }

    /// All loaded policies, for the inspection endpoint.
    pub fn all(&self) -> Vec<Arc<DepartmentPolicy>> {
        let mut v: Vec<_> = self.policies.values().map(Arc::clone).collect();
        v.sort_by(|a, b| a.department.cmp(&b.department));
        v
    }

    pub fn departments(&self) -> Vec<String> {
        let mut v: Vec<_> = self.policies.keys().map(|(_, d)| d.clone()).collect();
        v.sort();
        v.dedup();
        v
    }
}

/// Holds the live snapshot and knows how to rebuild it from disk.
pub struct PolicyStore {
    dir: PathBuf,
    snapshot: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Load the initial snapshot from a policy directory.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let dir = dir.into();
        let loaded = loader::load_dir(&dir)?;
        Ok(Self {
            dir,
            snapshot: ArcSwap::from_pointee(PolicySnapshot::from_loaded(loaded)),
        })
    }

    /// Build a store directly from policies (tests, simulation).
    pub fn from_policies(policies: Vec<(DepartmentPolicy, bool)>) -> Self {
        Self {
            dir: PathBuf::new(),
            snapshot: ArcSwap::from_pointee(PolicySnapshot::from_loaded(policies)),
        }
    }

    /// Pin the current snapshot. Cheap: one atomic load.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    /// Re-read the directory and swap in the new snapshot atomically.
    ///
    /// On any load or validation error the current snapshot stays live and
    /// the error is returned. Returns the number of policies loaded.
    pub fn reload(&self) -> Result<usize, GatewayError> {
        let loaded = loader::load_dir(&self.dir)?;
        let count = loaded.len();
        self.snapshot.store(Arc::new(PolicySnapshot::from_loaded(loaded)));
        info!(count, "policies reloaded");
        Ok(count)
    }

    /// Swap in a prebuilt snapshot (tests).
    pub fn swap(&self, policies: Vec<(DepartmentPolicy, bool)>) {
        self.snapshot.store(Arc::new(PolicySnapshot::from_loaded(policies)));
    }
}

/// Watch the policy directory and reload on changes.
///
/// Debounced; an invalid edit is logged and rejected while the current
/// snapshot keeps serving. Dropping the returned watcher stops watching.
pub fn spawn_policy_watcher(
    store: Arc<PolicyStore>,
) -> Result<RecommendedWatcher, GatewayError> {
    let (notify_tx, notify_rx) = std::sync::mpsc::channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = notify_tx.send(event);
            }
        },
        notify::Config::default(),
    )
    .map_err(|e| GatewayError::Config(format!("policy watcher: {e}")))?;

    watcher
        .watch(Path::new(&store.dir), RecursiveMode::NonRecursive)
        .map_err(|e| GatewayError::Config(format!("policy watcher: {e}")))?;

    tokio::spawn(async move {
        let debounce = Duration::from_millis(500);
        let mut last_reload = std::time::Instant::now()
            .checked_sub(debounce)
            .unwrap_or_else(std::time::Instant::now);

        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let mut should_reload = false;
            while let Ok(event) = notify_rx.try_recv() {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)) {
                    should_reload = true;
                }
            }

            if should_reload && last_reload.elapsed() >= debounce {
                last_reload = std::time::Instant::now();
                match store.reload() {
                    Ok(count) => info!(count, "policy hot-reload applied"),
                    Err(e) => warn!(error = %e, "policy hot-reload rejected, keeping current snapshot"),
                }
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelTier;
    use crate::policy::types::{BudgetControls, RuleAction};

    fn policy(department: &str, tenant: Option<&str>, version: &str) -> DepartmentPolicy {
        DepartmentPolicy {
            tenant_id: tenant.map(|t| t.to_string()),
            department: department.to_string(),
            version: version.to_string(),
            description: String::new(),
            rules: Vec::new(),
            budget: BudgetControls::default(),
            base_fallback: Some(RuleAction {
                primary_model: Some("haiku-fast".into()),
                model_tier: ModelTier::FastCheap,
                ..RuleAction::default()
            }),
        }
    }

    #[test]
    fn test_resolve_prefers_tenant_scoped_policy() {
        let store = PolicyStore::from_policies(vec![
            (policy("rd", None, "global"), false),
            (policy("rd", Some("acme"), "tenant"), false),
        ]);
        let snap = store.snapshot();
        let p = snap.resolve(Some("acme"), "rd").expect("test: resolves");
        assert_eq!(p.version, "tenant");
        let p = snap.resolve(Some("other"), "rd").expect("test: resolves");
        assert_eq!(p.version, "global");
    }

    #[test]
    fn test_resolve_falls_back_to_base() {
        let store = PolicyStore::from_policies(vec![(policy("general", None, "base"), true)]);
        let snap = store.snapshot();
        let p = snap.resolve(None, "sales").expect("test: base fallback");
        assert_eq!(p.version, "base");
    }

    #[test]
    fn test_resolve_unknown_without_base_is_none() {
        let store = PolicyStore::from_policies(vec![(policy("rd", None, "v"), false)]);
        assert!(store.snapshot().resolve(None, "sales").is_none());
    }

    #[test]
    fn test_pinned_snapshot_survives_swap() {
        let store = PolicyStore::from_policies(vec![(policy("rd", None, "v1"), false)]);
        let pinned = store.snapshot();
        store.swap(vec![(policy("rd", None, "v2"), false)]);

        // The pinned snapshot still serves v1; a fresh pin sees v2.
        assert_eq!(pinned.resolve(None, "rd").expect("test: old").version, "v1");
        assert_eq!(
            store.snapshot().resolve(None, "rd").expect("test: new").version,
            "v2"
        );
    }

    #[test]
    fn test_reload_failure_keeps_current_snapshot() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        std::fs::write(
            dir.path().join("rd.yaml"),
            "department: rd\nversion: 'v1'\n",
        )
        .expect("test: write");

        let store = PolicyStore::load(dir.path()).expect("test: initial load");
        assert_eq!(store.snapshot().resolve(None, "rd").expect("test").version, "v1");

        // Break the file, reload must fail and keep v1 live.
        std::fs::write(dir.path().join("rd.yaml"), "department: ''\n").expect("test: write");
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().resolve(None, "rd").expect("test").version, "v1");
    }

    #[test]
    fn test_reload_applies_new_version_atomically() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        std::fs::write(dir.path().join("rd.yaml"), "department: rd\nversion: 'v1'\n")
            .expect("test: write");
        let store = PolicyStore::load(dir.path()).expect("test: initial load");

        std::fs::write(dir.path().join("rd.yaml"), "department: rd\nversion: 'v2'\n")
            .expect("test: write");
        let count = store.reload().expect("test: reload");
        assert_eq!(count, 1);
        assert_eq!(store.snapshot().resolve(None, "rd").expect("test").version, "v2");
    }

    #[test]
    fn test_departments_sorted_and_deduplicated() {
        let store = PolicyStore::from_policies(vec![
            (policy("sales", None, "v"), false),
            (policy("rd", None, "v"), false),
            (policy("rd", Some("acme"), "v"), false),
        ]);
        assert_eq!(store.snapshot().departments(), vec!["rd", "sales"]);
    }
}
