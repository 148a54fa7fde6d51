//! Decision recording: the append-only audit trail.
//!
//! Every request produces exactly one [`DecisionRecord`], including
//! governance blocks, provider exhaustion, and client cancellation. Sinks
//! receive identical payloads; a sink failure is logged and never crashes
//! the request pipeline. Records are newline-delimited JSON, one complete
//! self-contained object per line.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::error;

use crate::policy::types::PolicyTraceEntry;

/// Snapshot of the classification as it stood at decision time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationSnapshot {
    pub task_type: String,
    pub complexity: String,
    pub confidence: f64,
    pub classified_by: String,
    pub department: String,
    pub required_capability: Vec<String>,
}

/// One provider attempt and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub model: String,
    pub provider: String,
    /// `success`, `transient_error`, `permanent_error`, `terminated_mid_stream`.
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Per-stage latency accounting in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyBreakdown {
    pub pre_analysis_ms: u64,
    pub classifier_ms: u64,
    pub policy_ms: u64,
    pub provider_ms: u64,
    pub total_ms: u64,
}

/// The complete audit record for one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    // Identity
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub user_id: String,
    pub department: String,

    // Policy
    pub policy_version: String,
    pub rule_matched: String,
    pub policy_trace: Vec<PolicyTraceEntry>,
    pub constraints_applied: Vec<String>,

    // Risk
    pub risk_level: String,
    pub risk_rationale: String,
    pub risk_signals: Vec<String>,
    pub audit_required: bool,
    pub data_residency_note: String,

    // Classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationSnapshot>,

    // Selection
    pub model_selected: String,
    pub provider: String,
    pub model_tier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_model_id: Option<String>,
    pub fallback_used: bool,
    pub attempts: Vec<AttemptRecord>,

    // Performance & cost
    pub latency: LatencyBreakdown,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub estimated_cost_usd: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query shape for the audit read endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub risk_level: Option<String>,
    pub department: Option<String>,
    pub audit_required: Option<bool>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, record: &DecisionRecord) -> bool {
        if let Some(level) = &self.risk_level {
            if &record.risk_level != level {
                return false;
            }
        }
        if let Some(dept) = &self.department {
            if &record.department != dept {
                return false;
            }
        }
        if let Some(required) = self.audit_required {
            if record.audit_required != required {
                return false;
            }
        }
        true
    }
}

/// An audit destination. All registered sinks receive identical payloads.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &DecisionRecord);

    /// Paginated filtered read; sinks that cannot read return empty.
    async fn read(&self, filter: &AuditFilter) -> Vec<DecisionRecord>;
}

/// Append-only JSONL file sink.
pub struct JsonlSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    async fn append(&self, record: &DecisionRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "audit record serialization failed");
                return;
            }
        };
        let _guard = self.lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            // Audit writes must never crash the request pipeline.
            error!(path = %self.path.display(), error = %e, "audit append failed");
        }
    }

    async fn read(&self, filter: &AuditFilter) -> Vec<DecisionRecord> {
        let _guard = self.lock.lock().await;
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<DecisionRecord>(l).ok())
            .filter(|r| filter.matches(r))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(100))
            .collect()
    }
}

/// In-memory sink standing in for the persistent DB collaborator.
#[derive(Default)]
pub struct MemorySink {
    records: tokio::sync::Mutex<Vec<DecisionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, record: &DecisionRecord) {
        self.records.lock().await.push(record.clone());
    }

    async fn read(&self, filter: &AuditFilter) -> Vec<DecisionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(100))
            .cloned()
            .collect()
    }
}

/// Fans one record out to every sink with an identical payload.
pub struct DecisionRecorder {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl DecisionRecorder {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub async fn record(&self, record: &DecisionRecord) {
        for sink in &self.sinks {
            sink.append(record).await;
        }
    }

    /// Primary sink read, for the audit endpoint.
    pub async fn read(&self, filter: &AuditFilter) -> Vec<DecisionRecord> {
        match self.sinks.first() {
            Some(sink) => sink.read(filter).await,
            None => Vec::new(),
        }
    }
}
