//! Prometheus metrics for the routing gateway.
//!
//! Call [`init_metrics`] once at process startup. Every helper is a no-op
//! when metrics were never initialised, so library users and tests run
//! without a registry — observability degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gateway_requests_total` | Counter | `outcome` |
//! | `gateway_classifier_total` | Counter | `result` |
//! | `gateway_fallback_total` | Counter | — |
//! | `gateway_governance_blocked_total` | Counter | — |
//! | `gateway_stage_duration_seconds` | Histogram | `stage` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};

use crate::GatewayError;

/// All gateway metrics, bundled for atomic one-shot initialisation.
pub struct Metrics {
    pub registry: Registry,
    pub requests_total: CounterVec,
    pub classifier_total: CounterVec,
    pub fallback_total: IntCounter,
    pub governance_blocked_total: IntCounter,
    pub stage_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialise the metric registry. Second calls are no-ops.
pub fn init_metrics() -> Result<(), GatewayError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();
    let err = |e: prometheus::Error| GatewayError::Internal(format!("metrics init failed: {e}"));

    let requests_total = CounterVec::new(
        Opts::new("gateway_requests_total", "Requests by terminal outcome"),
        &["outcome"],
    )
    .map_err(err)?;
    registry.register(Box::new(requests_total.clone())).map_err(err)?;

    let classifier_total = CounterVec::new(
        Opts::new("gateway_classifier_total", "Classifier calls by result"),
        &["result"],
    )
    .map_err(err)?;
    registry.register(Box::new(classifier_total.clone())).map_err(err)?;

    let fallback_total =
        IntCounter::new("gateway_fallback_total", "Provider fallback attempts").map_err(err)?;
    registry.register(Box::new(fallback_total.clone())).map_err(err)?;

    let governance_blocked_total = IntCounter::new(
        "gateway_governance_blocked_total",
        "Requests rejected by the risk gate",
    )
    .map_err(err)?;
    registry
        .register(Box::new(governance_blocked_total.clone()))
        .map_err(err)?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new("gateway_stage_duration_seconds", "Pipeline stage latency"),
        &["stage"],
    )
    .map_err(err)?;
    registry.register(Box::new(stage_duration.clone())).map_err(err)?;

    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        classifier_total,
        fallback_total,
        governance_blocked_total,
        stage_duration,
    });
    Ok(())
}

pub fn record_request(outcome: &str) {
    if let Some(m) = METRICS.get() {
        m.requests_total.with_label_values(&[outcome]).inc();
    }
}

pub fn record_classifier(result: &str) {
    if let Some(m) = METRICS.get() {
        m.classifier_total.with_label_values(&[result]).inc();
    }
}

pub fn record_fallback() {
    if let Some(m) = METRICS.get() {
        m.fallback_total.inc();
    }
}

pub fn record_governance_blocked() {
    if let Some(m) = METRICS.get() {
        m.governance_blocked_total.inc();
    }
}

pub fn record_stage_duration(stage: &str, duration: Duration) {
    if let Some(m) = METRICS.get() {
        m.stage_duration
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }
}

/// Render all metrics in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let Some(m) = METRICS.get() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&m.registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
