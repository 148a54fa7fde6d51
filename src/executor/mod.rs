//! Executor: runs the committed route against providers.
//!
//! At most `1 + len(fallbacks)` attempts. Transient failures advance the
//! chain after a capped exponential backoff; non-retryable failures
//! short-circuit. Streaming has weaker failure semantics by design: once a
//! completion delta has been forwarded, a later failure is terminal — the
//! proxy cannot take emitted bytes back — so fallback only happens while
//! the provider stream has produced nothing.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::audit::AttemptRecord;
use crate::catalog::ModelCatalog;
use crate::metrics;
use crate::policy::SelectedRoute;
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse, StreamEvent, UsageInfo};
use crate::providers::{EventStream, ProviderRegistry};
use crate::GatewayError;

/// First backoff delay between fallback attempts.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(1);

fn backoff_delay(attempt: usize) -> Duration {
    let exp = BACKOFF_INITIAL.saturating_mul(1u32 << attempt.min(4) as u32);
    exp.min(BACKOFF_CAP)
}

/// Result of a buffered execution.
#[derive(Debug)]
pub struct BufferedExecution {
    pub response: ChatCompletionResponse,
    pub model_used: String,
    pub provider_used: String,
    pub fallback_used: bool,
    pub attempts: Vec<AttemptRecord>,
}

/// Terminal state of a streaming execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed,
    /// Failed after at least one delta reached the client.
    TerminatedMidStream(String),
    /// Every candidate failed before producing output.
    AllProvidersFailed(String),
    /// The client went away; the provider stream was dropped.
    ClientCancelled,
}

/// Summary delivered once a streaming execution ends, for the audit record.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub model_used: String,
    pub provider_used: String,
    pub fallback_used: bool,
    pub attempts: Vec<AttemptRecord>,
    pub usage: Option<UsageInfo>,
    pub outcome: StreamOutcome,
}

fn attempt_record(model: &str, provider: &str, outcome: &str, status: Option<u16>) -> AttemptRecord {
    AttemptRecord {
        model: model.to_string(),
        provider: provider.to_string(),
        outcome: outcome.to_string(),
        status,
    }
}

fn status_of(error: &GatewayError) -> Option<u16> {
    match error {
        GatewayError::Provider { status, .. } => Some(*status),
        _ => None,
    }
}

/// Orchestrates provider calls for one decision.
pub struct Executor {
    registry: Arc<ProviderRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// The (model, provider) chain for a route: primary first, then
    /// fallbacks with providers resolved through the catalog.
    fn chain(route: &SelectedRoute, catalog: &ModelCatalog) -> Vec<(String, String)> {
        let mut chain = vec![(route.primary_model.clone(), route.provider.clone())];
        for model in &route.fallback_models {
            if let Some(entry) = catalog.get(model) {
                chain.push((model.clone(), entry.provider.clone()));
            }
        }
        chain
    }

    /// Buffered execution with full fallback semantics.
    pub async fn execute_buffered(
        &self,
        route: &SelectedRoute,
        catalog: &ModelCatalog,
        request: &ChatCompletionRequest,
    ) -> Result<BufferedExecution, (GatewayError, Vec<AttemptRecord>)> {
        let chain = Self::chain(route, catalog);
        let mut attempts = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for (idx, (model, provider_name)) in chain.iter().enumerate() {
            let Some(provider) = self.registry.get(provider_name) else {
                warn!(provider = %provider_name, "provider not registered, skipping");
                attempts.push(attempt_record(model, provider_name, "provider_not_registered", None));
                continue;
            };

            if idx > 0 {
                metrics::record_fallback();
                info!(model = %model, provider = %provider_name, "fallback attempt");
                tokio::time::sleep(backoff_delay(idx - 1)).await;
            }

            let _permit = self.registry.acquire(provider_name).await;
            match provider.chat(request, model).await {
                Ok(response) => {
                    self.registry.record_success(provider_name);
                    attempts.push(attempt_record(model, provider_name, "success", None));
                    return Ok(BufferedExecution {
                        response,
                        model_used: model.clone(),
                        provider_used: provider_name.clone(),
                        fallback_used: idx > 0,
                        attempts,
                    });
                }
                Err(e) => {
                    self.registry.record_failure(provider_name);
                    let status = status_of(&e);
                    if e.is_transient() {
                        warn!(model = %model, provider = %provider_name, error = %e, "transient provider failure");
                        attempts.push(attempt_record(model, provider_name, "transient_error", status));
                        last_error = Some(e);
                        continue;
                    }
                    // Semantic failure: no further fallbacks.
                    attempts.push(attempt_record(model, provider_name, "permanent_error", status));
                    return Err((e, attempts));
                }
            }
        }

        let models_tried = chain.iter().map(|(m, _)| m.clone()).collect();
        Err((
            GatewayError::AllProvidersFailed {
                models_tried,
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            },
            attempts,
        ))
    }

    /// Streaming execution.
    ///
    /// Returns the normalized event stream plus a receiver that resolves to
    /// the [`StreamSummary`] when the stream ends for any reason. The driver
    /// task survives client disconnects so the summary (and therefore the
    /// audit record) always lands.
    pub async fn execute_stream(
        &self,
        route: &SelectedRoute,
        catalog: &ModelCatalog,
        request: &ChatCompletionRequest,
    ) -> (EventStream, oneshot::Receiver<StreamSummary>) {
        let chain = Self::chain(route, catalog);
        let registry = Arc::clone(&self.registry);
        let request = request.clone();
        let primary = chain
            .first()
            .cloned()
            .unwrap_or_else(|| (route.primary_model.clone(), route.provider.clone()));

        // Zero-capacity channel: each send parks until the consumer reads,
        // so a hung-up client is observed on the very next event.
        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<StreamEvent, GatewayError>>(0);
        let (summary_tx, summary_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut attempts: Vec<AttemptRecord> = Vec::new();
            let mut usage: Option<UsageInfo> = None;
            let mut last_error: Option<GatewayError> = None;

            for (idx, (model, provider_name)) in chain.iter().enumerate() {
                let Some(provider) = registry.get(provider_name) else {
                    attempts.push(attempt_record(model, provider_name, "provider_not_registered", None));
                    continue;
                };

                if idx > 0 {
                    metrics::record_fallback();
                    info!(model = %model, provider = %provider_name, "fallback attempt (stream)");
                    tokio::time::sleep(backoff_delay(idx - 1)).await;
                }

                let _permit = registry.acquire(provider_name).await;
                let mut stream = match provider.chat_stream(&request, model).await {
                    Ok(s) => s,
                    Err(e) => {
                        registry.record_failure(provider_name);
                        let status = status_of(&e);
                        if e.is_transient() {
                            attempts.push(attempt_record(model, provider_name, "transient_error", status));
                            last_error = Some(e);
                            continue;
                        }
                        attempts.push(attempt_record(model, provider_name, "permanent_error", status));
                        let _ = tx.send(Err(e)).await;
                        let _ = summary_tx.send(StreamSummary {
                            model_used: model.clone(),
                            provider_used: provider_name.clone(),
                            fallback_used: idx > 0,
                            attempts,
                            usage,
                            outcome: StreamOutcome::AllProvidersFailed(
                                "non-retryable provider error".into(),
                            ),
                        });
                        return;
                    }
                };

                let mut emitted = false;
                loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            if let StreamEvent::Usage(u) = &event {
                                usage = Some(u.clone());
                            }
                            emitted = true;
                            if tx.send(Ok(event)).await.is_err() {
                                // Client went away; drop the provider stream.
                                attempts.push(attempt_record(model, provider_name, "client_cancelled", None));
                                let _ = summary_tx.send(StreamSummary {
                                    model_used: model.clone(),
                                    provider_used: provider_name.clone(),
                                    fallback_used: idx > 0,
                                    attempts,
                                    usage,
                                    outcome: StreamOutcome::ClientCancelled,
                                });
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            registry.record_failure(provider_name);
                            let status = status_of(&e);
                            if emitted {
                                // Bytes already reached the client: terminal.
                                attempts.push(attempt_record(
                                    model,
                                    provider_name,
                                    "terminated_mid_stream",
                                    status,
                                ));
                                let message = e.to_string();
                                let _ = tx.send(Err(e)).await;
                                let _ = summary_tx.send(StreamSummary {
                                    model_used: model.clone(),
                                    provider_used: provider_name.clone(),
                                    fallback_used: idx > 0,
                                    attempts,
                                    usage,
                                    outcome: StreamOutcome::TerminatedMidStream(message),
                                });
                                return;
                            }
                            // Nothing emitted yet: fallback is safe.
                            attempts.push(attempt_record(model, provider_name, "transient_error", status));
                            last_error = Some(e);
                            break;
                        }
                        None => {
                            registry.record_success(provider_name);
                            attempts.push(attempt_record(model, provider_name, "success", None));
                            let _ = summary_tx.send(StreamSummary {
                                model_used: model.clone(),
                                provider_used: provider_name.clone(),
                                fallback_used: idx > 0,
                                attempts,
                                usage,
                                outcome: StreamOutcome::Completed,
                            });
                            return;
                        }
                    }
                }
            }

            let message = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no providers available".to_string());
            let models_tried = attempts.iter().map(|a| a.model.clone()).collect();
            let _ = tx
                .send(Err(GatewayError::AllProvidersFailed {
                    models_tried,
                    last_error: message.clone(),
                }))
                .await;
            let _ = summary_tx.send(StreamSummary {
                model_used: primary.0,
                provider_used: primary.1,
                fallback_used: false,
                attempts,
                usage,
                outcome: StreamOutcome::AllProvidersFailed(message),
            });
        });

        (Box::pin(rx), summary_rx)
    }
}
