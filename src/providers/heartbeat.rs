//! Provider heartbeat: probe endpoints, discover models, pick one.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderHeartbeatConfig;
use crate::error::ProviderError;
use crate::model::{Provider, ProviderStatus};
use crate::providers::catalog::ModelCatalog;
use crate::providers::protocol::{Candidate, ProtocolClient, build_candidates};
use crate::providers::registry::ProviderRegistry;

pub const REASON_CONFIGURED: &str = "configured model available";
pub const REASON_FALLBACK: &str = "fallback to first discovered model";
pub const ERROR_NO_ENDPOINT: &str = "no endpoint";

/// Which model to serve and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub model: String,
    pub reason: String,
    pub score: f64,
}

/// Pick a model from what an endpoint serves.
///
/// An operator-configured model wins when served (case-insensitive); then the
/// catalog's best match; then the first discovered model.
pub fn choose_model(
    catalog: &ModelCatalog,
    configured: &str,
    available: &[String],
) -> Option<ModelChoice> {
    let configured = configured.trim();
    if !configured.is_empty()
        && let Some(served) = available.iter().find(|m| m.eq_ignore_ascii_case(configured))
    {
        return Some(ModelChoice {
            model: served.clone(),
            reason: REASON_CONFIGURED.to_string(),
            score: 0.0,
        });
    }
    if let Some(best) = catalog.select_best(available) {
        return Some(ModelChoice {
            model: best.model,
            reason: format!("catalog best match ({})", best.canonical),
            score: best.score,
        });
    }
    available.first().map(|m| ModelChoice {
        model: m.clone(),
        reason: REASON_FALLBACK.to_string(),
        score: 0.0,
    })
}

/// Copy the fields a heartbeat owns onto the latest stored record. Metrics
/// and operator settings are left as stored.
fn apply_heartbeat(probed: &Provider, stored: &mut Provider) {
    if stored.status != ProviderStatus::Disabled {
        stored.status = probed.status;
    }
    stored.provider_type = probed.provider_type;
    stored.endpoint = probed.endpoint.clone();
    stored.model = probed.model.clone();
    stored.selected_model = probed.selected_model.clone();
    stored.selection_reason = probed.selection_reason.clone();
    stored.model_score = probed.model_score;
    stored.last_heartbeat_at = probed.last_heartbeat_at;
    stored.last_heartbeat_latency_ms = probed.last_heartbeat_latency_ms;
    stored.last_heartbeat_error = probed.last_heartbeat_error.clone();
    stored.updated_at = probed.updated_at;
}

struct ProbeSuccess {
    candidate: Candidate,
    models: Vec<String>,
    latency_ms: u64,
}

/// Periodic liveness probe over every registered provider.
pub struct ProviderHeartbeat {
    registry: Arc<ProviderRegistry>,
    catalog: ModelCatalog,
    config: ProviderHeartbeatConfig,
}

impl ProviderHeartbeat {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        catalog: ModelCatalog,
        config: ProviderHeartbeatConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            config,
        }
    }

    /// Probe candidates in order; the first with a non-empty model list wins.
    async fn probe(&self, provider: &Provider, candidates: &[Candidate]) -> Result<ProbeSuccess, String> {
        let api_key = self.registry.api_key(provider).map_err(|e| e.to_string())?;
        let mut last_error = String::from("no candidates");
        for candidate in candidates {
            let client = ProtocolClient::new(
                provider.id.clone(),
                candidate.kind,
                candidate.endpoint.clone(),
                api_key.clone(),
                self.config.probe_timeout,
            );
            let started = Instant::now();
            match tokio::time::timeout(self.config.probe_timeout, client.list_models()).await {
                Ok(Ok(models)) => {
                    return Ok(ProbeSuccess {
                        candidate: candidate.clone(),
                        models,
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        provider_id = %provider.id,
                        protocol = %candidate.kind,
                        endpoint = %candidate.endpoint,
                        error = %e,
                        "Probe failed"
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "probe of {} timed out after {:?}",
                        candidate.endpoint, self.config.probe_timeout
                    );
                }
            }
        }
        Err(last_error)
    }

    /// Run one heartbeat for a provider.
    ///
    /// Probe failures are recorded on the provider, not returned; only store
    /// errors surface.
    pub async fn beat(&self, provider_id: &str) -> Result<Provider, ProviderError> {
        let mut provider = self.registry.get(provider_id).await?;
        if provider.status == ProviderStatus::Disabled {
            return Ok(provider);
        }
        let now = Utc::now();
        provider.last_heartbeat_at = Some(now);
        provider.updated_at = now;

        if provider.endpoint.trim().is_empty() {
            provider.status = ProviderStatus::Failed;
            provider.last_heartbeat_error = ERROR_NO_ENDPOINT.to_string();
            tracing::warn!(provider_id, "Provider has no endpoint");
            return self
                .registry
                .update(provider_id, |stored| apply_heartbeat(&provider, stored))
                .await;
        }

        let candidates = build_candidates(&provider.endpoint);
        let outcome = match tokio::time::timeout(
            self.config.activity_timeout,
            self.probe(&provider, &candidates),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!(
                "heartbeat timed out after {:?}",
                self.config.activity_timeout
            )),
        };

        match outcome {
            Ok(success) => {
                let choice = choose_model(&self.catalog, &provider.configured_model, &success.models);
                provider.status = ProviderStatus::Healthy;
                provider.last_heartbeat_error.clear();
                provider.provider_type = success.candidate.kind;
                provider.endpoint = success.candidate.endpoint;
                provider.last_heartbeat_latency_ms = success.latency_ms as i64;
                if let Some(choice) = choice {
                    provider.selected_model = choice.model.clone();
                    provider.model = choice.model;
                    provider.selection_reason = choice.reason;
                    provider.model_score = choice.score;
                }
                tracing::info!(
                    provider_id,
                    protocol = %provider.provider_type,
                    endpoint = %provider.endpoint,
                    model = %provider.model,
                    latency_ms = success.latency_ms,
                    "Provider healthy"
                );
            }
            Err(error) => {
                provider.status = ProviderStatus::Failed;
                provider.last_heartbeat_error = error;
                tracing::warn!(
                    provider_id,
                    error = %provider.last_heartbeat_error,
                    "Provider heartbeat failed"
                );
            }
        }
        self.registry
            .update(provider_id, |stored| apply_heartbeat(&provider, stored))
            .await
    }

    /// Probe every provider concurrently, one probe chain per provider.
    /// Returns how many providers are healthy afterwards.
    pub async fn beat_all(self: &Arc<Self>) -> Result<usize, ProviderError> {
        let providers = self.registry.db().list_providers().await?;
        let mut tasks = JoinSet::new();
        for provider in providers {
            if provider.status == ProviderStatus::Disabled {
                continue;
            }
            let this = Arc::clone(self);
            tasks.spawn(async move { this.beat(&provider.id).await });
        }

        let mut healthy = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(p)) if p.status.is_usable() => healthy += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Provider heartbeat store error"),
                Err(e) => tracing::error!(error = %e, "Provider heartbeat task panicked"),
            }
        }
        Ok(healthy)
    }

    /// Beat at the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "Provider heartbeat started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.beat_all() => match result {
                            Ok(healthy) => tracing::debug!(healthy, "Provider heartbeat tick"),
                            Err(e) => tracing::error!(error = %e, "Provider heartbeat tick failed"),
                        },
                    }
                }
            }
        }
        tracing::info!("Provider heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_configured_model_wins_case_insensitively() {
        let catalog = ModelCatalog::default();
        let choice = choose_model(
            &catalog,
            "LLAMA3.1:8B",
            &names(&["qwen2.5-coder:7b", "llama3.1:8b"]),
        )
        .unwrap();
        assert_eq!(choice.model, "llama3.1:8b");
        assert_eq!(choice.reason, REASON_CONFIGURED);
        assert_eq!(choice.score, 0.0);
    }

    #[test]
    fn test_catalog_then_fallback() {
        let catalog = ModelCatalog::default();
        let choice = choose_model(&catalog, "missing", &names(&["odd-model", "llama3.1:8b"])).unwrap();
        assert_eq!(choice.model, "llama3.1:8b");
        assert!(choice.score > 0.0);

        let choice = choose_model(&catalog, "", &names(&["odd-model", "other"])).unwrap();
        assert_eq!(choice.model, "odd-model");
        assert_eq!(choice.reason, REASON_FALLBACK);

        assert!(choose_model(&catalog, "", &[]).is_none());
    }

    #[test]
    fn test_apply_heartbeat_keeps_stored_metrics() {
        let mut probed = Provider::new("local", "Local", "http://127.0.0.1:8000/v1");
        probed.status = ProviderStatus::Healthy;
        probed.model = "llama3.1:8b".to_string();
        probed.last_heartbeat_latency_ms = 12;

        let mut stored = Provider::new("local", "Local", "http://127.0.0.1:8000/v1");
        stored.metrics.record_success(40, 100);
        stored.metrics.record_failure(90);

        apply_heartbeat(&probed, &mut stored);
        assert_eq!(stored.status, ProviderStatus::Healthy);
        assert_eq!(stored.model, "llama3.1:8b");
        assert_eq!(stored.last_heartbeat_latency_ms, 12);
        assert_eq!(stored.metrics.total_requests, 2);
    }
}
