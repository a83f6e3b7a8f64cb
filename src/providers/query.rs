//! Chat completion against a registered provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::providers::protocol::{ChatMessage, ChatRequest};
use crate::providers::registry::ProviderRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    pub provider_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

impl QueryInput {
    pub fn new(provider_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            provider_id: provider_id.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub provider_id: String,
    pub model: String,
    pub response: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

/// Runs one chat completion and records its metrics on the provider.
pub struct ProviderQueryActivity {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl ProviderQueryActivity {
    pub fn new(registry: Arc<ProviderRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub async fn run(&self, input: QueryInput) -> Result<QueryOutput, ProviderError> {
        let provider = self.registry.get(&input.provider_id).await?;
        if !provider.status.is_usable() {
            return Err(ProviderError::Unavailable {
                provider_id: provider.id,
                reason: format!("status is {}", provider.status),
            });
        }
        let model = if provider.selected_model.is_empty() {
            provider.model.clone()
        } else {
            provider.selected_model.clone()
        };
        if model.is_empty() {
            return Err(ProviderError::Unavailable {
                provider_id: provider.id,
                reason: "no model selected".to_string(),
            });
        }

        let client = self.registry.client(&provider).await?;
        let request = ChatRequest {
            model: model.clone(),
            messages: input.messages,
            temperature: input.temperature,
            max_tokens: input.max_tokens,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, client.chat(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.timeout)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Err(e) = self
                    .registry
                    .record_success(&provider.id, latency_ms, response.tokens_used)
                    .await
                {
                    tracing::warn!(provider_id = %provider.id, error = %e, "Failed to record provider metrics");
                }
                tracing::debug!(
                    provider_id = %provider.id,
                    model = %model,
                    tokens = response.tokens_used,
                    latency_ms,
                    "Provider query completed"
                );
                Ok(QueryOutput {
                    provider_id: provider.id,
                    model,
                    response: response.content,
                    tokens_used: response.tokens_used,
                    latency_ms,
                })
            }
            Err(e) => {
                if let Err(record_err) = self.registry.record_failure(&provider.id, latency_ms).await {
                    tracing::warn!(provider_id = %provider.id, error = %record_err, "Failed to record provider metrics");
                }
                Err(e)
            }
        }
    }
}
