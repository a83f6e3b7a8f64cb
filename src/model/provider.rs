//! Providers: external model endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::metrics::ProviderMetrics;

/// Provider lifecycle status.
///
/// `Pending` until the first heartbeat, then `Healthy`/`Active` while probes
/// succeed, `Error`/`Failed` after a failed probe, `Disabled` by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Healthy,
    Active,
    Pending,
    Error,
    Failed,
    Disabled,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Healthy => "healthy",
            ProviderStatus::Active => "active",
            ProviderStatus::Pending => "pending",
            ProviderStatus::Error => "error",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Disabled => "disabled",
        }
    }

    /// A provider is usable iff it is healthy or active.
    pub fn is_usable(&self) -> bool {
        matches!(self, ProviderStatus::Healthy | ProviderStatus::Active)
    }

    /// Health component of the availability score.
    pub fn health_score(&self) -> f64 {
        match self {
            ProviderStatus::Healthy | ProviderStatus::Active => 100.0,
            ProviderStatus::Pending => 50.0,
            ProviderStatus::Error | ProviderStatus::Failed => 0.0,
            ProviderStatus::Disabled => 25.0,
        }
    }
}

impl std::str::FromStr for ProviderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(ProviderStatus::Healthy),
            "active" => Ok(ProviderStatus::Active),
            "pending" => Ok(ProviderStatus::Pending),
            "error" => Ok(ProviderStatus::Error),
            "failed" => Ok(ProviderStatus::Failed),
            "disabled" => Ok(ProviderStatus::Disabled),
            other => Err(format!("unknown provider status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol family spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    /// OpenAI-compatible: `GET /v1/models`, `POST /v1/chat/completions`.
    OpenaiLike,
    /// Ollama native: `GET /api/tags`, `POST /api/chat`.
    OllamaLike,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::OpenaiLike => "openai-like",
            ProtocolKind::OllamaLike => "ollama-like",
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai-like" | "openai" => Ok(ProtocolKind::OpenaiLike),
            "ollama-like" | "ollama" => Ok(ProtocolKind::OllamaLike),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered external model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    /// Protocol family tag, updated by the heartbeat to the winning candidate.
    #[serde(rename = "type")]
    pub provider_type: ProtocolKind,
    pub endpoint: String,
    /// Model currently used for queries.
    pub model: String,
    /// Operator-preferred model, honored when the endpoint serves it.
    pub configured_model: String,
    pub selected_model: String,
    pub selection_reason: String,
    pub model_score: f64,
    pub selected_gpu: String,
    pub gpu_constraints: String,
    pub description: String,
    /// When set, `key_id` must be present before use.
    pub requires_key: bool,
    pub key_id: String,
    /// API key ciphertext; never plaintext at rest.
    pub api_key_encrypted: Vec<u8>,
    pub owner_id: String,
    pub is_shared: bool,
    pub status: ProviderStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_latency_ms: i64,
    pub last_heartbeat_error: String,
    pub cost_per_mtoken: f64,
    pub context_window: i64,
    pub supports_function: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
    pub tags: Vec<String>,
    pub metrics: ProviderMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            provider_type: ProtocolKind::OpenaiLike,
            endpoint: endpoint.into(),
            model: String::new(),
            configured_model: String::new(),
            selected_model: String::new(),
            selection_reason: String::new(),
            model_score: 0.0,
            selected_gpu: String::new(),
            gpu_constraints: String::new(),
            description: String::new(),
            requires_key: false,
            key_id: String::new(),
            api_key_encrypted: Vec::new(),
            owner_id: String::new(),
            is_shared: true,
            status: ProviderStatus::Pending,
            last_heartbeat_at: None,
            last_heartbeat_latency_ms: 0,
            last_heartbeat_error: String::new(),
            cost_per_mtoken: 0.0,
            context_window: 0,
            supports_function: false,
            supports_vision: false,
            supports_streaming: false,
            tags: Vec::new(),
            metrics: ProviderMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_configured_model(mut self, model: impl Into<String>) -> Self {
        self.configured_model = model.into();
        self
    }

    /// Visible to `user_id` when shared or owned.
    pub fn visible_to(&self, user_id: &str) -> bool {
        self.is_shared || self.owner_id == user_id
    }
}
