//! Protocol clients for provider endpoints.
//!
//! Two families are spoken: OpenAI-compatible (`/v1/models`,
//! `/v1/chat/completions`) and Ollama native (`/api/tags`, `/api/chat`).
//! A bare endpoint is fanned out into candidates that the heartbeat probes
//! in order.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProviderError;
use crate::model::ProtocolKind;

/// Ports probed when the endpoint does not name one.
pub const DEFAULT_PORTS: [u16; 2] = [8000, 11434];

/// One (protocol, base URL) pair to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: ProtocolKind,
    pub endpoint: String,
}

impl Candidate {
    fn new(kind: ProtocolKind, endpoint: String) -> Self {
        Self { kind, endpoint }
    }
}

/// Whether the authority of `url` spells out a port. `Url::port` hides ports
/// equal to the scheme default, so the raw text is checked instead.
fn authority_has_port(url: &str) -> bool {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let after_host = match host_port.rfind(']') {
        Some(end) => &host_port[end + 1..],
        None => host_port,
    };
    after_host.contains(':')
}

/// Expand a provider endpoint into ordered probe candidates.
///
/// The scheme defaults to `http`. Without a port the endpoint fans out to
/// [`DEFAULT_PORTS`]; each port yields an OpenAI-like `/v1` candidate then an
/// Ollama-like root candidate. An endpoint that already ends in `/v1` with an
/// explicit port is probed first. Duplicates are dropped, order preserved.
pub fn build_candidates(endpoint: &str) -> Vec<Candidate> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };
    let url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(endpoint, error = %e, "Unparseable provider endpoint");
            return Vec::new();
        }
    };
    let Some(host) = url.host_str() else {
        return Vec::new();
    };
    let scheme = url.scheme();

    let mut out = Vec::new();
    let explicit_port = if authority_has_port(&with_scheme) {
        url.port_or_known_default()
    } else {
        None
    };
    if let Some(port) = explicit_port
        && url.path().trim_end_matches('/').ends_with("/v1")
    {
        out.push(Candidate::new(
            ProtocolKind::OpenaiLike,
            format!("{}://{}:{}/v1", scheme, host, port),
        ));
    }

    let ports: Vec<u16> = match explicit_port {
        Some(port) => vec![port],
        None => DEFAULT_PORTS.to_vec(),
    };
    for port in ports {
        let base = format!("{}://{}:{}", scheme, host, port);
        out.push(Candidate::new(ProtocolKind::OpenaiLike, format!("{}/v1", base)));
        out.push(Candidate::new(ProtocolKind::OllamaLike, base));
    }

    let mut seen = Vec::with_capacity(out.len());
    out.retain(|c| {
        let key = (c.kind, c.endpoint.clone());
        if seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
    out
}

// ==================== Wire types ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Completion text plus the token count the endpoint reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tokens_used: u64,
}

#[derive(Deserialize)]
struct OpenAiModels {
    data: Vec<OpenAiModel>,
}

#[derive(Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

// ==================== Client ====================

/// HTTP client bound to one provider endpoint and protocol.
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    provider_id: String,
    kind: ProtocolKind,
    endpoint: String,
    api_key: Option<SecretString>,
    http: reqwest::Client,
}

impl ProtocolClient {
    pub fn new(
        provider_id: impl Into<String>,
        kind: ProtocolKind,
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    fn request_failed(&self, reason: impl std::fmt::Display) -> ProviderError {
        ProviderError::RequestFailed {
            provider_id: self.provider_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn invalid_response(&self, reason: impl std::fmt::Display) -> ProviderError {
        ProviderError::InvalidResponse {
            provider_id: self.provider_id.clone(),
            reason: reason.to_string(),
        }
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status.as_u16() {
            401 | 403 => Err(ProviderError::AuthFailed {
                provider_id: self.provider_id.clone(),
                status: status.as_u16(),
            }),
            429 => Err(ProviderError::RateLimited {
                provider_id: self.provider_id.clone(),
            }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                let snippet: String = body.chars().take(200).collect();
                Err(self.request_failed(format!("HTTP {}: {}", status, snippet)))
            }
        }
    }

    /// Models served by the endpoint. An empty list is an error.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = match self.kind {
            ProtocolKind::OpenaiLike => format!("{}/models", self.endpoint),
            ProtocolKind::OllamaLike => format!("{}/api/tags", self.endpoint),
        };
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| self.request_failed(e))?;
        let response = self.check_status(response).await?;

        let models: Vec<String> = match self.kind {
            ProtocolKind::OpenaiLike => response
                .json::<OpenAiModels>()
                .await
                .map_err(|e| self.invalid_response(e))?
                .data
                .into_iter()
                .map(|m| m.id)
                .collect(),
            ProtocolKind::OllamaLike => response
                .json::<OllamaTags>()
                .await
                .map_err(|e| self.invalid_response(e))?
                .models
                .into_iter()
                .map(|m| m.name)
                .collect(),
        };
        if models.is_empty() {
            return Err(self.invalid_response("empty model list"));
        }
        Ok(models)
    }

    /// Run one non-streaming chat completion.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        match self.kind {
            ProtocolKind::OpenaiLike => {
                let url = format!("{}/chat/completions", self.endpoint);
                let response = self
                    .authorize(self.http.post(&url).json(request))
                    .send()
                    .await
                    .map_err(|e| self.request_failed(e))?;
                let body: OpenAiChatResponse = self
                    .check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| self.invalid_response(e))?;
                let content = body
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message.content)
                    .ok_or_else(|| self.invalid_response("no choices in completion"))?;
                Ok(ChatResponse {
                    content,
                    tokens_used: body.usage.map(|u| u.total_tokens).unwrap_or(0),
                })
            }
            ProtocolKind::OllamaLike => {
                let url = format!("{}/api/chat", self.endpoint);
                let payload = OllamaChatRequest {
                    model: &request.model,
                    messages: &request.messages,
                    stream: false,
                    options: OllamaOptions {
                        temperature: request.temperature,
                        num_predict: request.max_tokens,
                    },
                };
                let response = self
                    .authorize(self.http.post(&url).json(&payload))
                    .send()
                    .await
                    .map_err(|e| self.request_failed(e))?;
                let body: OllamaChatResponse = self
                    .check_status(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| self.invalid_response(e))?;
                Ok(ChatResponse {
                    content: body.message.content,
                    tokens_used: body.prompt_eval_count + body.eval_count,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(candidates: &[Candidate]) -> Vec<(ProtocolKind, &str)> {
        candidates
            .iter()
            .map(|c| (c.kind, c.endpoint.as_str()))
            .collect()
    }

    #[test]
    fn test_bare_host_fans_out_to_default_ports() {
        let candidates = build_candidates("http://host");
        assert_eq!(
            pairs(&candidates),
            vec![
                (ProtocolKind::OpenaiLike, "http://host:8000/v1"),
                (ProtocolKind::OllamaLike, "http://host:8000"),
                (ProtocolKind::OpenaiLike, "http://host:11434/v1"),
                (ProtocolKind::OllamaLike, "http://host:11434"),
            ]
        );
    }

    #[test]
    fn test_scheme_defaults_to_http() {
        let candidates = build_candidates("gpu-box:9000");
        assert_eq!(
            pairs(&candidates),
            vec![
                (ProtocolKind::OpenaiLike, "http://gpu-box:9000/v1"),
                (ProtocolKind::OllamaLike, "http://gpu-box:9000"),
            ]
        );
    }

    #[test]
    fn test_explicit_v1_endpoint_is_hoisted_without_duplicates() {
        let candidates = build_candidates("https://api.example.com:8443/v1/");
        assert_eq!(
            pairs(&candidates),
            vec![
                (ProtocolKind::OpenaiLike, "https://api.example.com:8443/v1"),
                (ProtocolKind::OllamaLike, "https://api.example.com:8443"),
            ]
        );
    }

    #[test]
    fn test_scheme_default_port_is_kept_when_written() {
        let candidates = build_candidates("http://host:80/v1");
        assert_eq!(
            pairs(&candidates),
            vec![
                (ProtocolKind::OpenaiLike, "http://host:80/v1"),
                (ProtocolKind::OllamaLike, "http://host:80"),
            ]
        );

        let candidates = build_candidates("https://api.example.com:443");
        assert_eq!(
            pairs(&candidates),
            vec![
                (ProtocolKind::OpenaiLike, "https://api.example.com:443/v1"),
                (ProtocolKind::OllamaLike, "https://api.example.com:443"),
            ]
        );
    }

    #[test]
    fn test_authority_has_port() {
        assert!(authority_has_port("http://host:80/v1"));
        assert!(authority_has_port("http://user:pw@host:8000"));
        assert!(authority_has_port("http://[::1]:11434"));
        assert!(!authority_has_port("http://user:pw@host/v1"));
        assert!(!authority_has_port("http://[::1]/v1"));
        assert!(!authority_has_port("https://host/path:with:colons"));
    }

    #[test]
    fn test_empty_endpoint_has_no_candidates() {
        assert!(build_candidates("").is_empty());
        assert!(build_candidates("   ").is_empty());
    }
}
