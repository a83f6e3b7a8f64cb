//! Provider registry: persisted provider records plus cached protocol clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tokio::sync::{Mutex, RwLock};

use crate::db::Database;
use crate::error::ProviderError;
use crate::events::{Event, EventBus, types};
use crate::model::{ProtocolKind, Provider};
use crate::providers::protocol::ProtocolClient;
use crate::secrets::SecretsCrypto;

const EVENT_SOURCE: &str = "provider-registry";

/// Default request timeout of cached clients.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(120);

struct CachedClient {
    kind: ProtocolKind,
    endpoint: String,
    key_id: String,
    client: Arc<ProtocolClient>,
}

/// Tracks providers and hands out protocol clients for them.
///
/// Persistence is delegated to the store. Clients are cached per provider and
/// rebuilt when the endpoint, protocol, or key changes; a caller may briefly
/// hold a stale client after an upsert.
pub struct ProviderRegistry {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    crypto: Option<Arc<SecretsCrypto>>,
    clients: RwLock<HashMap<String, CachedClient>>,
    /// Serializes read-modify-write of provider records.
    write_lock: Mutex<()>,
    client_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(db: Arc<dyn Database>, events: Arc<EventBus>) -> Self {
        Self {
            db,
            events,
            crypto: None,
            clients: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_crypto(mut self, crypto: Arc<SecretsCrypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn publish(&self, event_type: &str, provider: &Provider) {
        self.events.publish(Event::new(event_type, EVENT_SOURCE).with_data(serde_json::json!({
            "provider_id": provider.id,
            "status": provider.status.as_str(),
            "type": provider.provider_type.as_str(),
            "endpoint": provider.endpoint,
            "model": provider.model,
        })));
    }

    /// Insert or update a provider. A supplied API key is sealed before it is
    /// stored.
    pub async fn register(
        &self,
        mut provider: Provider,
        api_key: Option<&SecretString>,
    ) -> Result<Provider, ProviderError> {
        if provider.id.trim().is_empty() {
            return Err(ProviderError::InvalidResponse {
                provider_id: String::new(),
                reason: "provider id is required".to_string(),
            });
        }
        if let Some(key) = api_key {
            let crypto = self.crypto.as_ref().ok_or_else(|| ProviderError::Unavailable {
                provider_id: provider.id.clone(),
                reason: "no encryption service configured for API keys".to_string(),
            })?;
            if provider.key_id.is_empty() {
                provider.key_id = SecretsCrypto::generate_key_id();
            }
            provider.api_key_encrypted = crypto.encrypt_str(&provider.key_id, key)?;
        }

        let existed = match self.db.get_provider(&provider.id).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        provider.updated_at = Utc::now();
        self.db.upsert_provider(&provider).await?;
        self.clients.write().await.remove(&provider.id);

        let event_type = if existed {
            types::PROVIDER_UPDATED
        } else {
            types::PROVIDER_REGISTERED
        };
        tracing::info!(provider_id = %provider.id, endpoint = %provider.endpoint, existed, "Provider registered");
        self.publish(event_type, &provider);
        Ok(provider)
    }

    pub async fn get(&self, id: &str) -> Result<Provider, ProviderError> {
        self.db.get_provider(id).await.map_err(|e| {
            if e.is_not_found() {
                ProviderError::NotFound(id.to_string())
            } else {
                e.into()
            }
        })
    }

    /// Providers visible to `user_id` (shared or owned).
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Provider>, ProviderError> {
        Ok(self
            .db
            .list_providers()
            .await?
            .into_iter()
            .filter(|p| p.visible_to(user_id))
            .collect())
    }

    /// Healthy or active providers, best overall score first.
    pub async fn list_usable(&self) -> Result<Vec<Provider>, ProviderError> {
        let mut usable: Vec<Provider> = self
            .db
            .list_providers()
            .await?
            .into_iter()
            .filter(|p| p.status.is_usable())
            .collect();
        usable.sort_by(|a, b| {
            b.metrics
                .overall_score(b.status)
                .total_cmp(&a.metrics.overall_score(a.status))
        });
        Ok(usable)
    }

    /// Re-read a provider, apply `change` and persist it, then publish the
    /// update. Runs under the same lock as metric writes so fields `change`
    /// leaves alone keep their latest stored values.
    pub async fn update<F>(&self, id: &str, change: F) -> Result<Provider, ProviderError>
    where
        F: FnOnce(&mut Provider),
    {
        let provider = {
            let _guard = self.write_lock.lock().await;
            let mut provider = self.get(id).await?;
            change(&mut provider);
            self.db.upsert_provider(&provider).await?;
            provider
        };
        self.publish(types::PROVIDER_UPDATED, &provider);
        Ok(provider)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        let provider = self.get(id).await?;
        self.db.delete_provider(id).await?;
        self.clients.write().await.remove(id);
        tracing::info!(provider_id = id, "Provider deleted");
        self.publish(types::PROVIDER_DELETED, &provider);
        Ok(())
    }

    /// Protocol client for a provider, built on first use.
    pub async fn client(&self, provider: &Provider) -> Result<Arc<ProtocolClient>, ProviderError> {
        if let Some(cached) = self.clients.read().await.get(&provider.id)
            && cached.kind == provider.provider_type
            && cached.endpoint == provider.endpoint
            && cached.key_id == provider.key_id
        {
            return Ok(cached.client.clone());
        }

        if provider.requires_key && provider.key_id.is_empty() {
            return Err(ProviderError::Unavailable {
                provider_id: provider.id.clone(),
                reason: "provider requires an API key but none is set".to_string(),
            });
        }
        let api_key = if provider.api_key_encrypted.is_empty() {
            None
        } else {
            let crypto = self.crypto.as_ref().ok_or_else(|| ProviderError::Unavailable {
                provider_id: provider.id.clone(),
                reason: "no encryption service configured for API keys".to_string(),
            })?;
            Some(crypto.decrypt_str(&provider.key_id, &provider.api_key_encrypted)?)
        };

        let client = Arc::new(ProtocolClient::new(
            provider.id.clone(),
            provider.provider_type,
            provider.endpoint.clone(),
            api_key,
            self.client_timeout,
        ));
        self.clients.write().await.insert(
            provider.id.clone(),
            CachedClient {
                kind: provider.provider_type,
                endpoint: provider.endpoint.clone(),
                key_id: provider.key_id.clone(),
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Decrypted API key of a provider, if it has one.
    pub fn api_key(&self, provider: &Provider) -> Result<Option<SecretString>, ProviderError> {
        if provider.api_key_encrypted.is_empty() {
            return Ok(None);
        }
        match &self.crypto {
            Some(crypto) => Ok(Some(
                crypto.decrypt_str(&provider.key_id, &provider.api_key_encrypted)?,
            )),
            None => Err(ProviderError::Unavailable {
                provider_id: provider.id.clone(),
                reason: "no encryption service configured for API keys".to_string(),
            }),
        }
    }

    pub async fn record_success(
        &self,
        provider_id: &str,
        latency_ms: u64,
        tokens: u64,
    ) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let mut provider = self.get(provider_id).await?;
        provider.metrics.record_success(latency_ms, tokens);
        self.db.upsert_provider(&provider).await?;
        Ok(())
    }

    pub async fn record_failure(
        &self,
        provider_id: &str,
        latency_ms: u64,
    ) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let mut provider = self.get(provider_id).await?;
        provider.metrics.record_failure(latency_ms);
        self.db.upsert_provider(&provider).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::events::of_types;
    use crate::model::ProviderStatus;

    fn registry() -> (ProviderRegistry, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(16));
        let crypto = SecretsCrypto::new(SecretString::from(
            "an-example-master-key-of-32-bytes!".to_string(),
        ))
        .unwrap();
        let registry = ProviderRegistry::new(Arc::new(MemoryStore::new()), events.clone())
            .with_crypto(Arc::new(crypto));
        (registry, events)
    }

    #[tokio::test]
    async fn test_register_then_update_publishes_events() {
        let (registry, events) = registry();
        let mut sub = events.subscribe(of_types(&[
            types::PROVIDER_REGISTERED,
            types::PROVIDER_UPDATED,
            types::PROVIDER_DELETED,
        ]));

        let provider = Provider::new("p1", "Local", "http://localhost");
        registry.register(provider.clone(), None).await.unwrap();
        registry.register(provider, None).await.unwrap();
        registry.delete("p1").await.unwrap();

        assert_eq!(sub.try_recv().unwrap().event_type, types::PROVIDER_REGISTERED);
        assert_eq!(sub.try_recv().unwrap().event_type, types::PROVIDER_UPDATED);
        assert_eq!(sub.try_recv().unwrap().event_type, types::PROVIDER_DELETED);
        assert!(matches!(
            registry.get("p1").await.unwrap_err(),
            ProviderError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_api_key_is_sealed_at_rest() {
        let (registry, _events) = registry();
        let key = SecretString::from("sk-test-abc".to_string());
        let stored = registry
            .register(Provider::new("p1", "Hosted", "https://api.example.com:443/v1"), Some(&key))
            .await
            .unwrap();

        assert!(!stored.key_id.is_empty());
        assert!(!stored.api_key_encrypted.is_empty());
        assert!(!stored.api_key_encrypted.windows(11).any(|w| w == b"sk-test-abc"));

        use secrecy::ExposeSecret;
        let opened = registry.api_key(&stored).unwrap().unwrap();
        assert_eq!(opened.expose_secret(), "sk-test-abc");
    }

    #[tokio::test]
    async fn test_requires_key_without_key_is_unusable() {
        let (registry, _events) = registry();
        let mut provider = Provider::new("p1", "Hosted", "https://api.example.com");
        provider.requires_key = true;
        let err = registry.client(&provider).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_metrics_and_usable_ordering() {
        let (registry, _events) = registry();
        let mut fast = Provider::new("fast", "Fast", "http://a");
        fast.status = ProviderStatus::Healthy;
        let mut slow = Provider::new("slow", "Slow", "http://b");
        slow.status = ProviderStatus::Healthy;
        let mut down = Provider::new("down", "Down", "http://c");
        down.status = ProviderStatus::Failed;
        for p in [fast, slow, down] {
            registry.register(p, None).await.unwrap();
        }

        registry.record_success("fast", 100, 50).await.unwrap();
        registry.record_success("slow", 9000, 10).await.unwrap();
        registry.record_failure("slow", 9000).await.unwrap();

        let usable = registry.list_usable().await.unwrap();
        let ids: Vec<&str> = usable.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "slow"]);
        assert_eq!(usable[1].metrics.failed_requests, 1);
    }
}
