//! Advisory leases and instance registration.
//!
//! A [`LeaseKeeper`] holds a named lock in the store for one instance and
//! renews it every `ttl / 3`. If renewal fails or another instance stole an
//! expired lease, [`LeaseKeeper::is_held`] turns false until the next
//! successful renewal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::{DatabaseError, LockError};
use crate::model::Instance;

pub const INSTANCE_RUNNING: &str = "running";
pub const INSTANCE_STOPPED: &str = "stopped";

pub struct LeaseKeeper {
    db: Arc<dyn Database>,
    lock_name: String,
    instance_id: String,
    ttl: Duration,
    held: AtomicBool,
}

impl LeaseKeeper {
    pub fn new(
        db: Arc<dyn Database>,
        lock_name: impl Into<String>,
        instance_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            db,
            lock_name: lock_name.into(),
            instance_id: instance_id.into(),
            ttl,
            held: AtomicBool::new(false),
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Take or renew the lease. Returns whether this instance holds it.
    pub async fn acquire(&self) -> Result<bool, LockError> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        let acquired = self
            .db
            .try_acquire_lock(&self.lock_name, &self.instance_id, ttl, Utc::now())
            .await;
        let held = match acquired {
            Ok(held) => held,
            Err(e) => {
                self.held.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let was_held = self.held.swap(held, Ordering::AcqRel);
        if held && !was_held {
            tracing::info!(lock = %self.lock_name, instance_id = %self.instance_id, "Lease acquired");
        } else if !held && was_held {
            tracing::warn!(lock = %self.lock_name, instance_id = %self.instance_id, "Lease lost");
        }
        Ok(held)
    }

    /// Fail with [`LockError::Held`] unless this instance holds the lease.
    pub async fn ensure_held(&self) -> Result<(), LockError> {
        if self.acquire().await? {
            return Ok(());
        }
        match self.db.get_lock(&self.lock_name).await? {
            Some(lock) => Err(LockError::Held {
                lock_name: self.lock_name.clone(),
                holder: lock.instance_id,
                expires_at: lock.expires_at.to_rfc3339(),
            }),
            None => Err(LockError::Lost(self.lock_name.clone())),
        }
    }

    /// Best-effort release.
    pub async fn release(&self) {
        self.held.store(false, Ordering::Release);
        if let Err(e) = self.db.release_lock(&self.lock_name, &self.instance_id).await {
            tracing::warn!(lock = %self.lock_name, error = %e, "Failed to release lease");
        }
    }

    /// Renew every `ttl / 3` until cancelled, then release.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = (self.ttl / 3).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.acquire().await {
                        tracing::warn!(lock = %self.lock_name, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
        self.release().await;
    }
}

/// Record this process in the instance table.
pub async fn register_instance(db: &dyn Database, instance_id: &str) -> Result<Instance, DatabaseError> {
    let now = Utc::now();
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let mut metadata = BTreeMap::new();
    metadata.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
    let instance = Instance {
        instance_id: instance_id.to_string(),
        hostname,
        started_at: now,
        last_heartbeat: now,
        status: INSTANCE_RUNNING.to_string(),
        metadata,
    };
    db.upsert_instance(&instance).await?;
    tracing::info!(instance_id, "Instance registered");
    Ok(instance)
}

/// Refresh the instance heartbeat every `period` until cancelled, then mark
/// the instance stopped.
pub async fn run_instance_heartbeat(
    db: Arc<dyn Database>,
    mut instance: Instance,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                instance.last_heartbeat = Utc::now();
                if let Err(e) = db.upsert_instance(&instance).await {
                    tracing::warn!(instance_id = %instance.instance_id, error = %e, "Instance heartbeat failed");
                }
            }
        }
    }
    instance.status = INSTANCE_STOPPED.to_string();
    instance.last_heartbeat = Utc::now();
    if let Err(e) = db.upsert_instance(&instance).await {
        tracing::warn!(instance_id = %instance.instance_id, error = %e, "Failed to mark instance stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_second_instance_is_refused() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let first = LeaseKeeper::new(db.clone(), "ralph", "i1", Duration::from_secs(30));
        let second = LeaseKeeper::new(db.clone(), "ralph", "i2", Duration::from_secs(30));

        assert!(first.acquire().await.unwrap());
        assert!(first.is_held());
        let err = second.ensure_held().await.unwrap_err();
        assert!(matches!(err, LockError::Held { ref holder, .. } if holder == "i1"));
        assert!(!second.is_held());

        first.release().await;
        assert!(!first.is_held());
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_releases_on_cancel() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let keeper = Arc::new(LeaseKeeper::new(db.clone(), "ralph", "i1", Duration::from_secs(3)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keeper.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(keeper.is_held());
        cancel.cancel();
        task.await.unwrap();
        assert!(!keeper.is_held());
        assert!(db.get_lock("ralph").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_instance() {
        let db = MemoryStore::new();
        let instance = register_instance(&db, "i1").await.unwrap();
        assert_eq!(instance.status, INSTANCE_RUNNING);
        assert_eq!(db.list_instances().await.unwrap().len(), 1);
    }
}
