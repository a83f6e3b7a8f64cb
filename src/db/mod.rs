//! Durable store.
//!
//! Every entity is read through the [`Database`] trait and written through a
//! [`WriteBatch`] that a backend commits atomically. Three backends exist:
//!
//! - [`MemoryStore`]: mapping-backed, always available, used by tests
//! - `SqlStore<LibSqlDriver>`: single-node embedded database (feature `libsql`)
//! - `SqlStore<PgDriver>`: multi-node PostgreSQL (feature `postgres`)
//!
//! Both SQL backends share one set of query templates written with `?`
//! placeholders (see [`sql`]).

mod batch;
mod memory;
pub mod sql;

pub use batch::{WriteBatch, WriteOp, with_transaction};
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::model::{
    Activity, AdvisoryLock, Agent, AgentStatus, Bead, BeadStatus, Comment, ConversationContext,
    Credential, Instance, Lesson, MemoryEntry, Mention, Notification, NotificationPreferences,
    NotificationStatus, Project, Provider, User, ctx,
};
use crate::workflow::{Workflow, WorkflowExecution, WorkflowHistoryEntry};

/// Filter for listing beads. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub project_id: Option<String>,
    pub status: Option<BeadStatus>,
    pub assigned_to: Option<String>,
}

impl BeadFilter {
    pub fn matches(&self, bead: &Bead) -> bool {
        self.project_id.as_ref().is_none_or(|p| &bead.project_id == p)
            && self.status.is_none_or(|s| bead.status == s)
            && self.assigned_to.as_ref().is_none_or(|a| &bead.assigned_to == a)
    }
}

/// Filter for listing agents. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub project_id: Option<String>,
    pub status: Option<AgentStatus>,
}

impl AgentFilter {
    pub fn matches(&self, agent: &Agent) -> bool {
        self.project_id.as_ref().is_none_or(|p| &agent.project_id == p)
            && self.status.is_none_or(|s| agent.status == s)
    }
}

/// Window inside which activities with the same aggregation key collapse.
pub const ACTIVITY_AGGREGATION_WINDOW_MINUTES: i64 = 5;

/// Backend-agnostic persistence interface.
///
/// Writes go through [`Database::commit`]; the single-entity write helpers
/// are thin wrappers that commit a one-operation batch.
#[async_trait]
pub trait Database: Send + Sync {
    /// Apply every operation in the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), DatabaseError>;

    // ==================== Projects & users ====================

    async fn get_project(&self, id: &str) -> Result<Project, DatabaseError>;
    async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError>;
    async fn get_user(&self, id: &str) -> Result<User, DatabaseError>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError>;

    // ==================== Beads ====================

    async fn get_bead(&self, id: &str) -> Result<Bead, DatabaseError>;
    async fn list_beads(&self, filter: &BeadFilter) -> Result<Vec<Bead>, DatabaseError>;

    /// Open or in-progress beads whose assignee is empty, missing, or idle,
    /// ordered by priority then age. Ralph-blocked and loop-detected beads
    /// are excluded.
    async fn eligible_beads_for_dispatch(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Bead>, DatabaseError>;

    /// Open and in-progress beads of one project, oldest first.
    async fn open_beads_for_project(&self, project_id: &str) -> Result<Vec<Bead>, DatabaseError>;

    // ==================== Agents ====================

    async fn get_agent(&self, id: &str) -> Result<Agent, DatabaseError>;
    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>, DatabaseError>;

    // ==================== Workflows ====================

    async fn get_workflow(&self, id: &str) -> Result<Workflow, DatabaseError>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>, DatabaseError>;
    async fn get_execution(&self, id: &str) -> Result<WorkflowExecution, DatabaseError>;
    async fn get_execution_by_bead(
        &self,
        bead_id: &str,
    ) -> Result<Option<WorkflowExecution>, DatabaseError>;
    /// History of an execution in append order.
    async fn list_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowHistoryEntry>, DatabaseError>;

    // ==================== Providers & credentials ====================

    async fn get_provider(&self, id: &str) -> Result<Provider, DatabaseError>;
    async fn list_providers(&self) -> Result<Vec<Provider>, DatabaseError>;
    async fn get_credential(&self, id: &str) -> Result<Credential, DatabaseError>;
    async fn list_credentials(&self, project_id: &str) -> Result<Vec<Credential>, DatabaseError>;

    // ==================== Conversations ====================

    async fn get_conversation(&self, session_id: &str)
    -> Result<ConversationContext, DatabaseError>;
    async fn list_conversations_for_bead(
        &self,
        bead_id: &str,
    ) -> Result<Vec<ConversationContext>, DatabaseError>;
    /// Delete every conversation with `expires_at <= now`; returns the count.
    async fn delete_expired_conversations(&self, now: DateTime<Utc>)
    -> Result<u64, DatabaseError>;

    // ==================== Activity ====================

    /// Most recent activity with `aggregation_key` newer than `since`.
    async fn recent_aggregatable_activity(
        &self,
        aggregation_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activity>, DatabaseError>;
    /// Newest first; `project_id = None` lists global activity too.
    async fn list_activity(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Activity>, DatabaseError>;

    // ==================== Notifications ====================

    async fn get_notification(&self, id: &str) -> Result<Notification, DatabaseError>;
    /// Newest first.
    async fn list_notifications(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
    ) -> Result<Vec<Notification>, DatabaseError>;
    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPreferences>, DatabaseError>;

    // ==================== Comments ====================

    async fn get_comment(&self, id: &str) -> Result<Comment, DatabaseError>;
    /// Oldest first, soft-deleted comments included.
    async fn list_comments(&self, bead_id: &str) -> Result<Vec<Comment>, DatabaseError>;
    async fn list_mentions(&self, comment_id: &str) -> Result<Vec<Mention>, DatabaseError>;

    // ==================== Knowledge ====================

    /// Newest first.
    async fn recent_lessons(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Lesson>, DatabaseError>;
    async fn get_memory(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
    ) -> Result<Option<MemoryEntry>, DatabaseError>;
    /// Ordered by category then key.
    async fn list_memory(
        &self,
        project_id: &str,
        category: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, DatabaseError>;

    // ==================== Coordination ====================

    /// Take or renew `lock_name` for `instance_id` unless another instance
    /// holds an unexpired lease. Returns whether the caller now holds it.
    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
    /// Release the lock if `instance_id` holds it.
    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<(), DatabaseError>;
    async fn get_lock(&self, lock_name: &str) -> Result<Option<AdvisoryLock>, DatabaseError>;
    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError>;

    // ==================== Single-entity writes ====================

    /// Upsert a project, rejecting a parent that would form a cycle.
    async fn upsert_project(&self, project: &Project) -> Result<(), DatabaseError> {
        let mut parent = project.parent_id.clone();
        let mut hops = 0;
        while let Some(pid) = parent {
            if pid == project.id {
                return Err(DatabaseError::invalid(
                    "upsert_project",
                    format!("parent {} would create a cycle", project.parent_id.as_deref().unwrap_or("")),
                ));
            }
            hops += 1;
            if hops > 256 {
                return Err(DatabaseError::invalid("upsert_project", "project hierarchy too deep"));
            }
            parent = match self.get_project(&pid).await {
                Ok(p) => p.parent_id,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
        }
        self.commit(WriteBatch::one(WriteOp::UpsertProject(project.clone())))
            .await
    }

    async fn delete_project(&self, id: &str) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::DeleteProject(id.to_string())))
            .await
    }

    async fn upsert_user(&self, user: &User) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertUser(user.clone())))
            .await
    }

    async fn upsert_bead(&self, bead: &Bead) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertBead(bead.clone())))
            .await
    }

    async fn delete_bead(&self, id: &str) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::DeleteBead(id.to_string())))
            .await
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertAgent(agent.clone())))
            .await
    }

    async fn delete_agent(&self, id: &str) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::DeleteAgent(id.to_string())))
            .await
    }

    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertWorkflow(workflow.clone())))
            .await
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertProvider(provider.clone())))
            .await
    }

    async fn delete_provider(&self, id: &str) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::DeleteProvider(id.to_string())))
            .await
    }

    async fn upsert_credential(&self, credential: &Credential) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertCredential(credential.clone())))
            .await
    }

    async fn upsert_conversation(
        &self,
        conversation: &ConversationContext,
    ) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertConversation(
            conversation.clone(),
        )))
        .await
    }

    async fn upsert_activity(&self, activity: &Activity) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertActivity(activity.clone())))
            .await
    }

    async fn upsert_notification(&self, notification: &Notification) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertNotification(
            notification.clone(),
        )))
        .await
    }

    async fn upsert_preferences(
        &self,
        preferences: &NotificationPreferences,
    ) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertPreferences(
            preferences.clone(),
        )))
        .await
    }

    async fn upsert_comment(&self, comment: &Comment) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertComment(comment.clone())))
            .await
    }

    async fn insert_lesson(&self, lesson: &Lesson) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::InsertLesson(lesson.clone())))
            .await
    }

    async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertMemory(entry.clone())))
            .await
    }

    async fn delete_memory(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
    ) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::DeleteMemory {
            project_id: project_id.to_string(),
            category: category.to_string(),
            key: key.to_string(),
        }))
        .await
    }

    async fn upsert_instance(&self, instance: &Instance) -> Result<(), DatabaseError> {
        self.commit(WriteBatch::one(WriteOp::UpsertInstance(instance.clone())))
            .await
    }
}

/// True when a bead may be handed to the dispatcher, ignoring assignment.
pub(crate) fn bead_is_dispatchable(bead: &Bead) -> bool {
    bead.status.is_active() && !bead.is_ralph_blocked() && !bead.ctx_flag(ctx::LOOP_DETECTED)
}

/// Build the store selected by configuration.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let driver = sql::libsql_driver::LibSqlDriver::open(&config.libsql_path).await?;
            Ok(Arc::new(sql::SqlStore::connect(driver).await?))
        }
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let driver = sql::pg_driver::PgDriver::connect(config).await?;
            Ok(Arc::new(sql::SqlStore::connect(driver).await?))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Connection {
            operation: "connect".to_string(),
            reason: format!("backend {:?} not compiled in", other),
        }),
    }
}
