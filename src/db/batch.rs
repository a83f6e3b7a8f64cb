//! Atomic write batches.

use crate::db::Database;
use crate::error::DatabaseError;
use crate::model::{
    Activity, Agent, Bead, Comment, ConversationContext, Credential, Instance, Lesson,
    MemoryEntry, Mention, Notification, NotificationPreferences, Project, Provider, User,
};
use crate::workflow::{Workflow, WorkflowExecution, WorkflowHistoryEntry};

/// One staged write.
///
/// Upserts preserve an existing `created_at` and refresh `updated_at`.
/// Deletes are idempotent and cascade to owned records.
#[derive(Debug, Clone)]
pub enum WriteOp {
    UpsertProject(Project),
    /// Removes agents, credentials, activities, lessons, memories, and beads
    /// of the project; children get a null parent.
    DeleteProject(String),
    UpsertUser(User),
    UpsertBead(Bead),
    /// Removes the bead's execution, history, comments, mentions, and
    /// conversations.
    DeleteBead(String),
    UpsertAgent(Agent),
    DeleteAgent(String),
    /// Replaces the workflow's nodes and edges.
    UpsertWorkflow(Workflow),
    DeleteWorkflow(String),
    UpsertExecution(WorkflowExecution),
    AppendHistory(WorkflowHistoryEntry),
    DeleteHistory { execution_id: String },
    DeleteExecution { execution_id: String },
    UpsertProvider(Provider),
    DeleteProvider(String),
    UpsertCredential(Credential),
    DeleteCredential(String),
    UpsertConversation(ConversationContext),
    DeleteConversation(String),
    UpsertActivity(Activity),
    UpsertNotification(Notification),
    UpsertPreferences(NotificationPreferences),
    UpsertComment(Comment),
    InsertMention(Mention),
    InsertLesson(Lesson),
    UpsertMemory(MemoryEntry),
    DeleteMemory {
        project_id: String,
        category: String,
        key: String,
    },
    UpsertInstance(Instance),
}

impl WriteOp {
    /// Short name used in error messages and logs.
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::UpsertProject(_) => "upsert_project",
            WriteOp::DeleteProject(_) => "delete_project",
            WriteOp::UpsertUser(_) => "upsert_user",
            WriteOp::UpsertBead(_) => "upsert_bead",
            WriteOp::DeleteBead(_) => "delete_bead",
            WriteOp::UpsertAgent(_) => "upsert_agent",
            WriteOp::DeleteAgent(_) => "delete_agent",
            WriteOp::UpsertWorkflow(_) => "upsert_workflow",
            WriteOp::DeleteWorkflow(_) => "delete_workflow",
            WriteOp::UpsertExecution(_) => "upsert_execution",
            WriteOp::AppendHistory(_) => "append_history",
            WriteOp::DeleteHistory { .. } => "delete_history",
            WriteOp::DeleteExecution { .. } => "delete_execution",
            WriteOp::UpsertProvider(_) => "upsert_provider",
            WriteOp::DeleteProvider(_) => "delete_provider",
            WriteOp::UpsertCredential(_) => "upsert_credential",
            WriteOp::DeleteCredential(_) => "delete_credential",
            WriteOp::UpsertConversation(_) => "upsert_conversation",
            WriteOp::DeleteConversation(_) => "delete_conversation",
            WriteOp::UpsertActivity(_) => "upsert_activity",
            WriteOp::UpsertNotification(_) => "upsert_notification",
            WriteOp::UpsertPreferences(_) => "upsert_preferences",
            WriteOp::UpsertComment(_) => "upsert_comment",
            WriteOp::InsertMention(_) => "insert_mention",
            WriteOp::InsertLesson(_) => "insert_lesson",
            WriteOp::UpsertMemory(_) => "upsert_memory",
            WriteOp::DeleteMemory { .. } => "delete_memory",
            WriteOp::UpsertInstance(_) => "upsert_instance",
        }
    }
}

/// An ordered set of writes committed as one transaction.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn upsert_bead(&mut self, bead: &Bead) -> &mut Self {
        self.push(WriteOp::UpsertBead(bead.clone()))
    }

    pub fn upsert_agent(&mut self, agent: &Agent) -> &mut Self {
        self.push(WriteOp::UpsertAgent(agent.clone()))
    }

    pub fn upsert_execution(&mut self, execution: &WorkflowExecution) -> &mut Self {
        self.push(WriteOp::UpsertExecution(execution.clone()))
    }

    pub fn append_history(&mut self, entry: WorkflowHistoryEntry) -> &mut Self {
        self.push(WriteOp::AppendHistory(entry))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Run `f` against a fresh batch and commit it if `f` returns `Ok`.
///
/// On `Err` nothing staged by `f` is written.
pub async fn with_transaction<T, E, F>(db: &dyn Database, f: F) -> Result<T, E>
where
    F: FnOnce(&mut WriteBatch) -> Result<T, E>,
    E: From<DatabaseError>,
{
    let mut batch = WriteBatch::new();
    let value = f(&mut batch)?;
    if !batch.is_empty() {
        db.commit(batch).await?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::model::Priority;

    #[tokio::test]
    async fn test_with_transaction_commits_on_ok() {
        let db = MemoryStore::new();
        let bead = Bead::new("p1", "Write docs", Priority::P2);
        let id = bead.id.clone();

        with_transaction(&db, |batch| {
            batch.upsert_bead(&bead);
            Ok::<_, DatabaseError>(())
        })
        .await
        .unwrap();

        assert!(db.get_bead(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_with_transaction_discards_on_err() {
        let db = MemoryStore::new();
        let bead = Bead::new("p1", "Write docs", Priority::P2);
        let id = bead.id.clone();

        let result: Result<(), DatabaseError> = with_transaction(&db, |batch| {
            batch.upsert_bead(&bead);
            Err(DatabaseError::invalid("test", "boom"))
        })
        .await;

        assert!(result.is_err());
        assert!(db.get_bead(&id).await.unwrap_err().is_not_found());
    }
}
