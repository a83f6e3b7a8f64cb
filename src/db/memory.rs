//! Mapping-backed store.
//!
//! Every commit applies its batch to a staged copy of the state and swaps it
//! in only when all operations succeed, so a failed batch leaves no trace.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::db::{AgentFilter, BeadFilter, Database, WriteBatch, WriteOp, bead_is_dispatchable};
use crate::error::DatabaseError;
use crate::model::{
    Activity, AdvisoryLock, Agent, AgentStatus, Bead, Comment, ConversationContext, Credential,
    Instance, Lesson, MemoryEntry, Mention, Notification, NotificationPreferences,
    NotificationStatus, Project, Provider, User,
};
use crate::workflow::{Workflow, WorkflowExecution, WorkflowHistoryEntry};

#[derive(Debug, Clone, Default)]
struct State {
    projects: HashMap<String, Project>,
    users: HashMap<String, User>,
    beads: HashMap<String, Bead>,
    agents: HashMap<String, Agent>,
    workflows: HashMap<String, Workflow>,
    executions: HashMap<String, WorkflowExecution>,
    /// Append order is preserved.
    history: Vec<WorkflowHistoryEntry>,
    providers: HashMap<String, Provider>,
    credentials: HashMap<String, Credential>,
    conversations: HashMap<String, ConversationContext>,
    activities: HashMap<String, Activity>,
    notifications: HashMap<String, Notification>,
    preferences: HashMap<String, NotificationPreferences>,
    comments: HashMap<String, Comment>,
    mentions: HashMap<String, Mention>,
    lessons: Vec<Lesson>,
    memory: BTreeMap<(String, String, String), MemoryEntry>,
    locks: HashMap<String, AdvisoryLock>,
    instances: HashMap<String, Instance>,
}

impl State {
    fn apply(&mut self, op: WriteOp, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        match op {
            WriteOp::UpsertProject(mut project) => {
                if let Some(existing) = self.projects.get(&project.id) {
                    project.created_at = existing.created_at;
                }
                project.updated_at = now;
                self.projects.insert(project.id.clone(), project);
            }
            WriteOp::DeleteProject(id) => self.delete_project(&id),
            WriteOp::UpsertUser(mut user) => {
                if let Some(existing) = self.users.get(&user.id) {
                    user.created_at = existing.created_at;
                }
                if self
                    .users
                    .values()
                    .any(|u| u.username == user.username && u.id != user.id)
                {
                    return Err(DatabaseError::Duplicate {
                        operation: "upsert_user".to_string(),
                        entity: "user".to_string(),
                        id: user.username,
                    });
                }
                self.users.insert(user.id.clone(), user);
            }
            WriteOp::UpsertBead(mut bead) => {
                if let Some(existing) = self.beads.get(&bead.id) {
                    bead.created_at = existing.created_at;
                }
                bead.updated_at = now;
                self.beads.insert(bead.id.clone(), bead);
            }
            WriteOp::DeleteBead(id) => self.delete_bead(&id),
            WriteOp::UpsertAgent(agent) => {
                let agent = match self.agents.get(&agent.id) {
                    Some(existing) => Agent {
                        started_at: existing.started_at,
                        ..agent
                    },
                    None => agent,
                };
                self.agents.insert(agent.id.clone(), agent);
            }
            WriteOp::DeleteAgent(id) => {
                self.agents.remove(&id);
            }
            WriteOp::UpsertWorkflow(workflow) => {
                self.workflows.insert(workflow.id.clone(), workflow);
            }
            WriteOp::DeleteWorkflow(id) => {
                self.workflows.remove(&id);
            }
            WriteOp::UpsertExecution(mut execution) => {
                if self
                    .executions
                    .values()
                    .any(|e| e.bead_id == execution.bead_id && e.id != execution.id)
                {
                    return Err(DatabaseError::Duplicate {
                        operation: "upsert_execution".to_string(),
                        entity: "workflow_execution".to_string(),
                        id: execution.bead_id,
                    });
                }
                if let Some(existing) = self.executions.get(&execution.id) {
                    execution.started_at = existing.started_at;
                }
                self.executions.insert(execution.id.clone(), execution);
            }
            WriteOp::AppendHistory(entry) => {
                if !self.executions.contains_key(&entry.execution_id) {
                    return Err(DatabaseError::not_found(
                        "append_history",
                        "workflow_execution",
                        &entry.execution_id,
                    ));
                }
                self.history.push(entry);
            }
            WriteOp::DeleteHistory { execution_id } => {
                self.history.retain(|h| h.execution_id != execution_id);
            }
            WriteOp::DeleteExecution { execution_id } => {
                self.history.retain(|h| h.execution_id != execution_id);
                self.executions.remove(&execution_id);
            }
            WriteOp::UpsertProvider(mut provider) => {
                if let Some(existing) = self.providers.get(&provider.id) {
                    provider.created_at = existing.created_at;
                }
                provider.updated_at = now;
                self.providers.insert(provider.id.clone(), provider);
            }
            WriteOp::DeleteProvider(id) => {
                self.providers.remove(&id);
            }
            WriteOp::UpsertCredential(mut credential) => {
                if let Some(existing) = self.credentials.get(&credential.id) {
                    credential.created_at = existing.created_at;
                }
                credential.updated_at = now;
                self.credentials.insert(credential.id.clone(), credential);
            }
            WriteOp::DeleteCredential(id) => {
                self.credentials.remove(&id);
            }
            WriteOp::UpsertConversation(mut conversation) => {
                if let Some(existing) = self.conversations.get(&conversation.session_id) {
                    conversation.created_at = existing.created_at;
                }
                conversation.updated_at = now;
                self.conversations
                    .insert(conversation.session_id.clone(), conversation);
            }
            WriteOp::DeleteConversation(id) => {
                self.conversations.remove(&id);
            }
            WriteOp::UpsertActivity(activity) => {
                self.activities.insert(activity.id.clone(), activity);
            }
            WriteOp::UpsertNotification(notification) => {
                self.notifications
                    .insert(notification.id.clone(), notification);
            }
            WriteOp::UpsertPreferences(preferences) => {
                self.preferences
                    .insert(preferences.user_id.clone(), preferences);
            }
            WriteOp::UpsertComment(mut comment) => {
                if let Some(existing) = self.comments.get(&comment.id) {
                    comment.created_at = existing.created_at;
                }
                comment.updated_at = now;
                self.comments.insert(comment.id.clone(), comment);
            }
            WriteOp::InsertMention(mention) => {
                self.mentions.insert(mention.id.clone(), mention);
            }
            WriteOp::InsertLesson(lesson) => {
                self.lessons.retain(|l| l.id != lesson.id);
                self.lessons.push(lesson);
            }
            WriteOp::UpsertMemory(mut entry) => {
                entry.updated_at = now;
                let key = (
                    entry.project_id.clone(),
                    entry.category.clone(),
                    entry.key.clone(),
                );
                self.memory.insert(key, entry);
            }
            WriteOp::DeleteMemory {
                project_id,
                category,
                key,
            } => {
                self.memory.remove(&(project_id, category, key));
            }
            WriteOp::UpsertInstance(instance) => {
                let instance = match self.instances.get(&instance.instance_id) {
                    Some(existing) => Instance {
                        started_at: existing.started_at,
                        ..instance
                    },
                    None => instance,
                };
                self.instances
                    .insert(instance.instance_id.clone(), instance);
            }
        }
        Ok(())
    }

    fn delete_bead(&mut self, id: &str) {
        let executions: Vec<String> = self
            .executions
            .values()
            .filter(|e| e.bead_id == id)
            .map(|e| e.id.clone())
            .collect();
        for exec_id in &executions {
            self.history.retain(|h| &h.execution_id != exec_id);
            self.executions.remove(exec_id);
        }
        let comments: Vec<String> = self
            .comments
            .values()
            .filter(|c| c.bead_id == id)
            .map(|c| c.id.clone())
            .collect();
        self.mentions.retain(|_, m| !comments.contains(&m.comment_id));
        self.comments.retain(|_, c| c.bead_id != id);
        self.conversations.retain(|_, c| c.bead_id != id);
        self.beads.remove(id);
    }

    fn delete_project(&mut self, id: &str) {
        let beads: Vec<String> = self
            .beads
            .values()
            .filter(|b| b.project_id == id)
            .map(|b| b.id.clone())
            .collect();
        for bead_id in &beads {
            self.delete_bead(bead_id);
        }
        let executions: Vec<String> = self
            .executions
            .values()
            .filter(|e| e.project_id == id)
            .map(|e| e.id.clone())
            .collect();
        for exec_id in &executions {
            self.history.retain(|h| &h.execution_id != exec_id);
            self.executions.remove(exec_id);
        }
        self.agents.retain(|_, a| a.project_id != id);
        self.credentials.retain(|_, c| c.project_id != id);
        self.conversations.retain(|_, c| c.project_id != id);
        self.activities.retain(|_, a| a.project_id != id);
        self.lessons.retain(|l| l.project_id != id);
        self.memory.retain(|(p, _, _), _| p != id);
        for child in self.projects.values_mut() {
            if child.parent_id.as_deref() == Some(id) {
                child.parent_id = None;
            }
        }
        self.projects.remove(id);
    }
}

/// In-process store backed by hash maps behind a [`RwLock`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(op: &str, entity: &str, id: &str) -> DatabaseError {
    DatabaseError::not_found(op, entity, id)
}

#[async_trait]
impl Database for MemoryStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        for op in batch.into_ops() {
            staged.apply(op, now)?;
        }
        *state = staged;
        Ok(())
    }

    // ==================== Projects & users ====================

    async fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        let state = self.state.read().await;
        state
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_project", "project", id))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let state = self.state.read().await;
        let mut projects: Vec<Project> = state.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn get_user(&self, id: &str) -> Result<User, DatabaseError> {
        let state = self.state.read().await;
        state
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_user", "user", id))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    // ==================== Beads ====================

    async fn get_bead(&self, id: &str) -> Result<Bead, DatabaseError> {
        let state = self.state.read().await;
        state
            .beads
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_bead", "bead", id))
    }

    async fn list_beads(&self, filter: &BeadFilter) -> Result<Vec<Bead>, DatabaseError> {
        let state = self.state.read().await;
        let mut beads: Vec<Bead> = state
            .beads
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect();
        beads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(beads)
    }

    async fn eligible_beads_for_dispatch(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Bead>, DatabaseError> {
        let state = self.state.read().await;
        let mut beads: Vec<Bead> = state
            .beads
            .values()
            .filter(|b| project_id.is_none_or(|p| b.project_id == p))
            .filter(|b| bead_is_dispatchable(b))
            .filter(|b| {
                !b.is_assigned()
                    || state
                        .agents
                        .get(&b.assigned_to)
                        .is_none_or(|a| a.status == AgentStatus::Idle)
            })
            .cloned()
            .collect();
        beads.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        beads.truncate(limit);
        Ok(beads)
    }

    async fn open_beads_for_project(&self, project_id: &str) -> Result<Vec<Bead>, DatabaseError> {
        let state = self.state.read().await;
        let mut beads: Vec<Bead> = state
            .beads
            .values()
            .filter(|b| b.project_id == project_id && b.status.is_active())
            .cloned()
            .collect();
        beads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(beads)
    }

    // ==================== Agents ====================

    async fn get_agent(&self, id: &str) -> Result<Agent, DatabaseError> {
        let state = self.state.read().await;
        state
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_agent", "agent", id))
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>, DatabaseError> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(agents)
    }

    // ==================== Workflows ====================

    async fn get_workflow(&self, id: &str) -> Result<Workflow, DatabaseError> {
        let state = self.state.read().await;
        state
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_workflow", "workflow", id))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, DatabaseError> {
        let state = self.state.read().await;
        let mut workflows: Vec<Workflow> = state.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn get_execution(&self, id: &str) -> Result<WorkflowExecution, DatabaseError> {
        let state = self.state.read().await;
        state
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_execution", "workflow_execution", id))
    }

    async fn get_execution_by_bead(
        &self,
        bead_id: &str,
    ) -> Result<Option<WorkflowExecution>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .find(|e| e.bead_id == bead_id)
            .cloned())
    }

    async fn list_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowHistoryEntry>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.execution_id == execution_id)
            .cloned()
            .collect())
    }

    // ==================== Providers & credentials ====================

    async fn get_provider(&self, id: &str) -> Result<Provider, DatabaseError> {
        let state = self.state.read().await;
        state
            .providers
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_provider", "provider", id))
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, DatabaseError> {
        let state = self.state.read().await;
        let mut providers: Vec<Provider> = state.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(providers)
    }

    async fn get_credential(&self, id: &str) -> Result<Credential, DatabaseError> {
        let state = self.state.read().await;
        state
            .credentials
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_credential", "credential", id))
    }

    async fn list_credentials(&self, project_id: &str) -> Result<Vec<Credential>, DatabaseError> {
        let state = self.state.read().await;
        let mut credentials: Vec<Credential> = state
            .credentials
            .values()
            .filter(|c| c.project_id == project_id)
            .cloned()
            .collect();
        credentials.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(credentials)
    }

    // ==================== Conversations ====================

    async fn get_conversation(
        &self,
        session_id: &str,
    ) -> Result<ConversationContext, DatabaseError> {
        let state = self.state.read().await;
        state
            .conversations
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found("get_conversation", "conversation", session_id))
    }

    async fn list_conversations_for_bead(
        &self,
        bead_id: &str,
    ) -> Result<Vec<ConversationContext>, DatabaseError> {
        let state = self.state.read().await;
        let mut conversations: Vec<ConversationContext> = state
            .conversations
            .values()
            .filter(|c| c.bead_id == bead_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_expired_conversations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut state = self.state.write().await;
        let before = state.conversations.len();
        state.conversations.retain(|_, c| !c.is_expired(now));
        Ok((before - state.conversations.len()) as u64)
    }

    // ==================== Activity ====================

    async fn recent_aggregatable_activity(
        &self,
        aggregation_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activity>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .activities
            .values()
            .filter(|a| a.aggregation_key.as_deref() == Some(aggregation_key))
            .filter(|a| a.timestamp > since)
            .max_by_key(|a| a.timestamp)
            .cloned())
    }

    async fn list_activity(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Activity>, DatabaseError> {
        let state = self.state.read().await;
        let mut activities: Vec<Activity> = state
            .activities
            .values()
            .filter(|a| project_id.is_none_or(|p| a.project_id == p))
            .cloned()
            .collect();
        activities.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        activities.truncate(limit);
        Ok(activities)
    }

    // ==================== Notifications ====================

    async fn get_notification(&self, id: &str) -> Result<Notification, DatabaseError> {
        let state = self.state.read().await;
        state
            .notifications
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_notification", "notification", id))
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
    ) -> Result<Vec<Notification>, DatabaseError> {
        let state = self.state.read().await;
        let mut notifications: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && status.is_none_or(|s| n.status == s))
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(notifications)
    }

    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPreferences>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.preferences.get(user_id).cloned())
    }

    // ==================== Comments ====================

    async fn get_comment(&self, id: &str) -> Result<Comment, DatabaseError> {
        let state = self.state.read().await;
        state
            .comments
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("get_comment", "comment", id))
    }

    async fn list_comments(&self, bead_id: &str) -> Result<Vec<Comment>, DatabaseError> {
        let state = self.state.read().await;
        let mut comments: Vec<Comment> = state
            .comments
            .values()
            .filter(|c| c.bead_id == bead_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(comments)
    }

    async fn list_mentions(&self, comment_id: &str) -> Result<Vec<Mention>, DatabaseError> {
        let state = self.state.read().await;
        let mut mentions: Vec<Mention> = state
            .mentions
            .values()
            .filter(|m| m.comment_id == comment_id)
            .cloned()
            .collect();
        mentions.sort_by(|a, b| a.mentioned_user_id.cmp(&b.mentioned_user_id));
        Ok(mentions)
    }

    // ==================== Knowledge ====================

    async fn recent_lessons(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Lesson>, DatabaseError> {
        let state = self.state.read().await;
        let mut lessons: Vec<Lesson> = state
            .lessons
            .iter()
            .filter(|l| l.project_id == project_id)
            .cloned()
            .collect();
        lessons.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        lessons.truncate(limit);
        Ok(lessons)
    }

    async fn get_memory(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
    ) -> Result<Option<MemoryEntry>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .memory
            .get(&(
                project_id.to_string(),
                category.to_string(),
                key.to_string(),
            ))
            .cloned())
    }

    async fn list_memory(
        &self,
        project_id: &str,
        category: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .memory
            .values()
            .filter(|m| m.project_id == project_id && category.is_none_or(|c| m.category == c))
            .cloned()
            .collect())
    }

    // ==================== Coordination ====================

    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.write().await;
        match state.locks.get_mut(lock_name) {
            Some(lock) if lock.instance_id == instance_id => {
                lock.expires_at = now + ttl;
                lock.heartbeat_at = now;
                Ok(true)
            }
            Some(lock) if lock.expires_at >= now => Ok(false),
            _ => {
                state.locks.insert(
                    lock_name.to_string(),
                    AdvisoryLock {
                        lock_name: lock_name.to_string(),
                        instance_id: instance_id.to_string(),
                        acquired_at: now,
                        expires_at: now + ttl,
                        heartbeat_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if state
            .locks
            .get(lock_name)
            .is_some_and(|l| l.instance_id == instance_id)
        {
            state.locks.remove(lock_name);
        }
        Ok(())
    }

    async fn get_lock(&self, lock_name: &str) -> Result<Option<AdvisoryLock>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.locks.get(lock_name).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError> {
        let state = self.state.read().await;
        let mut instances: Vec<Instance> = state.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }
}
