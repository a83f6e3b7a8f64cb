//! [`Database`] implementation shared by every SQL driver.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{Dialect, SqlDriver, SqlRow, SqlValue, Statement, json, rebind, schema};
use crate::db::{AgentFilter, BeadFilter, Database, WriteBatch, WriteOp, bead_is_dispatchable};
use crate::error::DatabaseError;
use crate::model::{
    Activity, AdvisoryLock, Agent, Bead, Comment, ConversationContext, Credential, Instance,
    Lesson, MemoryEntry, Mention, Notification, NotificationPreferences, NotificationStatus,
    Project, Provider, User,
};
use crate::workflow::{Workflow, WorkflowEdge, WorkflowExecution, WorkflowHistoryEntry, WorkflowNode};

// ==================== Column lists ====================

const PROJECT_COLS: &str = "id, name, git_repo, branch, beads_path, parent_id, is_perpetual, \
     is_sticky, status, git_strategy, context, schema_version, created_at, updated_at, closed_at";
const USER_COLS: &str = "id, username, display_name, email, created_at";
const BEAD_COLS: &str = "id, project_id, title, description, priority, type, status, \
     assigned_to, context, created_at, updated_at";
const AGENT_COLS: &str = "id, name, role, persona_name, provider_id, status, current_bead, \
     project_id, position_id, started_at, last_active";
const WORKFLOW_COLS: &str = "id, name, description, workflow_type, is_default, project_id";
const NODE_COLS: &str = "id, workflow_id, node_key, node_type, role_required, persona_hint, \
     max_attempts, timeout_minutes, instructions, metadata, ordinal";
const EDGE_COLS: &str =
    "id, workflow_id, from_node_key, to_node_key, edge_condition, priority, ordinal";
const EXECUTION_COLS: &str = "id, workflow_id, bead_id, project_id, current_node_key, status, \
     cycle_count, node_attempt_count, started_at, completed_at, escalated_at, last_node_at";
const HISTORY_COLS: &str = "id, execution_id, node_key, agent_id, edge_condition, result_data, \
     attempt_number, created_at";
const PROVIDER_COLS: &str = "id, name, type, endpoint, model, configured_model, selected_model, \
     selection_reason, model_score, selected_gpu, gpu_constraints, description, requires_key, \
     key_id, api_key_encrypted, owner_id, is_shared, status, last_heartbeat_at, \
     last_heartbeat_latency_ms, last_heartbeat_error, cost_per_mtoken, context_window, \
     supports_function, supports_vision, supports_streaming, tags, metrics, created_at, updated_at";
const CREDENTIAL_COLS: &str = "id, project_id, type, private_key_encrypted, public_key, key_id, \
     description, created_at, updated_at, rotated_at";
const CONVERSATION_COLS: &str = "session_id, bead_id, project_id, messages, metadata, \
     token_count, created_at, updated_at, expires_at";
const ACTIVITY_COLS: &str = "id, event_type, occurred_at, actor_id, project_id, resource_type, \
     resource_id, action, aggregation_key, aggregation_count, visibility, metadata";
const NOTIFICATION_COLS: &str = "id, user_id, event_type, title, message, status, priority, \
     resource_id, created_at, read_at, archived_at";
const PREFERENCE_COLS: &str =
    "user_id, digest_mode, quiet_start, quiet_end, min_priority, subscribed_events";
const COMMENT_COLS: &str =
    "id, bead_id, parent_id, author_id, content, created_at, updated_at, edited, deleted";
const MENTION_COLS: &str = "id, comment_id, mentioned_user_id, notified_at";
const LESSON_COLS: &str = "id, project_id, category, title, detail, source_bead_id, \
     source_agent_id, relevance_score, created_at, embedding";
const MEMORY_COLS: &str =
    "project_id, category, key, value, confidence, updated_at, source_bead";
const LOCK_COLS: &str = "lock_name, instance_id, acquired_at, expires_at, heartbeat_at";
const INSTANCE_COLS: &str =
    "instance_id, hostname, started_at, last_heartbeat, status, metadata";

/// Build `INSERT ... ON CONFLICT (key) DO UPDATE` that leaves `keep` columns
/// of an existing row untouched.
fn upsert_sql(table: &str, cols: &str, conflict: &[&str], keep: &[&str]) -> String {
    let names: Vec<&str> = cols.split(',').map(str::trim).collect();
    let placeholders = vec!["?"; names.len()].join(", ");
    let updates: Vec<String> = names
        .iter()
        .filter(|c| !conflict.contains(c) && !keep.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let conflict = conflict.join(", ");
    if updates.is_empty() {
        format!(
            "INSERT INTO {table} ({cols}) VALUES ({placeholders}) ON CONFLICT ({conflict}) DO NOTHING"
        )
    } else {
        format!(
            "INSERT INTO {table} ({cols}) VALUES ({placeholders}) ON CONFLICT ({conflict}) DO UPDATE SET {}",
            updates.join(", ")
        )
    }
}

/// Prefix every column of a list with a table alias.
fn qualified(alias: &str, cols: &str) -> String {
    cols.split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ==================== Row decoding ====================

fn project_from_row(row: &SqlRow) -> Result<Project, DatabaseError> {
    let mut r = row.reader("decode_project");
    Ok(Project {
        id: r.text()?,
        name: r.text()?,
        git_repo: r.text()?,
        branch: r.text()?,
        beads_path: r.text()?,
        parent_id: r.opt_text()?,
        is_perpetual: r.boolean()?,
        is_sticky: r.boolean()?,
        status: r.parse()?,
        git_strategy: r.parse()?,
        context: r.json()?,
        schema_version: r.text()?,
        created_at: r.time()?,
        updated_at: r.time()?,
        closed_at: r.opt_time()?,
    })
}

fn user_from_row(row: &SqlRow) -> Result<User, DatabaseError> {
    let mut r = row.reader("decode_user");
    Ok(User {
        id: r.text()?,
        username: r.text()?,
        display_name: r.text()?,
        email: r.text()?,
        created_at: r.time()?,
    })
}

fn bead_from_row(row: &SqlRow) -> Result<Bead, DatabaseError> {
    let mut r = row.reader("decode_bead");
    Ok(Bead {
        id: r.text()?,
        project_id: r.text()?,
        title: r.text()?,
        description: r.text()?,
        priority: r.parse()?,
        bead_type: r.text()?,
        status: r.parse()?,
        assigned_to: r.text()?,
        context: r.json()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn agent_from_row(row: &SqlRow) -> Result<Agent, DatabaseError> {
    let mut r = row.reader("decode_agent");
    Ok(Agent {
        id: r.text()?,
        name: r.text()?,
        role: r.text()?,
        persona_name: r.text()?,
        provider_id: r.text()?,
        status: r.parse()?,
        current_bead: r.text()?,
        project_id: r.text()?,
        position_id: r.text()?,
        started_at: r.time()?,
        last_active: r.time()?,
    })
}

fn node_from_row(row: &SqlRow) -> Result<WorkflowNode, DatabaseError> {
    let mut r = row.reader("decode_workflow_node");
    Ok(WorkflowNode {
        id: r.text()?,
        workflow_id: r.text()?,
        node_key: r.text()?,
        node_type: r.parse()?,
        role_required: r.text()?,
        persona_hint: r.text()?,
        max_attempts: r.uint()?,
        timeout_minutes: r.uint()?,
        instructions: r.text()?,
        metadata: r.json()?,
    })
}

fn edge_from_row(row: &SqlRow) -> Result<WorkflowEdge, DatabaseError> {
    let mut r = row.reader("decode_workflow_edge");
    Ok(WorkflowEdge {
        id: r.text()?,
        workflow_id: r.text()?,
        from_node_key: r.text()?,
        to_node_key: r.text()?,
        condition: r.parse()?,
        priority: r.int()? as i32,
    })
}

fn execution_from_row(row: &SqlRow) -> Result<WorkflowExecution, DatabaseError> {
    let mut r = row.reader("decode_workflow_execution");
    Ok(WorkflowExecution {
        id: r.text()?,
        workflow_id: r.text()?,
        bead_id: r.text()?,
        project_id: r.text()?,
        current_node_key: r.text()?,
        status: r.parse()?,
        cycle_count: r.uint()?,
        node_attempt_count: r.uint()?,
        started_at: r.time()?,
        completed_at: r.opt_time()?,
        escalated_at: r.opt_time()?,
        last_node_at: r.time()?,
    })
}

fn history_from_row(row: &SqlRow) -> Result<WorkflowHistoryEntry, DatabaseError> {
    let mut r = row.reader("decode_workflow_history");
    Ok(WorkflowHistoryEntry {
        id: r.text()?,
        execution_id: r.text()?,
        node_key: r.text()?,
        agent_id: r.text()?,
        condition: r.parse()?,
        result_data: r.json()?,
        attempt_number: r.uint()?,
        created_at: r.time()?,
    })
}

fn provider_from_row(row: &SqlRow) -> Result<Provider, DatabaseError> {
    let mut r = row.reader("decode_provider");
    Ok(Provider {
        id: r.text()?,
        name: r.text()?,
        provider_type: r.parse()?,
        endpoint: r.text()?,
        model: r.text()?,
        configured_model: r.text()?,
        selected_model: r.text()?,
        selection_reason: r.text()?,
        model_score: r.real()?,
        selected_gpu: r.text()?,
        gpu_constraints: r.text()?,
        description: r.text()?,
        requires_key: r.boolean()?,
        key_id: r.text()?,
        api_key_encrypted: r.blob()?,
        owner_id: r.text()?,
        is_shared: r.boolean()?,
        status: r.parse()?,
        last_heartbeat_at: r.opt_time()?,
        last_heartbeat_latency_ms: r.int()?,
        last_heartbeat_error: r.text()?,
        cost_per_mtoken: r.real()?,
        context_window: r.int()?,
        supports_function: r.boolean()?,
        supports_vision: r.boolean()?,
        supports_streaming: r.boolean()?,
        tags: r.json()?,
        metrics: r.json()?,
        created_at: r.time()?,
        updated_at: r.time()?,
    })
}

fn credential_from_row(row: &SqlRow) -> Result<Credential, DatabaseError> {
    let mut r = row.reader("decode_credential");
    Ok(Credential {
        id: r.text()?,
        project_id: r.text()?,
        credential_type: r.text()?,
        private_key_encrypted: r.blob()?,
        public_key: r.text()?,
        key_id: r.text()?,
        description: r.text()?,
        created_at: r.time()?,
        updated_at: r.time()?,
        rotated_at: r.opt_time()?,
    })
}

fn conversation_from_row(row: &SqlRow) -> Result<ConversationContext, DatabaseError> {
    let mut r = row.reader("decode_conversation");
    Ok(ConversationContext {
        session_id: r.text()?,
        bead_id: r.text()?,
        project_id: r.text()?,
        messages: r.json()?,
        metadata: r.json()?,
        token_count: r.int()?,
        created_at: r.time()?,
        updated_at: r.time()?,
        expires_at: r.time()?,
    })
}

fn activity_from_row(row: &SqlRow) -> Result<Activity, DatabaseError> {
    let mut r = row.reader("decode_activity");
    Ok(Activity {
        id: r.text()?,
        event_type: r.text()?,
        timestamp: r.time()?,
        actor_id: r.text()?,
        project_id: r.text()?,
        resource_type: r.text()?,
        resource_id: r.text()?,
        action: r.text()?,
        aggregation_key: r.opt_text()?,
        aggregation_count: r.int()?,
        visibility: r.parse()?,
        metadata: r.json()?,
    })
}

fn notification_from_row(row: &SqlRow) -> Result<Notification, DatabaseError> {
    let mut r = row.reader("decode_notification");
    Ok(Notification {
        id: r.text()?,
        user_id: r.text()?,
        event_type: r.text()?,
        title: r.text()?,
        message: r.text()?,
        status: r.parse()?,
        priority: r.parse()?,
        resource_id: r.text()?,
        created_at: r.time()?,
        read_at: r.opt_time()?,
        archived_at: r.opt_time()?,
    })
}

fn preferences_from_row(row: &SqlRow) -> Result<NotificationPreferences, DatabaseError> {
    let mut r = row.reader("decode_preferences");
    let user_id = r.text()?;
    let digest_mode = r.parse()?;
    let quiet_start = r.opt_int()?;
    let quiet_end = r.opt_int()?;
    let quiet_hours = match (quiet_start, quiet_end) {
        (Some(start), Some(end)) => Some((start as u32, end as u32)),
        _ => None,
    };
    Ok(NotificationPreferences {
        user_id,
        digest_mode,
        quiet_hours,
        min_priority: r.parse()?,
        subscribed_events: r.json()?,
    })
}

fn comment_from_row(row: &SqlRow) -> Result<Comment, DatabaseError> {
    let mut r = row.reader("decode_comment");
    Ok(Comment {
        id: r.text()?,
        bead_id: r.text()?,
        parent_id: r.opt_text()?,
        author_id: r.text()?,
        content: r.text()?,
        created_at: r.time()?,
        updated_at: r.time()?,
        edited: r.boolean()?,
        deleted: r.boolean()?,
    })
}

fn mention_from_row(row: &SqlRow) -> Result<Mention, DatabaseError> {
    let mut r = row.reader("decode_mention");
    Ok(Mention {
        id: r.text()?,
        comment_id: r.text()?,
        mentioned_user_id: r.text()?,
        notified_at: r.opt_time()?,
    })
}

fn lesson_from_row(row: &SqlRow) -> Result<Lesson, DatabaseError> {
    let mut r = row.reader("decode_lesson");
    Ok(Lesson {
        id: r.text()?,
        project_id: r.text()?,
        category: r.text()?,
        title: r.text()?,
        detail: r.text()?,
        source_bead_id: r.text()?,
        source_agent_id: r.text()?,
        relevance_score: r.real()?,
        created_at: r.time()?,
        embedding: r.opt_blob()?,
    })
}

fn memory_from_row(row: &SqlRow) -> Result<MemoryEntry, DatabaseError> {
    let mut r = row.reader("decode_memory");
    Ok(MemoryEntry {
        project_id: r.text()?,
        category: r.text()?,
        key: r.text()?,
        value: r.text()?,
        confidence: r.real()?,
        updated_at: r.time()?,
        source_bead: r.text()?,
    })
}

fn lock_from_row(row: &SqlRow) -> Result<AdvisoryLock, DatabaseError> {
    let mut r = row.reader("decode_lock");
    Ok(AdvisoryLock {
        lock_name: r.text()?,
        instance_id: r.text()?,
        acquired_at: r.time()?,
        expires_at: r.time()?,
        heartbeat_at: r.time()?,
    })
}

fn instance_from_row(row: &SqlRow) -> Result<Instance, DatabaseError> {
    let mut r = row.reader("decode_instance");
    Ok(Instance {
        instance_id: r.text()?,
        hostname: r.text()?,
        started_at: r.time()?,
        last_heartbeat: r.time()?,
        status: r.text()?,
        metadata: r.json()?,
    })
}

// ==================== Store ====================

/// Relational store over any [`SqlDriver`].
pub struct SqlStore<D: SqlDriver> {
    driver: D,
}

impl<D: SqlDriver> SqlStore<D> {
    /// Wrap a driver and create missing tables.
    pub async fn connect(driver: D) -> Result<Self, DatabaseError> {
        let store = Self { driver };
        store
            .driver
            .execute_script(&schema::statements(store.driver.dialect()))
            .await?;
        tracing::debug!(dialect = ?store.driver.dialect(), "SQL schema ready");
        Ok(store)
    }

    fn sql(&self, template: &str) -> String {
        match self.driver.dialect() {
            Dialect::Sqlite => template.to_string(),
            Dialect::Postgres => rebind(template),
        }
    }

    fn stmt(&self, template: &str, params: Vec<SqlValue>) -> Statement {
        Statement {
            sql: self.sql(template),
            params,
        }
    }

    async fn query(&self, template: &str, params: Vec<SqlValue>) -> Result<Vec<SqlRow>, DatabaseError> {
        self.driver.query(&self.sql(template), &params).await
    }

    async fn query_one<T>(
        &self,
        template: &str,
        params: Vec<SqlValue>,
        decode: fn(&SqlRow) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let rows = self.query(template, params).await?;
        rows.first().map(decode).transpose()
    }

    async fn query_all<T>(
        &self,
        template: &str,
        params: Vec<SqlValue>,
        decode: fn(&SqlRow) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let rows = self.query(template, params).await?;
        rows.iter().map(decode).collect()
    }

    async fn load_workflow(&self, row: &SqlRow) -> Result<Workflow, DatabaseError> {
        let mut r = row.reader("decode_workflow");
        let mut workflow = Workflow {
            id: r.text()?,
            name: r.text()?,
            description: r.text()?,
            workflow_type: r.text()?,
            is_default: r.boolean()?,
            project_id: r.text()?,
            nodes: Vec::new(),
            edges: Vec::new(),
        };
        workflow.nodes = self
            .query_all(
                &format!("SELECT {NODE_COLS} FROM workflow_nodes WHERE workflow_id = ? ORDER BY ordinal"),
                vec![workflow.id.clone().into()],
                node_from_row,
            )
            .await?;
        workflow.edges = self
            .query_all(
                &format!("SELECT {EDGE_COLS} FROM workflow_edges WHERE workflow_id = ? ORDER BY ordinal"),
                vec![workflow.id.clone().into()],
                edge_from_row,
            )
            .await?;
        Ok(workflow)
    }

    /// Translate one staged write into statements.
    fn statements_for(
        &self,
        op: WriteOp,
        now: DateTime<Utc>,
        out: &mut Vec<Statement>,
    ) -> Result<(), DatabaseError> {
        let name = op.name();
        match op {
            WriteOp::UpsertProject(p) => out.push(self.stmt(
                &upsert_sql("projects", PROJECT_COLS, &["id"], &["created_at"]),
                vec![
                    p.id.into(),
                    p.name.into(),
                    p.git_repo.into(),
                    p.branch.into(),
                    p.beads_path.into(),
                    p.parent_id.into(),
                    p.is_perpetual.into(),
                    p.is_sticky.into(),
                    p.status.as_str().into(),
                    p.git_strategy.as_str().into(),
                    json(name, &p.context)?,
                    p.schema_version.into(),
                    p.created_at.into(),
                    now.into(),
                    p.closed_at.into(),
                ],
            )),
            WriteOp::DeleteProject(id) => {
                let beads = "SELECT id FROM beads WHERE project_id = ?";
                let p = || vec![SqlValue::from(&id)];
                out.push(self.stmt(
                    &format!(
                        "DELETE FROM mentions WHERE comment_id IN \
                         (SELECT id FROM comments WHERE bead_id IN ({beads}))"
                    ),
                    p(),
                ));
                out.push(self.stmt(
                    &format!("DELETE FROM comments WHERE bead_id IN ({beads})"),
                    p(),
                ));
                out.push(self.stmt(
                    &format!(
                        "DELETE FROM workflow_execution_history WHERE execution_id IN \
                         (SELECT id FROM workflow_executions WHERE project_id = ? OR bead_id IN ({beads}))"
                    ),
                    vec![SqlValue::from(&id), SqlValue::from(&id)],
                ));
                out.push(self.stmt(
                    &format!(
                        "DELETE FROM workflow_executions WHERE project_id = ? OR bead_id IN ({beads})"
                    ),
                    vec![SqlValue::from(&id), SqlValue::from(&id)],
                ));
                out.push(self.stmt(
                    &format!(
                        "DELETE FROM conversation_contexts WHERE project_id = ? OR bead_id IN ({beads})"
                    ),
                    vec![SqlValue::from(&id), SqlValue::from(&id)],
                ));
                for table in [
                    "beads",
                    "agents",
                    "credentials",
                    "activity_feed",
                    "lessons",
                    "project_memory",
                ] {
                    out.push(self.stmt(&format!("DELETE FROM {table} WHERE project_id = ?"), p()));
                }
                out.push(self.stmt("UPDATE projects SET parent_id = NULL WHERE parent_id = ?", p()));
                out.push(self.stmt("DELETE FROM projects WHERE id = ?", p()));
            }
            WriteOp::UpsertUser(u) => out.push(self.stmt(
                &upsert_sql("users", USER_COLS, &["id"], &["created_at"]),
                vec![
                    u.id.into(),
                    u.username.into(),
                    u.display_name.into(),
                    u.email.into(),
                    u.created_at.into(),
                ],
            )),
            WriteOp::UpsertBead(b) => out.push(self.stmt(
                &upsert_sql("beads", BEAD_COLS, &["id"], &["created_at"]),
                vec![
                    b.id.into(),
                    b.project_id.into(),
                    b.title.into(),
                    b.description.into(),
                    b.priority.as_str().into(),
                    b.bead_type.into(),
                    b.status.as_str().into(),
                    b.assigned_to.into(),
                    json(name, &b.context)?,
                    b.created_at.into(),
                    now.into(),
                ],
            )),
            WriteOp::DeleteBead(id) => {
                let p = || vec![SqlValue::from(&id)];
                out.push(self.stmt(
                    "DELETE FROM mentions WHERE comment_id IN (SELECT id FROM comments WHERE bead_id = ?)",
                    p(),
                ));
                out.push(self.stmt("DELETE FROM comments WHERE bead_id = ?", p()));
                out.push(self.stmt(
                    "DELETE FROM workflow_execution_history WHERE execution_id IN \
                     (SELECT id FROM workflow_executions WHERE bead_id = ?)",
                    p(),
                ));
                out.push(self.stmt("DELETE FROM workflow_executions WHERE bead_id = ?", p()));
                out.push(self.stmt("DELETE FROM conversation_contexts WHERE bead_id = ?", p()));
                out.push(self.stmt("DELETE FROM beads WHERE id = ?", p()));
            }
            WriteOp::UpsertAgent(a) => out.push(self.stmt(
                &upsert_sql("agents", AGENT_COLS, &["id"], &["started_at"]),
                vec![
                    a.id.into(),
                    a.name.into(),
                    a.role.into(),
                    a.persona_name.into(),
                    a.provider_id.into(),
                    a.status.as_str().into(),
                    a.current_bead.into(),
                    a.project_id.into(),
                    a.position_id.into(),
                    a.started_at.into(),
                    a.last_active.into(),
                ],
            )),
            WriteOp::DeleteAgent(id) => {
                out.push(self.stmt("DELETE FROM agents WHERE id = ?", vec![id.into()]))
            }
            WriteOp::UpsertWorkflow(w) => {
                out.push(self.stmt(
                    &upsert_sql("workflows", WORKFLOW_COLS, &["id"], &[]),
                    vec![
                        w.id.clone().into(),
                        w.name.into(),
                        w.description.into(),
                        w.workflow_type.into(),
                        w.is_default.into(),
                        w.project_id.into(),
                    ],
                ));
                out.push(self.stmt(
                    "DELETE FROM workflow_nodes WHERE workflow_id = ?",
                    vec![w.id.clone().into()],
                ));
                out.push(self.stmt(
                    "DELETE FROM workflow_edges WHERE workflow_id = ?",
                    vec![w.id.clone().into()],
                ));
                for (ordinal, n) in w.nodes.into_iter().enumerate() {
                    out.push(self.stmt(
                        &format!("INSERT INTO workflow_nodes ({NODE_COLS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"),
                        vec![
                            n.id.into(),
                            w.id.clone().into(),
                            n.node_key.into(),
                            n.node_type.as_str().into(),
                            n.role_required.into(),
                            n.persona_hint.into(),
                            n.max_attempts.into(),
                            n.timeout_minutes.into(),
                            n.instructions.into(),
                            json(name, &n.metadata)?,
                            (ordinal as i64).into(),
                        ],
                    ));
                }
                for (ordinal, e) in w.edges.into_iter().enumerate() {
                    out.push(self.stmt(
                        &format!("INSERT INTO workflow_edges ({EDGE_COLS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
                        vec![
                            e.id.into(),
                            w.id.clone().into(),
                            e.from_node_key.into(),
                            e.to_node_key.into(),
                            e.condition.as_str().into(),
                            e.priority.into(),
                            (ordinal as i64).into(),
                        ],
                    ));
                }
            }
            WriteOp::DeleteWorkflow(id) => {
                for table in ["workflow_nodes", "workflow_edges"] {
                    out.push(self.stmt(
                        &format!("DELETE FROM {table} WHERE workflow_id = ?"),
                        vec![SqlValue::from(&id)],
                    ));
                }
                out.push(self.stmt("DELETE FROM workflows WHERE id = ?", vec![id.into()]));
            }
            WriteOp::UpsertExecution(e) => out.push(self.stmt(
                &upsert_sql("workflow_executions", EXECUTION_COLS, &["id"], &["started_at"]),
                vec![
                    e.id.into(),
                    e.workflow_id.into(),
                    e.bead_id.into(),
                    e.project_id.into(),
                    e.current_node_key.into(),
                    e.status.as_str().into(),
                    e.cycle_count.into(),
                    e.node_attempt_count.into(),
                    e.started_at.into(),
                    e.completed_at.into(),
                    e.escalated_at.into(),
                    e.last_node_at.into(),
                ],
            )),
            WriteOp::AppendHistory(h) => out.push(self.stmt(
                &format!(
                    "INSERT INTO workflow_execution_history ({HISTORY_COLS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                vec![
                    h.id.into(),
                    h.execution_id.into(),
                    h.node_key.into(),
                    h.agent_id.into(),
                    h.condition.as_str().into(),
                    json(name, &h.result_data)?,
                    h.attempt_number.into(),
                    h.created_at.into(),
                ],
            )),
            WriteOp::DeleteHistory { execution_id } => out.push(self.stmt(
                "DELETE FROM workflow_execution_history WHERE execution_id = ?",
                vec![execution_id.into()],
            )),
            WriteOp::DeleteExecution { execution_id } => {
                out.push(self.stmt(
                    "DELETE FROM workflow_execution_history WHERE execution_id = ?",
                    vec![SqlValue::from(&execution_id)],
                ));
                out.push(self.stmt(
                    "DELETE FROM workflow_executions WHERE id = ?",
                    vec![execution_id.into()],
                ));
            }
            WriteOp::UpsertProvider(p) => out.push(self.stmt(
                &upsert_sql("providers", PROVIDER_COLS, &["id"], &["created_at"]),
                vec![
                    p.id.into(),
                    p.name.into(),
                    p.provider_type.as_str().into(),
                    p.endpoint.into(),
                    p.model.into(),
                    p.configured_model.into(),
                    p.selected_model.into(),
                    p.selection_reason.into(),
                    p.model_score.into(),
                    p.selected_gpu.into(),
                    p.gpu_constraints.into(),
                    p.description.into(),
                    p.requires_key.into(),
                    p.key_id.into(),
                    p.api_key_encrypted.into(),
                    p.owner_id.into(),
                    p.is_shared.into(),
                    p.status.as_str().into(),
                    p.last_heartbeat_at.into(),
                    p.last_heartbeat_latency_ms.into(),
                    p.last_heartbeat_error.into(),
                    p.cost_per_mtoken.into(),
                    p.context_window.into(),
                    p.supports_function.into(),
                    p.supports_vision.into(),
                    p.supports_streaming.into(),
                    json(name, &p.tags)?,
                    json(name, &p.metrics)?,
                    p.created_at.into(),
                    now.into(),
                ],
            )),
            WriteOp::DeleteProvider(id) => {
                out.push(self.stmt("DELETE FROM providers WHERE id = ?", vec![id.into()]))
            }
            WriteOp::UpsertCredential(c) => out.push(self.stmt(
                &upsert_sql("credentials", CREDENTIAL_COLS, &["id"], &["created_at"]),
                vec![
                    c.id.into(),
                    c.project_id.into(),
                    c.credential_type.into(),
                    c.private_key_encrypted.into(),
                    c.public_key.into(),
                    c.key_id.into(),
                    c.description.into(),
                    c.created_at.into(),
                    now.into(),
                    c.rotated_at.into(),
                ],
            )),
            WriteOp::DeleteCredential(id) => {
                out.push(self.stmt("DELETE FROM credentials WHERE id = ?", vec![id.into()]))
            }
            WriteOp::UpsertConversation(c) => out.push(self.stmt(
                &upsert_sql(
                    "conversation_contexts",
                    CONVERSATION_COLS,
                    &["session_id"],
                    &["created_at"],
                ),
                vec![
                    c.session_id.into(),
                    c.bead_id.into(),
                    c.project_id.into(),
                    json(name, &c.messages)?,
                    json(name, &c.metadata)?,
                    c.token_count.into(),
                    c.created_at.into(),
                    now.into(),
                    c.expires_at.into(),
                ],
            )),
            WriteOp::DeleteConversation(id) => out.push(self.stmt(
                "DELETE FROM conversation_contexts WHERE session_id = ?",
                vec![id.into()],
            )),
            WriteOp::UpsertActivity(a) => out.push(self.stmt(
                &upsert_sql("activity_feed", ACTIVITY_COLS, &["id"], &[]),
                vec![
                    a.id.into(),
                    a.event_type.into(),
                    a.timestamp.into(),
                    a.actor_id.into(),
                    a.project_id.into(),
                    a.resource_type.into(),
                    a.resource_id.into(),
                    a.action.into(),
                    a.aggregation_key.into(),
                    a.aggregation_count.into(),
                    a.visibility.as_str().into(),
                    json(name, &a.metadata)?,
                ],
            )),
            WriteOp::UpsertNotification(n) => out.push(self.stmt(
                &upsert_sql("notifications", NOTIFICATION_COLS, &["id"], &["created_at"]),
                vec![
                    n.id.into(),
                    n.user_id.into(),
                    n.event_type.into(),
                    n.title.into(),
                    n.message.into(),
                    n.status.as_str().into(),
                    n.priority.as_str().into(),
                    n.resource_id.into(),
                    n.created_at.into(),
                    n.read_at.into(),
                    n.archived_at.into(),
                ],
            )),
            WriteOp::UpsertPreferences(p) => out.push(self.stmt(
                &upsert_sql("notification_preferences", PREFERENCE_COLS, &["user_id"], &[]),
                vec![
                    p.user_id.into(),
                    p.digest_mode.as_str().into(),
                    p.quiet_hours.map(|(s, _)| s).into(),
                    p.quiet_hours.map(|(_, e)| e).into(),
                    p.min_priority.as_str().into(),
                    json(name, &p.subscribed_events)?,
                ],
            )),
            WriteOp::UpsertComment(c) => out.push(self.stmt(
                &upsert_sql("comments", COMMENT_COLS, &["id"], &["created_at"]),
                vec![
                    c.id.into(),
                    c.bead_id.into(),
                    c.parent_id.into(),
                    c.author_id.into(),
                    c.content.into(),
                    c.created_at.into(),
                    now.into(),
                    c.edited.into(),
                    c.deleted.into(),
                ],
            )),
            WriteOp::InsertMention(m) => out.push(self.stmt(
                &upsert_sql("mentions", MENTION_COLS, &["id"], &[]),
                vec![
                    m.id.into(),
                    m.comment_id.into(),
                    m.mentioned_user_id.into(),
                    m.notified_at.into(),
                ],
            )),
            WriteOp::InsertLesson(l) => out.push(self.stmt(
                &upsert_sql("lessons", LESSON_COLS, &["id"], &["created_at"]),
                vec![
                    l.id.into(),
                    l.project_id.into(),
                    l.category.into(),
                    l.title.into(),
                    l.detail.into(),
                    l.source_bead_id.into(),
                    l.source_agent_id.into(),
                    l.relevance_score.into(),
                    l.created_at.into(),
                    l.embedding.into(),
                ],
            )),
            WriteOp::UpsertMemory(m) => out.push(self.stmt(
                &upsert_sql(
                    "project_memory",
                    MEMORY_COLS,
                    &["project_id", "category", "key"],
                    &[],
                ),
                vec![
                    m.project_id.into(),
                    m.category.into(),
                    m.key.into(),
                    m.value.into(),
                    m.confidence.into(),
                    now.into(),
                    m.source_bead.into(),
                ],
            )),
            WriteOp::DeleteMemory {
                project_id,
                category,
                key,
            } => out.push(self.stmt(
                "DELETE FROM project_memory WHERE project_id = ? AND category = ? AND key = ?",
                vec![project_id.into(), category.into(), key.into()],
            )),
            WriteOp::UpsertInstance(i) => out.push(self.stmt(
                &upsert_sql("instances", INSTANCE_COLS, &["instance_id"], &["started_at"]),
                vec![
                    i.instance_id.into(),
                    i.hostname.into(),
                    i.started_at.into(),
                    i.last_heartbeat.into(),
                    i.status.into(),
                    json(name, &i.metadata)?,
                ],
            )),
        }
        Ok(())
    }
}

#[async_trait]
impl<D: SqlDriver> Database for SqlStore<D> {
    async fn commit(&self, batch: WriteBatch) -> Result<(), DatabaseError> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut statements = Vec::new();
        for op in batch.into_ops() {
            self.statements_for(op, now, &mut statements)?;
        }
        self.driver.transaction(&statements).await
    }

    // ==================== Projects & users ====================

    async fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        self.query_one(
            &format!("SELECT {PROJECT_COLS} FROM projects WHERE id = ?"),
            vec![id.into()],
            project_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_project", "project", id))
    }

    async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        self.query_all(
            &format!("SELECT {PROJECT_COLS} FROM projects ORDER BY created_at, id"),
            vec![],
            project_from_row,
        )
        .await
    }

    async fn get_user(&self, id: &str) -> Result<User, DatabaseError> {
        self.query_one(
            &format!("SELECT {USER_COLS} FROM users WHERE id = ?"),
            vec![id.into()],
            user_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_user", "user", id))
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        self.query_one(
            &format!("SELECT {USER_COLS} FROM users WHERE LOWER(username) = LOWER(?)"),
            vec![username.into()],
            user_from_row,
        )
        .await
    }

    // ==================== Beads ====================

    async fn get_bead(&self, id: &str) -> Result<Bead, DatabaseError> {
        self.query_one(
            &format!("SELECT {BEAD_COLS} FROM beads WHERE id = ?"),
            vec![id.into()],
            bead_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_bead", "bead", id))
    }

    async fn list_beads(&self, filter: &BeadFilter) -> Result<Vec<Bead>, DatabaseError> {
        let mut sql = format!("SELECT {BEAD_COLS} FROM beads WHERE 1 = 1");
        let mut params = Vec::new();
        if let Some(project_id) = &filter.project_id {
            sql.push_str(" AND project_id = ?");
            params.push(project_id.into());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params.push(status.as_str().into());
        }
        if let Some(assigned_to) = &filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            params.push(assigned_to.into());
        }
        sql.push_str(" ORDER BY created_at, id");
        self.query_all(&sql, params, bead_from_row).await
    }

    async fn eligible_beads_for_dispatch(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Bead>, DatabaseError> {
        let mut sql = format!(
            "SELECT {} FROM beads b LEFT JOIN agents a ON a.id = b.assigned_to \
             WHERE b.status IN ('open', 'in_progress') \
             AND (b.assigned_to = '' OR a.id IS NULL OR a.status = 'idle')",
            qualified("b", BEAD_COLS)
        );
        let mut params = Vec::new();
        if let Some(project_id) = project_id {
            sql.push_str(" AND b.project_id = ?");
            params.push(project_id.into());
        }
        sql.push_str(" ORDER BY b.priority, b.created_at, b.id");
        let mut beads = self.query_all(&sql, params, bead_from_row).await?;
        beads.retain(bead_is_dispatchable);
        beads.truncate(limit);
        Ok(beads)
    }

    async fn open_beads_for_project(&self, project_id: &str) -> Result<Vec<Bead>, DatabaseError> {
        self.query_all(
            &format!(
                "SELECT {BEAD_COLS} FROM beads WHERE project_id = ? \
                 AND status IN ('open', 'in_progress') ORDER BY created_at, id"
            ),
            vec![project_id.into()],
            bead_from_row,
        )
        .await
    }

    // ==================== Agents ====================

    async fn get_agent(&self, id: &str) -> Result<Agent, DatabaseError> {
        self.query_one(
            &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?"),
            vec![id.into()],
            agent_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_agent", "agent", id))
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>, DatabaseError> {
        let mut sql = format!("SELECT {AGENT_COLS} FROM agents WHERE 1 = 1");
        let mut params = Vec::new();
        if let Some(project_id) = &filter.project_id {
            sql.push_str(" AND project_id = ?");
            params.push(project_id.into());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params.push(status.as_str().into());
        }
        sql.push_str(" ORDER BY started_at, id");
        self.query_all(&sql, params, agent_from_row).await
    }

    // ==================== Workflows ====================

    async fn get_workflow(&self, id: &str) -> Result<Workflow, DatabaseError> {
        let rows = self
            .query(
                &format!("SELECT {WORKFLOW_COLS} FROM workflows WHERE id = ?"),
                vec![id.into()],
            )
            .await?;
        match rows.first() {
            Some(row) => self.load_workflow(row).await,
            None => Err(DatabaseError::not_found("get_workflow", "workflow", id)),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, DatabaseError> {
        let rows = self
            .query(&format!("SELECT {WORKFLOW_COLS} FROM workflows ORDER BY id"), vec![])
            .await?;
        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(self.load_workflow(row).await?);
        }
        Ok(workflows)
    }

    async fn get_execution(&self, id: &str) -> Result<WorkflowExecution, DatabaseError> {
        self.query_one(
            &format!("SELECT {EXECUTION_COLS} FROM workflow_executions WHERE id = ?"),
            vec![id.into()],
            execution_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_execution", "workflow_execution", id))
    }

    async fn get_execution_by_bead(
        &self,
        bead_id: &str,
    ) -> Result<Option<WorkflowExecution>, DatabaseError> {
        self.query_one(
            &format!("SELECT {EXECUTION_COLS} FROM workflow_executions WHERE bead_id = ?"),
            vec![bead_id.into()],
            execution_from_row,
        )
        .await
    }

    async fn list_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowHistoryEntry>, DatabaseError> {
        self.query_all(
            &format!(
                "SELECT {HISTORY_COLS} FROM workflow_execution_history \
                 WHERE execution_id = ? ORDER BY seq"
            ),
            vec![execution_id.into()],
            history_from_row,
        )
        .await
    }

    // ==================== Providers & credentials ====================

    async fn get_provider(&self, id: &str) -> Result<Provider, DatabaseError> {
        self.query_one(
            &format!("SELECT {PROVIDER_COLS} FROM providers WHERE id = ?"),
            vec![id.into()],
            provider_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_provider", "provider", id))
    }

    async fn list_providers(&self) -> Result<Vec<Provider>, DatabaseError> {
        self.query_all(
            &format!("SELECT {PROVIDER_COLS} FROM providers ORDER BY id"),
            vec![],
            provider_from_row,
        )
        .await
    }

    async fn get_credential(&self, id: &str) -> Result<Credential, DatabaseError> {
        self.query_one(
            &format!("SELECT {CREDENTIAL_COLS} FROM credentials WHERE id = ?"),
            vec![id.into()],
            credential_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_credential", "credential", id))
    }

    async fn list_credentials(&self, project_id: &str) -> Result<Vec<Credential>, DatabaseError> {
        self.query_all(
            &format!(
                "SELECT {CREDENTIAL_COLS} FROM credentials WHERE project_id = ? ORDER BY created_at, id"
            ),
            vec![project_id.into()],
            credential_from_row,
        )
        .await
    }

    // ==================== Conversations ====================

    async fn get_conversation(
        &self,
        session_id: &str,
    ) -> Result<ConversationContext, DatabaseError> {
        self.query_one(
            &format!("SELECT {CONVERSATION_COLS} FROM conversation_contexts WHERE session_id = ?"),
            vec![session_id.into()],
            conversation_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_conversation", "conversation", session_id))
    }

    async fn list_conversations_for_bead(
        &self,
        bead_id: &str,
    ) -> Result<Vec<ConversationContext>, DatabaseError> {
        self.query_all(
            &format!(
                "SELECT {CONVERSATION_COLS} FROM conversation_contexts \
                 WHERE bead_id = ? ORDER BY updated_at DESC"
            ),
            vec![bead_id.into()],
            conversation_from_row,
        )
        .await
    }

    async fn delete_expired_conversations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.driver
            .execute(
                &self.sql("DELETE FROM conversation_contexts WHERE expires_at <= ?"),
                &[now.into()],
            )
            .await
    }

    // ==================== Activity ====================

    async fn recent_aggregatable_activity(
        &self,
        aggregation_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activity>, DatabaseError> {
        self.query_one(
            &format!(
                "SELECT {ACTIVITY_COLS} FROM activity_feed \
                 WHERE aggregation_key = ? AND occurred_at > ? \
                 ORDER BY occurred_at DESC LIMIT 1"
            ),
            vec![aggregation_key.into(), since.into()],
            activity_from_row,
        )
        .await
    }

    async fn list_activity(
        &self,
        project_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Activity>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        match project_id {
            Some(project_id) => {
                self.query_all(
                    &format!(
                        "SELECT {ACTIVITY_COLS} FROM activity_feed WHERE project_id = ? \
                         ORDER BY occurred_at DESC, id LIMIT ?"
                    ),
                    vec![project_id.into(), limit.into()],
                    activity_from_row,
                )
                .await
            }
            None => {
                self.query_all(
                    &format!(
                        "SELECT {ACTIVITY_COLS} FROM activity_feed \
                         ORDER BY occurred_at DESC, id LIMIT ?"
                    ),
                    vec![limit.into()],
                    activity_from_row,
                )
                .await
            }
        }
    }

    // ==================== Notifications ====================

    async fn get_notification(&self, id: &str) -> Result<Notification, DatabaseError> {
        self.query_one(
            &format!("SELECT {NOTIFICATION_COLS} FROM notifications WHERE id = ?"),
            vec![id.into()],
            notification_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_notification", "notification", id))
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        status: Option<NotificationStatus>,
    ) -> Result<Vec<Notification>, DatabaseError> {
        let mut sql = format!("SELECT {NOTIFICATION_COLS} FROM notifications WHERE user_id = ?");
        let mut params = vec![user_id.into()];
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            params.push(status.as_str().into());
        }
        sql.push_str(" ORDER BY created_at DESC, id");
        self.query_all(&sql, params, notification_from_row).await
    }

    async fn get_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPreferences>, DatabaseError> {
        self.query_one(
            &format!("SELECT {PREFERENCE_COLS} FROM notification_preferences WHERE user_id = ?"),
            vec![user_id.into()],
            preferences_from_row,
        )
        .await
    }

    // ==================== Comments ====================

    async fn get_comment(&self, id: &str) -> Result<Comment, DatabaseError> {
        self.query_one(
            &format!("SELECT {COMMENT_COLS} FROM comments WHERE id = ?"),
            vec![id.into()],
            comment_from_row,
        )
        .await?
        .ok_or_else(|| DatabaseError::not_found("get_comment", "comment", id))
    }

    async fn list_comments(&self, bead_id: &str) -> Result<Vec<Comment>, DatabaseError> {
        self.query_all(
            &format!("SELECT {COMMENT_COLS} FROM comments WHERE bead_id = ? ORDER BY created_at, id"),
            vec![bead_id.into()],
            comment_from_row,
        )
        .await
    }

    async fn list_mentions(&self, comment_id: &str) -> Result<Vec<Mention>, DatabaseError> {
        self.query_all(
            &format!(
                "SELECT {MENTION_COLS} FROM mentions WHERE comment_id = ? ORDER BY mentioned_user_id"
            ),
            vec![comment_id.into()],
            mention_from_row,
        )
        .await
    }

    // ==================== Knowledge ====================

    async fn recent_lessons(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Lesson>, DatabaseError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_all(
            &format!(
                "SELECT {LESSON_COLS} FROM lessons WHERE project_id = ? \
                 ORDER BY created_at DESC LIMIT ?"
            ),
            vec![project_id.into(), limit.into()],
            lesson_from_row,
        )
        .await
    }

    async fn get_memory(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
    ) -> Result<Option<MemoryEntry>, DatabaseError> {
        self.query_one(
            &format!(
                "SELECT {MEMORY_COLS} FROM project_memory \
                 WHERE project_id = ? AND category = ? AND key = ?"
            ),
            vec![project_id.into(), category.into(), key.into()],
            memory_from_row,
        )
        .await
    }

    async fn list_memory(
        &self,
        project_id: &str,
        category: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, DatabaseError> {
        match category {
            Some(category) => {
                self.query_all(
                    &format!(
                        "SELECT {MEMORY_COLS} FROM project_memory \
                         WHERE project_id = ? AND category = ? ORDER BY category, key"
                    ),
                    vec![project_id.into(), category.into()],
                    memory_from_row,
                )
                .await
            }
            None => {
                self.query_all(
                    &format!(
                        "SELECT {MEMORY_COLS} FROM project_memory \
                         WHERE project_id = ? ORDER BY category, key"
                    ),
                    vec![project_id.into()],
                    memory_from_row,
                )
                .await
            }
        }
    }

    // ==================== Coordination ====================

    async fn try_acquire_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "INSERT INTO advisory_locks ({LOCK_COLS}) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (lock_name) DO UPDATE SET \
             acquired_at = CASE WHEN advisory_locks.instance_id = excluded.instance_id \
                 THEN advisory_locks.acquired_at ELSE excluded.acquired_at END, \
             instance_id = excluded.instance_id, \
             expires_at = excluded.expires_at, \
             heartbeat_at = excluded.heartbeat_at \
             WHERE advisory_locks.instance_id = excluded.instance_id \
                OR advisory_locks.expires_at < excluded.heartbeat_at"
        );
        self.driver
            .execute(
                &self.sql(&sql),
                &[
                    lock_name.into(),
                    instance_id.into(),
                    now.into(),
                    (now + ttl).into(),
                    now.into(),
                ],
            )
            .await?;
        let holder = self.get_lock(lock_name).await?;
        Ok(holder.is_some_and(|l| l.instance_id == instance_id))
    }

    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<(), DatabaseError> {
        self.driver
            .execute(
                &self.sql("DELETE FROM advisory_locks WHERE lock_name = ? AND instance_id = ?"),
                &[lock_name.into(), instance_id.into()],
            )
            .await?;
        Ok(())
    }

    async fn get_lock(&self, lock_name: &str) -> Result<Option<AdvisoryLock>, DatabaseError> {
        self.query_one(
            &format!("SELECT {LOCK_COLS} FROM advisory_locks WHERE lock_name = ?"),
            vec![lock_name.into()],
            lock_from_row,
        )
        .await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DatabaseError> {
        self.query_all(
            &format!("SELECT {INSTANCE_COLS} FROM instances ORDER BY instance_id"),
            vec![],
            instance_from_row,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_sql_keeps_created_at() {
        let sql = upsert_sql("users", USER_COLS, &["id"], &["created_at"]);
        assert!(sql.starts_with("INSERT INTO users (id, username, display_name, email, created_at)"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET username = excluded.username"));
        assert!(!sql.contains("created_at = excluded.created_at"));
        assert_eq!(sql.matches('?').count(), 5);
    }

    #[test]
    fn test_upsert_sql_composite_key() {
        let sql = upsert_sql("project_memory", MEMORY_COLS, &["project_id", "category", "key"], &[]);
        assert!(sql.contains("ON CONFLICT (project_id, category, key)"));
        assert!(!sql.contains("key = excluded.key"));
        assert!(sql.contains("value = excluded.value"));
    }

    #[test]
    fn test_qualified_prefixes_columns() {
        assert_eq!(qualified("b", "id, title"), "b.id, b.title");
    }
}
