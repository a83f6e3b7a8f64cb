//! Per-bead workflow execution engine.
//!
//! An execution walks a workflow graph one edge at a time. Every transition
//! appends a history entry and updates the execution and the bead context in
//! one write batch. Re-entering a node already seen in the history counts as a
//! cycle; three cycles, or exhausting a node's attempts, escalate the
//! execution and file a decision bead for human review.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{Database, WriteOp, with_transaction};
use crate::error::{DatabaseError, WorkflowError};
use crate::events::{Event, EventBus, types};
use crate::model::{Bead, BeadStatus, Priority, ctx};
use crate::workflow::model::{
    EdgeCondition, ExecutionStatus, NodeType, Workflow, WorkflowEdge, WorkflowExecution,
    WorkflowHistoryEntry, WorkflowNode,
};

/// Cycles tolerated before an execution escalates.
pub const MAX_CYCLES: u32 = 3;

/// Actor recorded for engine-initiated transitions.
pub const SYSTEM_ACTOR: &str = "system";

/// Bead type of escalation decisions.
pub const DECISION_BEAD_TYPE: &str = "decision";

/// Resolution that closes the escalated bead instead of restarting it.
pub const RESOLUTION_CLOSE: &str = "close";

const EVENT_SOURCE: &str = "workflow-engine";
const ESCALATION_HISTORY_LIMIT: usize = 5;

/// Result of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// Moved to `node_key`.
    Advanced {
        execution: WorkflowExecution,
        node_key: String,
    },
    /// Stayed on the current node for another attempt.
    Retrying { execution: WorkflowExecution },
    Completed { execution: WorkflowExecution },
    Escalated {
        execution: WorkflowExecution,
        decision_bead_id: Option<String>,
    },
}

impl AdvanceOutcome {
    pub fn execution(&self) -> &WorkflowExecution {
        match self {
            AdvanceOutcome::Advanced { execution, .. }
            | AdvanceOutcome::Retrying { execution }
            | AdvanceOutcome::Completed { execution }
            | AdvanceOutcome::Escalated { execution, .. } => execution,
        }
    }
}

/// Pre-rendered escalation document.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationInfo {
    pub title: String,
    pub description: String,
}

/// Resolve the node an execution moves to on `condition`.
///
/// Among edges leaving `current` with a matching condition the highest
/// priority wins; ties go to the edge inserted first. `Ok(None)` means the
/// workflow is complete: either the chosen edge has no target, or no edge
/// matched a `success` and some edge leaves `current` for completion.
pub fn next_node<'a>(
    workflow: &'a Workflow,
    current: &str,
    condition: EdgeCondition,
) -> Result<Option<&'a WorkflowNode>, WorkflowError> {
    let mut best: Option<&WorkflowEdge> = None;
    for edge in workflow
        .edges
        .iter()
        .filter(|e| e.from_node_key == current && e.condition == condition)
    {
        if best.is_none_or(|b| edge.priority > b.priority) {
            best = Some(edge);
        }
    }

    match best {
        Some(edge) if edge.to_node_key.is_empty() => Ok(None),
        Some(edge) => workflow
            .node(&edge.to_node_key)
            .map(Some)
            .ok_or_else(|| WorkflowError::NodeNotFound {
                workflow_id: workflow.id.clone(),
                node_key: edge.to_node_key.clone(),
            }),
        None if condition == EdgeCondition::Success
            && workflow
                .edges
                .iter()
                .any(|e| e.from_node_key == current && e.to_node_key.is_empty()) =>
        {
            Ok(None)
        }
        None => Err(WorkflowError::NoEdgeFound {
            from: current.to_string(),
            condition: condition.to_string(),
        }),
    }
}

/// Render the escalation document from the last few history entries.
pub fn render_escalation(
    workflow: &Workflow,
    execution: &WorkflowExecution,
    bead: Option<&Bead>,
    history: &[WorkflowHistoryEntry],
    reason: &str,
) -> EscalationInfo {
    let subject = bead.map(|b| b.title.as_str()).unwrap_or(&execution.bead_id);
    let title = format!("Escalation: {}", subject);

    let node = if execution.current_node_key.is_empty() {
        "(start)"
    } else {
        execution.current_node_key.as_str()
    };
    let mut description = format!(
        "Workflow '{}' for bead {} needs a decision.\n\n\
         Reason: {}\n\n\
         Current node: {}\n\
         Cycles: {}\n\
         Attempts at node: {}\n",
        workflow.name, execution.bead_id, reason, node, execution.cycle_count, execution.node_attempt_count,
    );

    let start = history.len().saturating_sub(ESCALATION_HISTORY_LIMIT);
    if !history.is_empty() {
        description.push_str("\nRecent history:\n");
        for entry in &history[start..] {
            let from = if entry.node_key.is_empty() {
                "(start)"
            } else {
                entry.node_key.as_str()
            };
            let agent = if entry.agent_id.is_empty() {
                SYSTEM_ACTOR
            } else {
                entry.agent_id.as_str()
            };
            description.push_str(&format!(
                "- {} {} -> {} by {} (attempt {})\n",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                from,
                entry.condition,
                agent,
                entry.attempt_number
            ));
        }
    }
    EscalationInfo { title, description }
}

/// Everything a transition reads.
struct State {
    execution: WorkflowExecution,
    workflow: Workflow,
    bead: Option<Bead>,
    history: Vec<WorkflowHistoryEntry>,
}

impl State {
    fn current_node(&self) -> Option<&WorkflowNode> {
        self.workflow.node(&self.execution.current_node_key)
    }

    fn ensure_active(&self) -> Result<(), WorkflowError> {
        if self.execution.status.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                id: self.execution.id.clone(),
                status: self.execution.status.to_string(),
            });
        }
        Ok(())
    }

    /// Escalation reason once the current node has used up its attempts.
    fn attempts_exhausted(&self) -> Option<String> {
        let node = self.current_node()?;
        (node.max_attempts > 0 && self.execution.node_attempt_count >= node.max_attempts).then(|| {
            format!(
                "Exceeded max attempts ({}) at node '{}'",
                node.max_attempts, node.node_key
            )
        })
    }

    fn history_entry(
        &self,
        agent_id: &str,
        condition: EdgeCondition,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> WorkflowHistoryEntry {
        WorkflowHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: self.execution.id.clone(),
            node_key: self.execution.current_node_key.clone(),
            agent_id: agent_id.to_string(),
            condition,
            result_data: result,
            attempt_number: self.execution.node_attempt_count,
            created_at: now,
        }
    }
}

/// Drives workflow executions.
pub struct WorkflowEngine {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
}

impl WorkflowEngine {
    pub fn new(db: Arc<dyn Database>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow, WorkflowError> {
        self.db.get_workflow(workflow_id).await.map_err(|e| {
            if e.is_not_found() {
                WorkflowError::WorkflowNotFound(workflow_id.to_string())
            } else {
                e.into()
            }
        })
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, WorkflowError> {
        self.db.get_execution(execution_id).await.map_err(|e| {
            if e.is_not_found() {
                WorkflowError::ExecutionNotFound(execution_id.to_string())
            } else {
                e.into()
            }
        })
    }

    async fn load_bead(&self, bead_id: &str) -> Result<Option<Bead>, DatabaseError> {
        match self.db.get_bead(bead_id).await {
            Ok(bead) => Ok(Some(bead)),
            Err(e) if e.is_not_found() => {
                tracing::warn!(bead_id, "Execution refers to a missing bead");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn load(&self, execution_id: &str) -> Result<State, WorkflowError> {
        let execution = self.get_execution(execution_id).await?;
        let workflow = self.load_workflow(&execution.workflow_id).await?;
        let bead = self.load_bead(&execution.bead_id).await?;
        let history = self.db.list_history(&execution.id).await?;
        Ok(State {
            execution,
            workflow,
            bead,
            history,
        })
    }

    // ==================== Entry ====================

    /// Start a workflow for a bead, or return the bead's existing execution.
    pub async fn start_workflow(
        &self,
        bead_id: &str,
        workflow_id: &str,
        project_id: &str,
    ) -> Result<WorkflowExecution, WorkflowError> {
        if bead_id.is_empty() || workflow_id.is_empty() || project_id.is_empty() {
            return Err(WorkflowError::InvalidArgument(
                "bead_id, workflow_id, and project_id are required".to_string(),
            ));
        }
        if let Some(existing) = self.db.get_execution_by_bead(bead_id).await? {
            return Ok(existing);
        }
        let workflow = self.load_workflow(workflow_id).await?;
        let mut bead = self.db.get_bead(bead_id).await?;

        let now = Utc::now();
        let execution = WorkflowExecution {
            id: format!("wfx-{}", uuid::Uuid::new_v4()),
            workflow_id: workflow.id.clone(),
            bead_id: bead_id.to_string(),
            project_id: project_id.to_string(),
            current_node_key: String::new(),
            status: ExecutionStatus::Active,
            cycle_count: 0,
            node_attempt_count: 0,
            started_at: now,
            completed_at: None,
            escalated_at: None,
            last_node_at: now,
        };
        bead.set_ctx(ctx::WORKFLOW_ID, workflow.id.clone());
        bead.set_ctx(ctx::WORKFLOW_EXEC_ID, execution.id.clone());
        bead.set_ctx(ctx::WORKFLOW_NODE, "");
        bead.set_ctx(ctx::WORKFLOW_STATUS, ExecutionStatus::Active.as_str());
        bead.updated_at = now;

        let committed = with_transaction(self.db.as_ref(), |batch| {
            batch.upsert_execution(&execution).upsert_bead(&bead);
            Ok::<_, DatabaseError>(())
        })
        .await;
        match committed {
            Ok(()) => {}
            Err(DatabaseError::Duplicate { .. }) => {
                // Lost a race with another starter; theirs is the execution.
                if let Some(existing) = self.db.get_execution_by_bead(bead_id).await? {
                    return Ok(existing);
                }
                return Err(WorkflowError::InvalidArgument(format!(
                    "could not start workflow for bead {}",
                    bead_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(bead_id, workflow_id, execution_id = %execution.id, "Workflow started");
        self.publish(
            Event::new(types::WORKFLOW_STARTED, EVENT_SOURCE)
                .with_project(project_id)
                .with_data(serde_json::json!({
                    "execution_id": execution.id,
                    "workflow_id": workflow.id,
                    "bead_id": bead_id,
                })),
        );
        Ok(execution)
    }

    /// The node an execution is currently at, if it has left the start.
    pub async fn current_node(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<Option<WorkflowNode>, WorkflowError> {
        let workflow = self.load_workflow(&execution.workflow_id).await?;
        Ok(workflow.node(&execution.current_node_key).cloned())
    }

    /// Where `condition` would take the execution; `None` means completion.
    pub async fn get_next_node(
        &self,
        execution: &WorkflowExecution,
        condition: EdgeCondition,
    ) -> Result<Option<WorkflowNode>, WorkflowError> {
        let workflow = self.load_workflow(&execution.workflow_id).await?;
        Ok(next_node(&workflow, &execution.current_node_key, condition)?.cloned())
    }

    // ==================== Transitions ====================

    /// Leave the current node on `condition`.
    pub async fn advance_workflow(
        &self,
        execution_id: &str,
        condition: EdgeCondition,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let state = self.load(execution_id).await?;
        state.ensure_active()?;
        self.advance_state(state, condition, agent_id, result).await
    }

    /// Record a successful attempt at the current node and move on.
    /// Exhausting `max_attempts` escalates instead.
    pub async fn complete_node(
        &self,
        execution_id: &str,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let mut state = self.load(execution_id).await?;
        state.ensure_active()?;
        state.execution.node_attempt_count += 1;

        if let Some(reason) = state.attempts_exhausted() {
            let entry = state.history_entry(agent_id, EdgeCondition::Success, result, Utc::now());
            return self.escalate_state(state, reason, Some(entry)).await;
        }
        self.advance_state(state, EdgeCondition::Success, agent_id, result)
            .await
    }

    /// Record a failed attempt at the current node.
    ///
    /// Exhausting `max_attempts` escalates. Otherwise the failure edge is
    /// followed, or the node is retried when it has none.
    pub async fn fail_node(
        &self,
        execution_id: &str,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let mut state = self.load(execution_id).await?;
        state.ensure_active()?;
        state.execution.node_attempt_count += 1;

        if let Some(reason) = state.attempts_exhausted() {
            let entry = state.history_entry(agent_id, EdgeCondition::Failure, result, Utc::now());
            return self.escalate_state(state, reason, Some(entry)).await;
        }

        match next_node(
            &state.workflow,
            &state.execution.current_node_key,
            EdgeCondition::Failure,
        ) {
            Err(WorkflowError::NoEdgeFound { .. }) if !state.execution.current_node_key.is_empty() => {
                self.retry_state(state, agent_id, result).await
            }
            _ => {
                self.advance_state(state, EdgeCondition::Failure, agent_id, result)
                    .await
            }
        }
    }

    /// Advance on `timeout` when the current node has overrun its limit.
    /// A node without a timeout edge escalates instead.
    pub async fn check_node_timeout(
        &self,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AdvanceOutcome>, WorkflowError> {
        let state = self.load(execution_id).await?;
        if state.execution.status.is_terminal() {
            return Ok(None);
        }
        let Some(node) = state.current_node() else {
            return Ok(None);
        };
        if node.timeout_minutes == 0 {
            return Ok(None);
        }
        let limit = chrono::Duration::minutes(i64::from(node.timeout_minutes));
        if now - state.execution.last_node_at <= limit {
            return Ok(None);
        }

        let minutes = node.timeout_minutes;
        let node_key = node.node_key.clone();
        tracing::info!(execution_id, node = %node_key, minutes, "Workflow node timed out");
        let result = serde_json::json!({ "timed_out_after_minutes": minutes });
        let outcome = match next_node(&state.workflow, &node_key, EdgeCondition::Timeout) {
            Ok(_) => {
                self.advance_state(state, EdgeCondition::Timeout, SYSTEM_ACTOR, result)
                    .await?
            }
            Err(WorkflowError::NoEdgeFound { .. }) => {
                let reason = format!("Node '{}' timed out after {} minutes", node_key, minutes);
                let entry = state.history_entry(SYSTEM_ACTOR, EdgeCondition::Timeout, result, Utc::now());
                self.escalate_state(state, reason, Some(entry)).await?
            }
            Err(e) => return Err(e),
        };
        Ok(Some(outcome))
    }

    async fn advance_state(
        &self,
        mut state: State,
        condition: EdgeCondition,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let now = Utc::now();
        let entry = state.history_entry(agent_id, condition, result, now);
        let next = next_node(&state.workflow, &state.execution.current_node_key, condition)?.cloned();

        let Some(node) = next else {
            return self.complete_state(state, entry, now).await;
        };

        let revisit = state
            .history
            .iter()
            .chain(std::iter::once(&entry))
            .any(|h| h.node_key == node.node_key);
        if revisit {
            state.execution.cycle_count += 1;
        }
        if state.execution.cycle_count >= MAX_CYCLES {
            let reason = format!(
                "Exceeded max cycles ({}): workflow has cycled {} times",
                MAX_CYCLES, state.execution.cycle_count
            );
            return self.escalate_state(state, reason, Some(entry)).await;
        }

        state.execution.current_node_key = node.node_key.clone();
        state.execution.node_attempt_count = 0;
        state.execution.last_node_at = now;

        if node.node_type == NodeType::Terminal {
            return self.complete_state(state, entry, now).await;
        }

        let redispatch = node.node_type != NodeType::Approval;

        if let Some(bead) = state.bead.as_mut() {
            bead.set_ctx(ctx::WORKFLOW_NODE, node.node_key.clone());
            bead.set_ctx(ctx::WORKFLOW_STATUS, state.execution.status.as_str());
            bead.set_ctx(ctx::CYCLE_COUNT, state.execution.cycle_count.to_string());
            bead.set_ctx(ctx::REDISPATCH_REQUESTED, redispatch.to_string());
            bead.set_ctx(ctx::REQUIRED_ROLE, node.role_required.clone());
            bead.updated_at = now;
        }

        with_transaction(self.db.as_ref(), |batch| {
            batch.append_history(entry).upsert_execution(&state.execution);
            if let Some(bead) = &state.bead {
                batch.upsert_bead(bead);
            }
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::debug!(
            execution_id = %state.execution.id,
            condition = %condition,
            node = %node.node_key,
            cycles = state.execution.cycle_count,
            "Workflow advanced"
        );
        Ok(AdvanceOutcome::Advanced {
            execution: state.execution,
            node_key: node.node_key,
        })
    }

    async fn retry_state(
        &self,
        mut state: State,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let now = Utc::now();
        let entry = state.history_entry(agent_id, EdgeCondition::Failure, result, now);
        state.execution.last_node_at = now;
        let approval = state
            .current_node()
            .is_some_and(|n| n.node_type == NodeType::Approval);
        if let Some(bead) = state.bead.as_mut() {
            bead.set_ctx(ctx::REDISPATCH_REQUESTED, (!approval).to_string());
            bead.updated_at = now;
        }

        with_transaction(self.db.as_ref(), |batch| {
            batch.append_history(entry).upsert_execution(&state.execution);
            if let Some(bead) = &state.bead {
                batch.upsert_bead(bead);
            }
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::debug!(
            execution_id = %state.execution.id,
            node = %state.execution.current_node_key,
            attempt = state.execution.node_attempt_count,
            "Workflow node will be retried"
        );
        Ok(AdvanceOutcome::Retrying {
            execution: state.execution,
        })
    }

    async fn complete_state(
        &self,
        mut state: State,
        entry: WorkflowHistoryEntry,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        state.execution.status = ExecutionStatus::Completed;
        state.execution.completed_at = Some(now);
        state.execution.last_node_at = now;
        if let Some(bead) = state.bead.as_mut() {
            bead.set_ctx(ctx::WORKFLOW_STATUS, ExecutionStatus::Completed.as_str());
            bead.set_ctx(ctx::REDISPATCH_REQUESTED, "false");
            bead.status = BeadStatus::Closed;
            bead.updated_at = now;
        }

        with_transaction(self.db.as_ref(), |batch| {
            batch.append_history(entry).upsert_execution(&state.execution);
            if let Some(bead) = &state.bead {
                batch.upsert_bead(bead);
            }
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::info!(
            execution_id = %state.execution.id,
            bead_id = %state.execution.bead_id,
            "Workflow completed"
        );
        let data = serde_json::json!({
            "execution_id": state.execution.id,
            "workflow_id": state.execution.workflow_id,
            "bead_id": state.execution.bead_id,
        });
        self.publish(
            Event::new(types::WORKFLOW_COMPLETED, EVENT_SOURCE)
                .with_project(state.execution.project_id.clone())
                .with_data(data.clone()),
        );
        self.publish(
            Event::new(types::BEAD_COMPLETED, EVENT_SOURCE)
                .with_project(state.execution.project_id.clone())
                .with_data(data),
        );
        Ok(AdvanceOutcome::Completed {
            execution: state.execution,
        })
    }

    // ==================== Escalation ====================

    /// Escalate an active execution for human review.
    pub async fn escalate(
        &self,
        execution_id: &str,
        reason: &str,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let state = self.load(execution_id).await?;
        state.ensure_active()?;
        self.escalate_state(state, reason.to_string(), None).await
    }

    async fn escalate_state(
        &self,
        mut state: State,
        reason: String,
        pending: Option<WorkflowHistoryEntry>,
    ) -> Result<AdvanceOutcome, WorkflowError> {
        let now = Utc::now();
        state.execution.status = ExecutionStatus::Escalated;
        state.execution.escalated_at = Some(now);
        if let Some(entry) = &pending {
            state.history.push(entry.clone());
        }
        let info = render_escalation(
            &state.workflow,
            &state.execution,
            state.bead.as_ref(),
            &state.history,
            &reason,
        );

        let decision = state.bead.as_mut().map(|bead| {
            let mut decision = Bead::new(bead.project_id.clone(), info.title.clone(), Priority::P0)
                .with_type(DECISION_BEAD_TYPE)
                .with_description(info.description.clone());
            decision.set_ctx(ctx::DECISION_FOR_BEAD, bead.id.clone());

            bead.set_ctx(ctx::WORKFLOW_STATUS, ExecutionStatus::Escalated.as_str());
            bead.set_ctx(ctx::ESCALATION_REASON, reason.clone());
            bead.set_ctx(ctx::ESCALATED_AT, now.to_rfc3339());
            bead.set_ctx(ctx::NEEDS_CEO_REVIEW, "true");
            bead.set_ctx(ctx::REDISPATCH_REQUESTED, "false");
            bead.set_ctx(ctx::CYCLE_COUNT, state.execution.cycle_count.to_string());
            bead.set_ctx(ctx::ESCALATED_TO_CEO_DECISION_ID, decision.id.clone());
            bead.status = BeadStatus::Blocked;
            bead.updated_at = now;
            decision
        });

        with_transaction(self.db.as_ref(), |batch| {
            if let Some(entry) = pending {
                batch.append_history(entry);
            }
            batch.upsert_execution(&state.execution);
            if let Some(bead) = &state.bead {
                batch.upsert_bead(bead);
            }
            if let Some(decision) = &decision {
                batch.upsert_bead(decision);
            }
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::warn!(
            execution_id = %state.execution.id,
            bead_id = %state.execution.bead_id,
            reason = %reason,
            "Workflow escalated"
        );
        let project_id = state.execution.project_id.clone();
        self.publish(
            Event::new(types::WORKFLOW_ESCALATED, EVENT_SOURCE)
                .with_project(project_id.clone())
                .with_data(serde_json::json!({
                    "execution_id": state.execution.id,
                    "bead_id": state.execution.bead_id,
                    "reason": reason,
                })),
        );
        if let Some(decision) = &decision {
            self.publish(
                Event::new(types::DECISION_CREATED, EVENT_SOURCE)
                    .with_project(project_id)
                    .with_data(serde_json::json!({
                        "decision_id": decision.id,
                        "bead_id": state.execution.bead_id,
                        "title": decision.title,
                    })),
            );
        }
        Ok(AdvanceOutcome::Escalated {
            execution: state.execution,
            decision_bead_id: decision.map(|d| d.id),
        })
    }

    /// Escalation document for an execution, using the recorded reason.
    pub async fn get_escalation_info(&self, execution_id: &str) -> Result<EscalationInfo, WorkflowError> {
        let state = self.load(execution_id).await?;
        let reason = state
            .bead
            .as_ref()
            .map(|b| b.ctx(ctx::ESCALATION_REASON).to_string())
            .unwrap_or_default();
        Ok(render_escalation(
            &state.workflow,
            &state.execution,
            state.bead.as_ref(),
            &state.history,
            &reason,
        ))
    }

    /// Close a decision bead and act on the escalated bead.
    ///
    /// [`RESOLUTION_CLOSE`] closes the escalated bead; any other resolution
    /// reopens it with a fresh workflow.
    pub async fn resolve_decision(
        &self,
        decision_id: &str,
        resolution: &str,
        resolver_id: &str,
    ) -> Result<Bead, WorkflowError> {
        let mut decision = self.db.get_bead(decision_id).await?;
        if decision.bead_type != DECISION_BEAD_TYPE {
            return Err(WorkflowError::InvalidArgument(format!(
                "bead {} is not a decision",
                decision_id
            )));
        }
        if decision.status == BeadStatus::Closed {
            return Err(WorkflowError::AlreadyTerminal {
                id: decision_id.to_string(),
                status: BeadStatus::Closed.to_string(),
            });
        }

        let now = Utc::now();
        decision.status = BeadStatus::Closed;
        decision.set_ctx(ctx::DECISION_RESOLUTION, resolution);
        decision.updated_at = now;

        let target_id = decision.ctx(ctx::DECISION_FOR_BEAD).to_string();
        let mut target = if target_id.is_empty() {
            None
        } else {
            self.load_bead(&target_id).await?
        };
        let stale_execution = match &target {
            Some(bead) => self.db.get_execution_by_bead(&bead.id).await?,
            None => None,
        };
        let close_target = resolution.eq_ignore_ascii_case(RESOLUTION_CLOSE);

        if let Some(bead) = target.as_mut() {
            bead.set_ctx(ctx::DECISION_RESOLUTION, resolution);
            bead.set_ctx(ctx::NEEDS_CEO_REVIEW, "false");
            bead.updated_at = now;
            if close_target {
                bead.status = BeadStatus::Closed;
            } else {
                bead.status = BeadStatus::Open;
                bead.assigned_to.clear();
                bead.set_ctx(ctx::REDISPATCH_REQUESTED, "true");
                for key in [
                    ctx::WORKFLOW_EXEC_ID,
                    ctx::WORKFLOW_NODE,
                    ctx::WORKFLOW_STATUS,
                    ctx::CYCLE_COUNT,
                    ctx::ESCALATION_REASON,
                    ctx::ESCALATED_AT,
                    ctx::ESCALATED_TO_CEO_DECISION_ID,
                ] {
                    bead.context.remove(key);
                }
            }
        }

        with_transaction(self.db.as_ref(), |batch| {
            batch.upsert_bead(&decision);
            if let Some(bead) = &target {
                batch.upsert_bead(bead);
                if !close_target && let Some(execution) = &stale_execution {
                    batch.push(WriteOp::DeleteHistory {
                        execution_id: execution.id.clone(),
                    });
                    batch.push(WriteOp::DeleteExecution {
                        execution_id: execution.id.clone(),
                    });
                }
            }
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::info!(decision_id, resolution, resolver = resolver_id, "Decision resolved");
        self.publish(
            Event::new(types::DECISION_RESOLVED, EVENT_SOURCE)
                .with_project(decision.project_id.clone())
                .with_data(serde_json::json!({
                    "decision_id": decision.id,
                    "bead_id": target_id,
                    "resolution": resolution,
                    "resolver_id": resolver_id,
                })),
        );
        Ok(decision)
    }

    // ==================== Reset ====================

    /// Remove a bead's execution and its history so the workflow can start
    /// over. Both deletes commit together. Returns whether one existed.
    pub async fn delete_execution_by_bead(&self, bead_id: &str) -> Result<bool, WorkflowError> {
        let Some(execution) = self.db.get_execution_by_bead(bead_id).await? else {
            return Ok(false);
        };
        with_transaction(self.db.as_ref(), |batch| {
            batch
                .push(WriteOp::DeleteHistory {
                    execution_id: execution.id.clone(),
                })
                .push(WriteOp::DeleteExecution {
                    execution_id: execution.id.clone(),
                });
            Ok::<_, DatabaseError>(())
        })
        .await?;
        tracing::info!(bead_id, execution_id = %execution.id, "Workflow execution reset");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::events::of_types;

    fn linear() -> Workflow {
        let mut wf = Workflow::new("w", "Linear", "feature");
        wf.add_node("a", NodeType::Task, "developer");
        wf.add_node("b", NodeType::Task, "qa");
        wf.add_edge("", "a", EdgeCondition::Success);
        wf.add_edge("a", "b", EdgeCondition::Success);
        wf.add_edge("b", "", EdgeCondition::Success);
        wf
    }

    async fn setup(workflow: Workflow) -> (WorkflowEngine, Arc<dyn Database>, Arc<EventBus>, Bead) {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(64));
        db.upsert_workflow(&workflow).await.unwrap();
        let bead = Bead::new("p1", "Do the thing", Priority::P1);
        db.upsert_bead(&bead).await.unwrap();
        (WorkflowEngine::new(db.clone(), events.clone()), db, events, bead)
    }

    #[test]
    fn test_next_node_prefers_priority_then_insertion() {
        let mut wf = linear();
        wf.add_node("c", NodeType::Task, "developer");
        wf.add_edge("a", "c", EdgeCondition::Failure);
        wf.add_edge("a", "b", EdgeCondition::Failure);
        assert_eq!(next_node(&wf, "a", EdgeCondition::Failure).unwrap().unwrap().node_key, "c");

        wf.add_edge("a", "b", EdgeCondition::Failure).priority = 5;
        assert_eq!(next_node(&wf, "a", EdgeCondition::Failure).unwrap().unwrap().node_key, "b");
    }

    #[test]
    fn test_next_node_completion_and_missing_edge() {
        let wf = linear();
        assert!(next_node(&wf, "b", EdgeCondition::Success).unwrap().is_none());
        let err = next_node(&wf, "a", EdgeCondition::Rejected).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no edge found from node 'a' with condition 'rejected'"
        );

        let mut wf = linear();
        wf.edges.retain(|e| !(e.from_node_key == "b" && e.to_node_key.is_empty()));
        wf.add_edge("b", "", EdgeCondition::Approved);
        assert!(next_node(&wf, "b", EdgeCondition::Success).unwrap().is_none());
        assert!(next_node(&wf, "a", EdgeCondition::Timeout).is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_writes_context() {
        let (engine, db, _events, bead) = setup(linear()).await;
        let first = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        let second = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, ExecutionStatus::Active);
        assert_eq!(first.current_node_key, "");

        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::WORKFLOW_ID), "w");
        assert_eq!(stored.ctx(ctx::WORKFLOW_EXEC_ID), first.id);
        assert_eq!(stored.ctx(ctx::WORKFLOW_STATUS), "active");

        assert!(matches!(
            engine.start_workflow("", "w", "p1").await.unwrap_err(),
            WorkflowError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_advance_to_completion_follows_chain() {
        let (engine, db, events, bead) = setup(linear()).await;
        let mut sub = events.subscribe(of_types(&[types::WORKFLOW_COMPLETED]));
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();

        let mut visited = Vec::new();
        loop {
            match engine.complete_node(&exec.id, "agent-1", serde_json::json!({})).await.unwrap() {
                AdvanceOutcome::Advanced { node_key, .. } => visited.push(node_key),
                AdvanceOutcome::Completed { execution } => {
                    assert_eq!(execution.status, ExecutionStatus::Completed);
                    assert!(execution.completed_at.is_some());
                    break;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(visited, vec!["a", "b"]);

        let history = db.list_history(&exec.id).await.unwrap();
        let keys: Vec<&str> = history.iter().map(|h| h.node_key.as_str()).collect();
        assert_eq!(keys, vec!["", "a", "b"]);
        assert!(history.iter().all(|h| h.attempt_number == 1));

        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::WORKFLOW_STATUS), "completed");
        assert_eq!(stored.ctx(ctx::REDISPATCH_REQUESTED), "false");
        assert!(sub.try_recv().is_some());

        let err = engine
            .advance_workflow(&exec.id, EdgeCondition::Success, "agent-1", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_advance_sets_role_and_redispatch() {
        let mut wf = linear();
        wf.add_node("gate", NodeType::Approval, "cto");
        wf.edges.retain(|e| e.from_node_key != "a");
        wf.add_edge("a", "gate", EdgeCondition::Success);
        let (engine, db, _events, bead) = setup(wf).await;
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();

        engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::WORKFLOW_NODE), "a");
        assert_eq!(stored.ctx(ctx::REQUIRED_ROLE), "developer");
        assert_eq!(stored.ctx(ctx::REDISPATCH_REQUESTED), "true");

        engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::WORKFLOW_NODE), "gate");
        assert_eq!(stored.ctx(ctx::REDISPATCH_REQUESTED), "false");
    }

    #[tokio::test]
    async fn test_fail_node_exhausts_attempts() {
        let mut wf = linear();
        wf.nodes[0].max_attempts = 2;
        let (engine, db, events, bead) = setup(wf).await;
        let mut sub = events.subscribe(of_types(&[types::DECISION_CREATED]));
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();

        let first = engine.fail_node(&exec.id, "x", serde_json::json!({"error": "boom"})).await.unwrap();
        assert!(matches!(first, AdvanceOutcome::Retrying { .. }));
        assert_eq!(first.execution().node_attempt_count, 1);

        let second = engine.fail_node(&exec.id, "x", serde_json::json!({"error": "boom"})).await.unwrap();
        let AdvanceOutcome::Escalated { decision_bead_id, .. } = second else {
            panic!("expected escalation");
        };
        let decision = db.get_bead(&decision_bead_id.unwrap()).await.unwrap();
        assert_eq!(decision.bead_type, DECISION_BEAD_TYPE);
        assert_eq!(decision.priority, Priority::P0);
        assert_eq!(decision.ctx(ctx::DECISION_FOR_BEAD), bead.id);

        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::ESCALATION_REASON), "Exceeded max attempts (2) at node 'a'");
        assert_eq!(stored.ctx(ctx::ESCALATED_TO_CEO_DECISION_ID), decision.id);
        assert_eq!(stored.status, BeadStatus::Blocked);
        assert_eq!(sub.try_recv().unwrap().data_str("decision_id"), decision.id);

        let info = engine.get_escalation_info(&exec.id).await.unwrap();
        assert!(info.description.contains("Exceeded max attempts"));
        assert!(info.description.contains("Recent history:"));
    }

    #[tokio::test]
    async fn test_complete_node_respects_max_attempts() {
        let mut wf = linear();
        wf.nodes[0].max_attempts = 1;
        let (engine, db, _events, bead) = setup(wf).await;
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();

        let entered = engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();
        assert!(matches!(entered, AdvanceOutcome::Advanced { ref node_key, .. } if node_key == "a"));

        let outcome = engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();
        let AdvanceOutcome::Escalated { execution, decision_bead_id } = outcome else {
            panic!("expected escalation");
        };
        assert_eq!(execution.status, ExecutionStatus::Escalated);
        assert!(decision_bead_id.is_some());
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.ctx(ctx::ESCALATION_REASON), "Exceeded max attempts (1) at node 'a'");

        let history = db.list_history(&exec.id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.node_key, "a");
        assert_eq!(last.condition, EdgeCondition::Success);
    }

    #[tokio::test]
    async fn test_timeout_advances_or_escalates() {
        let mut wf = linear();
        wf.nodes[0].timeout_minutes = 10;
        wf.add_edge("a", "b", EdgeCondition::Timeout);
        let (engine, _db, _events, bead) = setup(wf).await;
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();

        let soon = Utc::now() + chrono::Duration::minutes(5);
        assert!(engine.check_node_timeout(&exec.id, soon).await.unwrap().is_none());

        let later = Utc::now() + chrono::Duration::minutes(11);
        let outcome = engine.check_node_timeout(&exec.id, later).await.unwrap().unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Advanced { ref node_key, .. } if node_key == "b"));
    }

    #[tokio::test]
    async fn test_reset_and_resolve_decision() {
        let (engine, db, _events, bead) = setup(linear()).await;
        let exec = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        engine.complete_node(&exec.id, "x", serde_json::json!({})).await.unwrap();

        let outcome = engine.escalate(&exec.id, "needs a human").await.unwrap();
        let AdvanceOutcome::Escalated { decision_bead_id: Some(decision_id), .. } = outcome else {
            panic!("expected decision");
        };

        engine.resolve_decision(&decision_id, "retry", "ceo").await.unwrap();
        let reopened = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(reopened.status, BeadStatus::Open);
        assert_eq!(reopened.ctx(ctx::NEEDS_CEO_REVIEW), "false");
        assert!(db.get_execution_by_bead(&bead.id).await.unwrap().is_none());
        assert!(db.list_history(&exec.id).await.unwrap().is_empty());
        assert!(engine.resolve_decision(&decision_id, "retry", "ceo").await.is_err());

        let fresh = engine.start_workflow(&bead.id, "w", "p1").await.unwrap();
        assert_ne!(fresh.id, exec.id);
        assert!(engine.delete_execution_by_bead(&bead.id).await.unwrap());
        assert!(!engine.delete_execution_by_bead(&bead.id).await.unwrap());
    }
}
