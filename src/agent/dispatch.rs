//! Bead dispatch: pick the next eligible bead and hand it to an idle agent.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::agent::executor::BeadExecutor;
use crate::db::{AgentFilter, Database, with_transaction};
use crate::error::{DatabaseError, DispatchError};
use crate::events::{Event, EventBus, types};
use crate::model::{Agent, AgentStatus, Bead, BeadStatus, ctx};
use crate::workflow::{AdvanceOutcome, EdgeCondition, WorkflowEngine, engine::SYSTEM_ACTOR, workflow_for_bead};

/// Dispatches a bead may receive before it is blocked.
pub const DEFAULT_DISPATCH_BUDGET: u32 = 30;

/// Eligible beads considered per dispatch attempt.
pub const CANDIDATE_WINDOW: usize = 32;

const EVENT_SOURCE: &str = "dispatcher";

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub dispatched: bool,
    pub bead_id: String,
    pub agent_id: String,
}

/// Pick an idle agent for a bead.
///
/// With a `role`, only agents holding that role qualify; an idle agent
/// already assigned to the bead is kept when it does. Without one, any idle
/// agent does. Project agents are preferred over global ones throughout.
pub fn pick_agent<'a>(idle: &'a [Agent], bead: &Bead, role: &str) -> Option<&'a Agent> {
    let mut in_scope: Vec<&Agent> = idle
        .iter()
        .filter(|a| a.is_idle() && (a.project_id == bead.project_id || a.project_id.is_empty()))
        .filter(|a| role.is_empty() || a.has_role(role))
        .collect();
    in_scope.sort_by_key(|a| a.project_id.is_empty());

    if bead.is_assigned()
        && let Some(current) = in_scope.iter().find(|a| a.id == bead.assigned_to)
    {
        return Some(*current);
    }
    in_scope.first().copied()
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    engine: Arc<WorkflowEngine>,
    executor: Option<Arc<dyn BeadExecutor>>,
    budget: u32,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, events: Arc<EventBus>, engine: Arc<WorkflowEngine>) -> Self {
        Self {
            db,
            events,
            engine,
            executor: None,
            budget: DEFAULT_DISPATCH_BUDGET,
        }
    }

    /// Run each dispatched bead on `executor` in its own task.
    pub fn with_executor(mut self, executor: Arc<dyn BeadExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    /// Candidate beads, those of `project_hint` first.
    async fn candidates(&self, project_hint: Option<&str>) -> Result<Vec<Bead>, DatabaseError> {
        let mut beads = Vec::new();
        if let Some(project) = project_hint.filter(|p| !p.is_empty()) {
            beads = self.db.eligible_beads_for_dispatch(Some(project), CANDIDATE_WINDOW).await?;
        }
        for bead in self.db.eligible_beads_for_dispatch(None, CANDIDATE_WINDOW).await? {
            if !beads.iter().any(|b| b.id == bead.id) {
                beads.push(bead);
            }
        }
        Ok(beads)
    }

    /// Make sure the bead has a live execution positioned on a node.
    ///
    /// Returns the role that node requires, or `None` when the bead should
    /// not be dispatched (its workflow just completed or escalated).
    async fn prepare_workflow(&self, bead: &Bead) -> Result<Option<String>, DispatchError> {
        let workflow = workflow_for_bead(self.db.as_ref(), bead).await?;
        let mut execution = self
            .engine
            .start_workflow(&bead.id, &workflow.id, &bead.project_id)
            .await?;
        if execution.status.is_terminal() {
            return Ok(None);
        }

        if execution.current_node_key.is_empty() {
            match self
                .engine
                .advance_workflow(&execution.id, EdgeCondition::Success, SYSTEM_ACTOR, serde_json::json!({}))
                .await?
            {
                AdvanceOutcome::Advanced { execution: next, .. } => execution = next,
                _ => return Ok(None),
            }
        } else if let Some(outcome) = self.engine.check_node_timeout(&execution.id, Utc::now()).await? {
            match outcome {
                AdvanceOutcome::Advanced { execution: next, .. } => execution = next,
                _ => return Ok(None),
            }
        }

        let node = self.engine.current_node(&execution).await?;
        Ok(Some(node.map(|n| n.role_required).unwrap_or_default()))
    }

    /// Block a bead that has used up its dispatch budget.
    async fn block_for_budget(&self, mut bead: Bead) -> Result<(), DatabaseError> {
        let count = bead.dispatch_count();
        let now = Utc::now();
        bead.status = BeadStatus::Blocked;
        bead.set_ctx(ctx::RALPH_BLOCKED_AT, now.to_rfc3339());
        bead.set_ctx(
            ctx::RALPH_BLOCKED_REASON,
            format!("dispatch budget exhausted after {} dispatches", count),
        );
        bead.set_ctx(ctx::REDISPATCH_REQUESTED, "false");
        bead.updated_at = now;
        self.db.upsert_bead(&bead).await?;
        let err = DispatchError::BudgetExhausted {
            bead_id: bead.id.clone(),
            dispatch_count: count,
        };
        tracing::warn!(bead_id = %bead.id, error = %err, "Bead blocked");
        self.events.publish(
            Event::new(types::BEAD_STATUS_CHANGE, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "bead_id": bead.id,
                    "status": BeadStatus::Blocked.as_str(),
                })),
        );
        Ok(())
    }

    /// Dispatch at most one bead.
    pub async fn dispatch_once(&self, project_hint: Option<&str>) -> Result<DispatchResult, DispatchError> {
        let idle = self
            .db
            .list_agents(&AgentFilter {
                status: Some(AgentStatus::Idle),
                ..Default::default()
            })
            .await?;
        if idle.is_empty() {
            tracing::debug!("No idle agents");
            return Ok(DispatchResult::default());
        }

        for candidate in self.candidates(project_hint).await? {
            if candidate.status == BeadStatus::InProgress && candidate.ctx(ctx::REDISPATCH_REQUESTED) == "false" {
                continue;
            }
            if candidate.dispatch_count() >= self.budget {
                self.block_for_budget(candidate).await?;
                continue;
            }
            // Cheap check before touching the workflow.
            if pick_agent(&idle, &candidate, "").is_none() {
                continue;
            }

            let Some(role) = self.prepare_workflow(&candidate).await? else {
                continue;
            };
            // The engine rewrote the bead's context.
            let bead = self.db.get_bead(&candidate.id).await?;
            let Some(agent) = pick_agent(&idle, &bead, &role).cloned() else {
                tracing::debug!(bead_id = %bead.id, role = %role, "No idle agent with the required role");
                continue;
            };
            return self.assign(bead, agent).await;
        }
        Ok(DispatchResult::default())
    }

    async fn assign(&self, mut bead: Bead, mut agent: Agent) -> Result<DispatchResult, DispatchError> {
        let now = Utc::now();
        let count = bead.dispatch_count() + 1;
        bead.status = BeadStatus::InProgress;
        bead.assigned_to = agent.id.clone();
        bead.set_ctx(ctx::DISPATCH_COUNT, count.to_string());
        bead.set_ctx(ctx::REDISPATCH_REQUESTED, "false");
        bead.updated_at = now;
        agent.assign(&bead.id, now);

        with_transaction(self.db.as_ref(), |batch| {
            batch.upsert_bead(&bead).upsert_agent(&agent);
            Ok::<_, DatabaseError>(())
        })
        .await?;

        tracing::info!(
            bead_id = %bead.id,
            agent_id = %agent.id,
            role = %agent.role,
            dispatch_count = count,
            "Bead dispatched"
        );
        self.events.publish(
            Event::new(types::BEAD_ASSIGNED, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "bead_id": bead.id,
                    "agent_id": agent.id,
                    "title": bead.title,
                })),
        );
        self.events.publish(
            Event::new(types::AGENT_STATUS_CHANGE, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "agent_id": agent.id,
                    "status": agent.status.as_str(),
                    "bead_id": bead.id,
                })),
        );

        let result = DispatchResult {
            dispatched: true,
            bead_id: bead.id.clone(),
            agent_id: agent.id.clone(),
        };
        if let Some(executor) = &self.executor {
            let executor = Arc::clone(executor);
            tokio::spawn(async move {
                let bead_id = bead.id.clone();
                if let Err(e) = executor.execute(bead, agent).await {
                    tracing::error!(bead_id = %bead_id, error = %e, "Bead execution failed");
                }
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::events::of_types;
    use crate::model::Priority;

    fn dispatcher(db: Arc<dyn Database>, events: Arc<EventBus>) -> Dispatcher {
        let engine = Arc::new(WorkflowEngine::new(db.clone(), events.clone()));
        Dispatcher::new(db, events, engine)
    }

    #[test]
    fn test_pick_agent_prefers_role_then_project() {
        let bead = Bead::new("p1", "Fix crash", Priority::P1);
        let global_dev = Agent::new("g", "developer");
        let pm = Agent::new("pm", "Engineering Manager").with_project("p1");
        let qa = Agent::new("qa", "qa_engineer").with_project("p1");
        let other = Agent::new("o", "qa-engineer").with_project("p2");
        let idle = vec![global_dev.clone(), pm.clone(), qa.clone(), other];

        assert_eq!(pick_agent(&idle, &bead, "qa-engineer").unwrap().id, qa.id);
        assert_eq!(pick_agent(&idle, &bead, "engineering-manager").unwrap().id, pm.id);
        assert_eq!(pick_agent(&idle, &bead, "developer").unwrap().id, global_dev.id);
        assert!(pick_agent(&idle, &bead, "designer").is_none());
        assert_eq!(pick_agent(&idle, &bead, "").unwrap().id, pm.id);
        assert!(pick_agent(&[], &bead, "").is_none());
    }

    #[tokio::test]
    async fn test_no_idle_agents_dispatches_nothing() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        db.upsert_bead(&Bead::new("p1", "Add search", Priority::P1)).await.unwrap();

        let result = dispatcher(db, events).dispatch_once(None).await.unwrap();
        assert_eq!(result, DispatchResult::default());
    }

    #[tokio::test]
    async fn test_dispatch_assigns_atomically_and_emits() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let mut sub = events.subscribe(of_types(&[types::BEAD_ASSIGNED, types::AGENT_STATUS_CHANGE]));
        let bead = Bead::new("p1", "Fix login error", Priority::P0);
        let dev = Agent::new("dev", "developer").with_project("p1");
        db.upsert_bead(&bead).await.unwrap();
        db.upsert_agent(&dev).await.unwrap();

        let result = dispatcher(db.clone(), events).dispatch_once(Some("p1")).await.unwrap();
        assert!(result.dispatched);
        assert_eq!(result.bead_id, bead.id);
        assert_eq!(result.agent_id, dev.id);

        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.status, BeadStatus::InProgress);
        assert_eq!(stored.assigned_to, dev.id);
        assert_eq!(stored.dispatch_count(), 1);
        assert_eq!(stored.ctx(ctx::WORKFLOW_ID), "wf-bug");
        assert_eq!(stored.ctx(ctx::WORKFLOW_NODE), "investigate");

        let agent = db.get_agent(&dev.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.current_bead, bead.id);

        assert_eq!(sub.try_recv().unwrap().event_type, types::BEAD_ASSIGNED);
        assert_eq!(sub.try_recv().unwrap().event_type, types::AGENT_STATUS_CHANGE);
    }

    #[tokio::test]
    async fn test_required_role_waits_for_matching_agent() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        // Feature beads start at a design node owned by an engineering manager.
        let bead = Bead::new("p1", "Add search", Priority::P1);
        let dev = Agent::new("dev", "developer").with_project("p1");
        db.upsert_bead(&bead).await.unwrap();
        db.upsert_agent(&dev).await.unwrap();
        let dispatcher = dispatcher(db.clone(), events);

        let result = dispatcher.dispatch_once(None).await.unwrap();
        assert!(!result.dispatched);
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.status, BeadStatus::Open);
        assert_eq!(stored.ctx(ctx::WORKFLOW_NODE), "design");
        assert_eq!(db.get_agent(&dev.id).await.unwrap().status, AgentStatus::Idle);

        let em = Agent::new("em", "engineering-manager");
        db.upsert_agent(&em).await.unwrap();
        let result = dispatcher.dispatch_once(None).await.unwrap();
        assert!(result.dispatched);
        assert_eq!(result.agent_id, em.id);
    }

    #[tokio::test]
    async fn test_budget_exhausted_blocks_bead() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(16));
        let mut bead = Bead::new("p1", "Add search", Priority::P1);
        bead.set_ctx(ctx::DISPATCH_COUNT, "2");
        db.upsert_bead(&bead).await.unwrap();
        db.upsert_agent(&Agent::new("dev", "developer")).await.unwrap();

        let result = dispatcher(db.clone(), events)
            .with_budget(2)
            .dispatch_once(None)
            .await
            .unwrap();
        assert!(!result.dispatched);
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.status, BeadStatus::Blocked);
        assert!(stored.ctx(ctx::RALPH_BLOCKED_REASON).contains("budget exhausted"));
    }
}
