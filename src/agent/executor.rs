//! Running a dispatched bead on its agent's provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::Database;
use crate::error::DispatchError;
use crate::events::{Event, EventBus, types};
use crate::knowledge::{LessonStore, ProjectMemory};
use crate::model::{Agent, Bead, ctx};
use crate::providers::{ChatMessage, ProviderQueryActivity, ProviderRegistry, QueryInput};
use crate::workflow::{WorkflowEngine, WorkflowNode};

/// Errors kept in a bead's `error_history`.
pub const ERROR_HISTORY_LEN: usize = 5;
/// Identical trailing errors that mark a bead as looping.
pub const LOOP_THRESHOLD: usize = 3;

const EVENT_SOURCE: &str = "executor";
const PROMPT_LESSONS: usize = 5;
const PROMPT_LESSON_CHARS: usize = 2000;
const RESULT_EXCERPT_CHARS: usize = 4000;

/// Runs one dispatched bead to the end of its current node.
///
/// Implementations own the agent's `working -> idle` transition.
#[async_trait]
pub trait BeadExecutor: Send + Sync {
    async fn execute(&self, bead: Bead, agent: Agent) -> Result<(), DispatchError>;
}

/// Append `error` to a serialized error history, keeping the newest entries.
///
/// Returns the new history and, when the last [`LOOP_THRESHOLD`] entries are
/// identical, the loop reason.
pub fn push_error_history(raw: &str, error: &str) -> (String, Option<String>) {
    let mut history: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
    history.push(error.to_string());
    if history.len() > ERROR_HISTORY_LEN {
        history.drain(..history.len() - ERROR_HISTORY_LEN);
    }

    let repeated = history
        .iter()
        .rev()
        .take_while(|e| e.as_str() == error)
        .count();
    let reason = (repeated >= LOOP_THRESHOLD)
        .then(|| format!("Identical error repeated {} times: {}", repeated, error));
    let encoded = serde_json::to_string(&history).unwrap_or_else(|_| "[]".to_string());
    (encoded, reason)
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Executes beads with a chat completion against the agent's provider.
pub struct ProviderExecutor {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    engine: Arc<WorkflowEngine>,
    registry: Arc<ProviderRegistry>,
    query: ProviderQueryActivity,
    memory: ProjectMemory,
    lessons: LessonStore,
}

impl ProviderExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        events: Arc<EventBus>,
        engine: Arc<WorkflowEngine>,
        registry: Arc<ProviderRegistry>,
        query: ProviderQueryActivity,
        lessons: LessonStore,
    ) -> Self {
        Self {
            memory: ProjectMemory::new(db.clone()),
            db,
            events,
            engine,
            registry,
            query,
            lessons,
        }
    }

    /// The agent's own provider when usable, else the best-scoring usable one.
    async fn provider_for(&self, agent: &Agent) -> Result<Option<String>, DispatchError> {
        if !agent.provider_id.is_empty()
            && let Ok(provider) = self.registry.get(&agent.provider_id).await
            && provider.status.is_usable()
        {
            return Ok(Some(provider.id));
        }
        let usable = self.registry.list_usable().await?;
        Ok(usable.into_iter().next().map(|p| p.id))
    }

    async fn build_messages(&self, bead: &Bead, agent: &Agent, node: Option<&WorkflowNode>) -> Vec<ChatMessage> {
        let role = node
            .map(|n| n.role_required.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or(&agent.role);
        let mut system = format!("You are {}, working as {}.", agent.name, role);

        match self.memory.build_context_summary(&bead.project_id).await {
            Ok(summary) if !summary.is_empty() => {
                system.push_str("\n\n## Project memory\n");
                system.push_str(&summary);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(project_id = %bead.project_id, error = %e, "Failed to load project memory"),
        }
        match self
            .lessons
            .lessons_for_project(&bead.project_id, PROMPT_LESSONS, PROMPT_LESSON_CHARS)
            .await
        {
            Ok(lessons) if !lessons.is_empty() => {
                system.push_str("\n\n## Lessons learned\n");
                for scored in lessons {
                    system.push_str(&format!("- {}: {}\n", scored.lesson.title, scored.lesson.detail));
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(project_id = %bead.project_id, error = %e, "Failed to load lessons"),
        }

        let mut task = format!("# {}\n\n{}", bead.title, bead.description);
        if let Some(node) = node.filter(|n| !n.instructions.is_empty()) {
            task.push_str(&format!("\n\n## Step: {}\n{}", node.node_key, node.instructions));
        }
        vec![ChatMessage::system(system), ChatMessage::user(task)]
    }

    /// Record an error on the bead and flag it when it keeps repeating.
    async fn record_error(&self, bead_id: &str, error: &str) -> Result<(), DispatchError> {
        let mut bead = self.db.get_bead(bead_id).await?;
        let (history, loop_reason) = push_error_history(bead.ctx(ctx::ERROR_HISTORY), error);
        bead.set_ctx(ctx::ERROR_HISTORY, history);
        if let Some(reason) = loop_reason {
            tracing::warn!(bead_id, reason = %reason, "Loop detected");
            bead.set_ctx(ctx::LOOP_DETECTED, "true");
            bead.set_ctx(ctx::LOOP_DETECTED_REASON, reason);
        }
        bead.updated_at = Utc::now();
        self.db.upsert_bead(&bead).await?;
        Ok(())
    }

    /// Return the agent to idle if it is still on this bead.
    async fn release(&self, agent_id: &str, bead: &Bead) -> Result<(), DispatchError> {
        let mut agent = self.db.get_agent(agent_id).await?;
        if agent.current_bead != bead.id {
            return Ok(());
        }
        agent.release(Utc::now());
        self.db.upsert_agent(&agent).await?;
        self.events.publish(
            Event::new(types::AGENT_STATUS_CHANGE, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "agent_id": agent.id,
                    "status": agent.status.as_str(),
                })),
        );
        self.events.publish(
            Event::new(types::AGENT_COMPLETED, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "agent_id": agent.id,
                    "bead_id": bead.id,
                })),
        );
        Ok(())
    }

    async fn run(&self, bead: &Bead, agent: &Agent) -> Result<(), DispatchError> {
        let execution = self.db.get_execution_by_bead(&bead.id).await?;
        let node = match &execution {
            Some(e) => self.engine.current_node(e).await?,
            None => None,
        };

        let outcome = match self.provider_for(agent).await? {
            Some(provider_id) => {
                let messages = self.build_messages(bead, agent, node.as_ref()).await;
                self.query
                    .run(QueryInput::new(provider_id, messages))
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("provider unavailable: no usable provider".to_string()),
        };

        match outcome {
            Ok(output) => {
                tracing::info!(
                    bead_id = %bead.id,
                    agent_id = %agent.id,
                    model = %output.model,
                    tokens = output.tokens_used,
                    "Bead step completed"
                );
                if let Some(execution) = execution {
                    let result = serde_json::json!({
                        "provider_id": output.provider_id,
                        "model": output.model,
                        "tokens_used": output.tokens_used,
                        "latency_ms": output.latency_ms,
                        "response": excerpt(&output.response, RESULT_EXCERPT_CHARS),
                    });
                    self.engine.complete_node(&execution.id, &agent.id, result).await?;
                }
            }
            Err(error) => {
                tracing::warn!(bead_id = %bead.id, agent_id = %agent.id, error = %error, "Bead step failed");
                self.record_error(&bead.id, &error).await?;
                if let Some(execution) = execution {
                    self.engine
                        .fail_node(&execution.id, &agent.id, serde_json::json!({ "error": error }))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BeadExecutor for ProviderExecutor {
    async fn execute(&self, bead: Bead, agent: Agent) -> Result<(), DispatchError> {
        let result = self.run(&bead, &agent).await;
        if let Err(e) = self.release(&agent.id, &bead).await {
            tracing::error!(agent_id = %agent.id, error = %e, "Failed to release agent");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_history_keeps_last_five() {
        let mut raw = String::new();
        for i in 0..7 {
            raw = push_error_history(&raw, &format!("e{}", i)).0;
        }
        let history: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(history, vec!["e2", "e3", "e4", "e5", "e6"]);
    }

    #[test]
    fn test_identical_errors_flag_loop() {
        let (raw, reason) = push_error_history("", "boom");
        assert!(reason.is_none());
        let (raw, reason) = push_error_history(&raw, "boom");
        assert!(reason.is_none());
        let (_, reason) = push_error_history(&raw, "boom");
        assert_eq!(reason.unwrap(), "Identical error repeated 3 times: boom");

        let (raw, _) = push_error_history("", "a");
        let (raw, _) = push_error_history(&raw, "b");
        let (_, reason) = push_error_history(&raw, "a");
        assert!(reason.is_none());
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé...");
        assert_eq!(excerpt("hi", 5), "hi");
    }
}
