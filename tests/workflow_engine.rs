//! Workflow engine behavior across advances, cycles, escalation, and reset.

use std::sync::Arc;

use pretty_assertions::assert_eq;

use beadwork::db::{Database, MemoryStore, WriteBatch, WriteOp};
use beadwork::events::{EventBus, of_types, types};
use beadwork::model::{Bead, BeadStatus, Priority, ctx};
use beadwork::workflow::{
    AdvanceOutcome, EdgeCondition, ExecutionStatus, NodeType, Workflow, WorkflowEngine,
};

fn investigate_fix_verify() -> Workflow {
    let mut wf = Workflow::new("wf-w", "W", "bug");
    wf.add_node("investigate", NodeType::Task, "developer");
    wf.add_node("fix", NodeType::Task, "developer");
    wf.add_node("verify", NodeType::Verify, "qa-engineer");
    wf.add_edge("", "investigate", EdgeCondition::Success);
    wf.add_edge("investigate", "fix", EdgeCondition::Success);
    wf.add_edge("fix", "verify", EdgeCondition::Success);
    wf.add_edge("verify", "", EdgeCondition::Success);
    wf.add_edge("verify", "investigate", EdgeCondition::Failure);
    wf
}

async fn setup() -> (Arc<dyn Database>, Arc<EventBus>, WorkflowEngine, Bead) {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let events = Arc::new(EventBus::new(64));
    db.upsert_workflow(&investigate_fix_verify()).await.unwrap();
    let bead = Bead::new("p1", "Login crash", Priority::P1);
    db.upsert_bead(&bead).await.unwrap();
    let engine = WorkflowEngine::new(db.clone(), events.clone());
    (db, events, engine, bead)
}

async fn succeed(engine: &WorkflowEngine, execution_id: &str) -> AdvanceOutcome {
    engine
        .advance_workflow(execution_id, EdgeCondition::Success, "agent-1", serde_json::json!({}))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_back_edge_failures_escalate_on_third_cycle() {
    let (db, events, engine, bead) = setup().await;
    let mut decisions = events.subscribe(of_types(&[types::DECISION_CREATED]));
    let exec = engine.start_workflow(&bead.id, "wf-w", "p1").await.unwrap();
    for _ in 0..3 {
        succeed(&engine, &exec.id).await;
    }
    assert_eq!(engine.get_execution(&exec.id).await.unwrap().current_node_key, "verify");

    let mut outcomes = Vec::new();
    for round in 0..3 {
        if round > 0 {
            // Put the execution back on verify for the next failure.
            let mut current = engine.get_execution(&exec.id).await.unwrap();
            current.current_node_key = "verify".to_string();
            db.commit(WriteBatch::one(WriteOp::UpsertExecution(current)))
                .await
                .unwrap();
        }
        outcomes.push(
            engine
                .advance_workflow(&exec.id, EdgeCondition::Failure, "agent-2", serde_json::json!({}))
                .await
                .unwrap(),
        );
    }

    assert!(matches!(outcomes[0], AdvanceOutcome::Advanced { ref node_key, .. } if node_key == "investigate"));
    assert_eq!(outcomes[0].execution().cycle_count, 1);
    assert_eq!(outcomes[1].execution().cycle_count, 2);
    let AdvanceOutcome::Escalated { execution, decision_bead_id } = &outcomes[2] else {
        panic!("expected escalation, got {:?}", outcomes[2]);
    };
    assert_eq!(execution.cycle_count, 3);
    assert_eq!(execution.status, ExecutionStatus::Escalated);

    let stored = db.get_bead(&bead.id).await.unwrap();
    assert_eq!(
        stored.ctx(ctx::ESCALATION_REASON),
        "Exceeded max cycles (3): workflow has cycled 3 times"
    );
    assert_eq!(stored.ctx(ctx::NEEDS_CEO_REVIEW), "true");
    assert_eq!(stored.ctx(ctx::WORKFLOW_STATUS), "escalated");
    assert_eq!(stored.status, BeadStatus::Blocked);

    let decision_id = decision_bead_id.clone().unwrap();
    assert_eq!(stored.ctx(ctx::ESCALATED_TO_CEO_DECISION_ID), decision_id);
    let decision = db.get_bead(&decision_id).await.unwrap();
    assert_eq!(decision.priority, Priority::P0);
    assert_eq!(decision.bead_type, "decision");
    assert_eq!(decisions.try_recv().unwrap().data_str("decision_id"), decision_id);

    let info = engine.get_escalation_info(&exec.id).await.unwrap();
    assert!(info.description.contains("Exceeded max cycles (3)"));
}

#[tokio::test]
async fn test_revisiting_any_node_counts_as_a_cycle() {
    let (_db, _events, engine, bead) = setup().await;
    let exec = engine.start_workflow(&bead.id, "wf-w", "p1").await.unwrap();
    for _ in 0..3 {
        succeed(&engine, &exec.id).await;
    }
    let back = engine
        .advance_workflow(&exec.id, EdgeCondition::Failure, "qa", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(back.execution().cycle_count, 1);

    // investigate -> fix re-enters fix, fix -> verify re-enters verify.
    assert_eq!(succeed(&engine, &exec.id).await.execution().cycle_count, 2);
    assert!(matches!(succeed(&engine, &exec.id).await, AdvanceOutcome::Escalated { .. }));
}

#[tokio::test]
async fn test_reset_allows_fresh_start() {
    let (db, _events, engine, bead) = setup().await;
    let first = engine.start_workflow(&bead.id, "wf-w", "p1").await.unwrap();
    succeed(&engine, &first.id).await;
    assert_eq!(db.list_history(&first.id).await.unwrap().len(), 1);

    assert!(engine.delete_execution_by_bead(&bead.id).await.unwrap());
    assert!(db.get_execution_by_bead(&bead.id).await.unwrap().is_none());
    assert!(db.list_history(&first.id).await.unwrap().is_empty());
    assert!(!engine.delete_execution_by_bead(&bead.id).await.unwrap());

    let second = engine.start_workflow(&bead.id, "wf-w", "p1").await.unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.current_node_key, "");
    assert_eq!(second.cycle_count, 0);
}

#[tokio::test]
async fn test_resolving_decision_reopens_bead() {
    let (db, _events, engine, bead) = setup().await;
    let exec = engine.start_workflow(&bead.id, "wf-w", "p1").await.unwrap();
    succeed(&engine, &exec.id).await;
    let AdvanceOutcome::Escalated { decision_bead_id, .. } =
        engine.escalate(&exec.id, "needs a product call").await.unwrap()
    else {
        panic!("expected escalation");
    };

    let decision_id = decision_bead_id.unwrap();
    let decision = engine.resolve_decision(&decision_id, "retry", "ceo").await.unwrap();
    assert_eq!(decision.status, BeadStatus::Closed);

    let reopened = db.get_bead(&bead.id).await.unwrap();
    assert_eq!(reopened.status, BeadStatus::Open);
    assert_eq!(reopened.ctx(ctx::REDISPATCH_REQUESTED), "true");
    assert_eq!(reopened.ctx(ctx::NEEDS_CEO_REVIEW), "false");
    assert!(db.get_execution_by_bead(&bead.id).await.unwrap().is_none());
    assert!(engine.resolve_decision(&decision_id, "retry", "ceo").await.is_err());
}
