//! The embedded libSQL store against a file in a temp directory.
#![cfg(feature = "libsql")]

use std::sync::Arc;

use chrono::{Duration, Utc};

use beadwork::config::{DatabaseBackend, DatabaseConfig};
use beadwork::db::{Database, connect};
use beadwork::events::EventBus;
use beadwork::model::{Agent, AgentStatus, Bead, BeadStatus, Priority, User, ctx};
use beadwork::workflow::{AdvanceOutcome, EdgeCondition, WorkflowEngine, ensure_default_workflows};

async fn open(dir: &tempfile::TempDir) -> Arc<dyn Database> {
    let config = DatabaseConfig {
        backend: DatabaseBackend::LibSql,
        libsql_path: dir.path().join("beadwork.db"),
        ..Default::default()
    };
    connect(&config).await.unwrap()
}

#[tokio::test]
async fn test_beads_and_agents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut bead = Bead::new("p1", "Add search", Priority::P0).with_description("Full-text search over beads");
    bead.set_ctx(ctx::DISPATCH_COUNT, "2");
    let agent = Agent::new("Morgan", "engineering-manager").with_project("p1");
    {
        let db = open(&dir).await;
        db.upsert_bead(&bead).await.unwrap();
        db.upsert_agent(&agent).await.unwrap();
    }

    let db = open(&dir).await;
    let stored = db.get_bead(&bead.id).await.unwrap();
    assert_eq!(stored.title, "Add search");
    assert_eq!(stored.priority, Priority::P0);
    assert_eq!(stored.status, BeadStatus::Open);
    assert_eq!(stored.dispatch_count(), 2);
    assert_eq!(stored.description, bead.description);

    let stored_agent = db.get_agent(&agent.id).await.unwrap();
    assert_eq!(stored_agent.role, "engineering-manager");
    assert_eq!(stored_agent.status, AgentStatus::Idle);

    assert!(db.get_bead("bd-missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_username_lookup_ignores_case() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    db.upsert_user(&User::new("u-alice", "Alice")).await.unwrap();

    let found = db.find_user_by_username("alice").await.unwrap().unwrap();
    assert_eq!(found.id, "u-alice");
    assert!(db.find_user_by_username("bob").await.unwrap().is_none());
}

#[tokio::test]
async fn test_advisory_lock_has_one_holder() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    let now = Utc::now();
    let ttl = Duration::seconds(30);

    assert!(db.try_acquire_lock("ralph", "i1", ttl, now).await.unwrap());
    assert!(!db.try_acquire_lock("ralph", "i2", ttl, now).await.unwrap());
    assert!(db.try_acquire_lock("ralph", "i1", ttl, now).await.unwrap());

    // Once the lease lapses another instance may take it.
    let later = now + Duration::seconds(31);
    assert!(db.try_acquire_lock("ralph", "i2", ttl, later).await.unwrap());
    assert_eq!(db.get_lock("ralph").await.unwrap().unwrap().instance_id, "i2");

    db.release_lock("ralph", "i2").await.unwrap();
    assert!(db.get_lock("ralph").await.unwrap().is_none());
}

#[tokio::test]
async fn test_workflow_transitions_commit_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    ensure_default_workflows(db.as_ref()).await.unwrap();
    let bead = Bead::new("p1", "Add search", Priority::P1);
    db.upsert_bead(&bead).await.unwrap();

    let engine = WorkflowEngine::new(db.clone(), Arc::new(EventBus::new(16)));
    let exec = engine.start_workflow(&bead.id, "wf-feature", "p1").await.unwrap();
    let again = engine.start_workflow(&bead.id, "wf-feature", "p1").await.unwrap();
    assert_eq!(again.id, exec.id);

    let outcome = engine
        .advance_workflow(&exec.id, EdgeCondition::Success, "system", serde_json::json!({}))
        .await
        .unwrap();
    assert!(matches!(outcome, AdvanceOutcome::Advanced { ref node_key, .. } if node_key == "design"));

    let stored = db.get_execution_by_bead(&bead.id).await.unwrap().unwrap();
    assert_eq!(stored.current_node_key, "design");
    assert_eq!(db.list_history(&exec.id).await.unwrap().len(), 1);
    assert_eq!(db.get_bead(&bead.id).await.unwrap().ctx(ctx::WORKFLOW_NODE), "design");

    assert!(engine.delete_execution_by_bead(&bead.id).await.unwrap());
    assert!(db.get_execution_by_bead(&bead.id).await.unwrap().is_none());
    assert!(db.list_history(&exec.id).await.unwrap().is_empty());
}
