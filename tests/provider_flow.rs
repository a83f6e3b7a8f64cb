//! Provider probing and a dispatched bead running against a local
//! OpenAI-compatible server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use beadwork::agent::{Dispatcher, ProviderExecutor};
use beadwork::config::{KnowledgeConfig, ProviderHeartbeatConfig};
use beadwork::db::{Database, MemoryStore};
use beadwork::events::EventBus;
use beadwork::knowledge::LessonStore;
use beadwork::model::{Agent, AgentStatus, Bead, Priority, Provider, ProviderStatus, ctx};
use beadwork::providers::heartbeat::ERROR_NO_ENDPOINT;
use beadwork::providers::{ModelCatalog, ProviderHeartbeat, ProviderQueryActivity, ProviderRegistry};
use beadwork::workflow::{WorkflowEngine, ensure_default_workflows};

const SERVED_MODELS: [&str; 2] = ["Qwen2.5-Coder-7B-Instruct", "llama-3.1-8b-instruct"];

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": SERVED_MODELS.iter().map(|id| json!({ "id": id, "object": "model" })).collect::<Vec<_>>(),
    }))
}

async fn chat(State(calls): State<Arc<AtomicUsize>>, Json(body): Json<Value>) -> Json<Value> {
    calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "id": "chatcmpl-1",
        "model": body["model"],
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "Design: add an inverted index over bead titles." },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 40, "completion_tokens": 12, "total_tokens": 52 },
    }))
}

/// Serve a fake provider on an ephemeral port. Returns its `/v1` endpoint.
async fn fake_provider(calls: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat))
        .with_state(calls);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}/v1", addr.port())
}

fn registry(db: Arc<dyn Database>, events: Arc<EventBus>) -> Arc<ProviderRegistry> {
    Arc::new(ProviderRegistry::new(db, events))
}

fn prober(registry: Arc<ProviderRegistry>) -> ProviderHeartbeat {
    let config = ProviderHeartbeatConfig {
        probe_timeout: Duration::from_secs(2),
        activity_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    ProviderHeartbeat::new(registry, ModelCatalog::default(), config)
}

#[tokio::test]
async fn test_heartbeat_marks_reachable_provider_healthy() {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let events = Arc::new(EventBus::new(64));
    let endpoint = fake_provider(Arc::new(AtomicUsize::new(0))).await;
    let registry = registry(db, events);
    registry
        .register(Provider::new("local", "Local vLLM", endpoint.clone()), None)
        .await
        .unwrap();

    let provider = prober(registry.clone()).beat("local").await.unwrap();
    assert_eq!(provider.status, ProviderStatus::Healthy);
    assert_eq!(provider.endpoint, endpoint);
    assert!(provider.last_heartbeat_error.is_empty());
    assert!(provider.last_heartbeat_at.is_some());
    assert!(SERVED_MODELS.contains(&provider.selected_model.as_str()));
    assert_eq!(provider.model, provider.selected_model);

    let stored = registry.get("local").await.unwrap();
    assert_eq!(stored.status, ProviderStatus::Healthy);
}

#[tokio::test]
async fn test_heartbeat_fails_provider_without_endpoint() {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let registry = registry(db, Arc::new(EventBus::new(16)));
    registry
        .register(Provider::new("blank", "Blank", ""), None)
        .await
        .unwrap();

    let provider = prober(registry).beat("blank").await.unwrap();
    assert_eq!(provider.status, ProviderStatus::Failed);
    assert_eq!(provider.last_heartbeat_error, ERROR_NO_ENDPOINT);
}

#[tokio::test]
async fn test_heartbeat_fails_unreachable_provider() {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let registry = registry(db, Arc::new(EventBus::new(16)));
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    registry
        .register(
            Provider::new("gone", "Gone", format!("http://127.0.0.1:{}/v1", port)),
            None,
        )
        .await
        .unwrap();

    let provider = prober(registry).beat("gone").await.unwrap();
    assert_eq!(provider.status, ProviderStatus::Failed);
    assert!(!provider.last_heartbeat_error.is_empty());
}

#[tokio::test]
async fn test_dispatched_bead_advances_through_provider() {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let events = Arc::new(EventBus::new(256));
    ensure_default_workflows(db.as_ref()).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let endpoint = fake_provider(calls.clone()).await;
    let registry = registry(db.clone(), events.clone());
    registry
        .register(Provider::new("local", "Local vLLM", endpoint), None)
        .await
        .unwrap();
    prober(registry.clone()).beat("local").await.unwrap();

    let agent = Agent::new("Morgan", "engineering-manager").with_provider("local");
    db.upsert_agent(&agent).await.unwrap();
    let bead = Bead::new("p1", "Add search", Priority::P1);
    db.upsert_bead(&bead).await.unwrap();

    let engine = Arc::new(WorkflowEngine::new(db.clone(), events.clone()));
    let executor = ProviderExecutor::new(
        db.clone(),
        events.clone(),
        engine.clone(),
        registry.clone(),
        ProviderQueryActivity::new(registry.clone(), Duration::from_secs(10)),
        LessonStore::new(db.clone(), KnowledgeConfig::default()),
    );
    let dispatcher = Dispatcher::new(db.clone(), events, engine).with_executor(Arc::new(executor));

    let result = dispatcher.dispatch_once(None).await.unwrap();
    assert!(result.dispatched);
    assert_eq!(result.bead_id, bead.id);
    assert_eq!(result.agent_id, agent.id);

    // The executor runs in its own task and frees the agent when done.
    let mut idle = false;
    for _ in 0..100 {
        if db.get_agent(&agent.id).await.unwrap().status == AgentStatus::Idle {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(idle, "agent never returned to idle");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let execution = db.get_execution_by_bead(&bead.id).await.unwrap().unwrap();
    assert_eq!(execution.workflow_id, "wf-feature");
    assert_eq!(execution.current_node_key, "approve");
    let history = db.list_history(&execution.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.node_key, "design");
    assert_eq!(last.agent_id, agent.id);
    assert_eq!(last.result_data["tokens_used"], json!(52));

    // Approval nodes wait for a human instead of being redispatched.
    let stored = db.get_bead(&bead.id).await.unwrap();
    assert_eq!(stored.ctx(ctx::WORKFLOW_NODE), "approve");
    assert_eq!(stored.ctx(ctx::REDISPATCH_REQUESTED), "false");
}

#[tokio::test]
async fn test_heartbeat_keeps_metrics_recorded_during_probe() {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let registry = registry(db, Arc::new(EventBus::new(16)));

    // Accept connections and never answer so the probe runs to its timeout.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    registry
        .register(
            Provider::new("slow", "Slow", format!("http://127.0.0.1:{}/v1", port)),
            None,
        )
        .await
        .unwrap();

    let config = ProviderHeartbeatConfig {
        probe_timeout: Duration::from_millis(300),
        activity_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let heartbeat = ProviderHeartbeat::new(registry.clone(), ModelCatalog::default(), config);
    let beat = tokio::spawn(async move { heartbeat.beat("slow").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    registry.record_success("slow", 120, 64).await.unwrap();
    assert_eq!(registry.get("slow").await.unwrap().metrics.total_requests, 1);

    let provider = beat.await.unwrap().unwrap();
    assert_eq!(provider.status, ProviderStatus::Failed);
    assert_eq!(provider.metrics.total_requests, 1);
    let stored = registry.get("slow").await.unwrap();
    assert_eq!(stored.metrics.total_requests, 1);
    assert_eq!(stored.metrics.total_tokens, 64);
}
