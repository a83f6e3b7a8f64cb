//! Beadwork orchestrator binary.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use beadwork::activity::ActivityFeed;
use beadwork::agent::{Dispatcher, HeartbeatLoop, ProviderExecutor};
use beadwork::bus::MessageBus;
use beadwork::ci_monitor::{CiMonitor, GhCli};
use beadwork::config::Config;
use beadwork::db::{Database, connect};
use beadwork::events::EventBus;
use beadwork::knowledge::LessonStore;
use beadwork::lock::{LeaseKeeper, register_instance, run_instance_heartbeat};
use beadwork::notifications::NotificationService;
use beadwork::providers::{ModelCatalog, ProviderHeartbeat, ProviderQueryActivity, ProviderRegistry};
use beadwork::secrets::SecretsCrypto;
use beadwork::workflow::{WorkflowEngine, ensure_default_workflows};

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "beadwork", version, about = "Multi-agent work orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the heartbeat, provider probes, CI monitor, and listeners until Ctrl-C.
    Run,
    /// Run a single heartbeat and print its report.
    Beat,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("beadwork=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

struct Runtime {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    heartbeat: HeartbeatLoop,
}

async fn build(config: &Config) -> anyhow::Result<Runtime> {
    let db = connect(&config.database).await.context("failed to open database")?;
    let seeded = ensure_default_workflows(db.as_ref()).await?;
    if !seeded.is_empty() {
        tracing::info!(workflows = ?seeded, "Seeded default workflows");
    }

    let crypto = match &config.secrets.master_key {
        Some(key) => SecretsCrypto::new(key.clone()).context("invalid SECRETS_MASTER_KEY")?,
        None => {
            tracing::warn!("SECRETS_MASTER_KEY not set, using an ephemeral key; stored secrets will not survive a restart");
            SecretsCrypto::ephemeral()
        }
    };

    let events = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
    let registry = Arc::new(ProviderRegistry::new(db.clone(), events.clone()).with_crypto(Arc::new(crypto)));
    let engine = Arc::new(WorkflowEngine::new(db.clone(), events.clone()));
    let executor = ProviderExecutor::new(
        db.clone(),
        events.clone(),
        engine.clone(),
        registry.clone(),
        ProviderQueryActivity::new(registry.clone(), config.provider_heartbeat.query_timeout),
        LessonStore::new(db.clone(), config.knowledge.clone()),
    );
    let dispatcher = Arc::new(
        Dispatcher::new(db.clone(), events.clone(), engine).with_executor(Arc::new(executor)),
    );
    let heartbeat = HeartbeatLoop::new(db.clone(), events.clone(), dispatcher, config.heartbeat.clone());

    Ok(Runtime {
        db,
        events,
        registry,
        heartbeat,
    })
}

async fn run(config: Config) -> anyhow::Result<()> {
    let Runtime {
        db,
        events,
        registry,
        heartbeat,
    } = build(&config).await?;
    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    let instance = register_instance(db.as_ref(), &config.instance.instance_id).await?;
    let lease = Arc::new(LeaseKeeper::new(
        db.clone(),
        config.heartbeat.lock_name.clone(),
        config.instance.instance_id.clone(),
        config.instance.lock_ttl,
    ));
    if !lease.acquire().await? {
        tracing::info!(lock = %lease.lock_name(), "Another instance holds the heartbeat lease, standing by");
    }
    tasks.spawn(lease.clone().run(cancel.clone()));
    tasks.spawn(run_instance_heartbeat(
        db.clone(),
        instance,
        config.instance.lock_ttl / 3,
        cancel.clone(),
    ));

    let heartbeat = Arc::new(heartbeat.with_lease(lease));
    tasks.spawn(heartbeat.run(cancel.clone()));

    let provider_heartbeat = Arc::new(ProviderHeartbeat::new(
        registry,
        ModelCatalog::default(),
        config.provider_heartbeat.clone(),
    ));
    tasks.spawn(provider_heartbeat.run(cancel.clone()));

    let ci_monitor = Arc::new(CiMonitor::new(
        db.clone(),
        events.clone(),
        Arc::new(GhCli::new()),
        config.ci_monitor.clone(),
    ));
    tasks.spawn(ci_monitor.run(cancel.clone()));

    let notifications = Arc::new(NotificationService::new(db.clone()));
    tasks.spawn(notifications.run(events.clone(), cancel.clone()));
    let feed = Arc::new(ActivityFeed::new(db.clone()));
    tasks.spawn(feed.run(events.clone(), cancel.clone()));

    let message_bus = MessageBus::new(events.clone(), &config.message_bus);

    tracing::info!(instance_id = %config.instance.instance_id, "Beadwork running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    cancel.cancel();
    message_bus.close();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Background task failed");
        }
    }
    events.close();
    Ok(())
}

async fn beat_once(config: Config) -> anyhow::Result<()> {
    let runtime = build(&config).await?;
    let report = runtime.heartbeat.beat().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Beat => beat_once(config).await,
    }
}
