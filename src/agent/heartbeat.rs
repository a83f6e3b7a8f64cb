//! The heartbeat loop ("Ralph").
//!
//! Each beat runs four phases in order:
//!
//! 1. Reset agents that have been `working` without activity for too long.
//! 2. Block beads flagged as looping and hand them to a triage agent.
//! 3. Drain work by calling the dispatcher until it finds nothing to do.
//! 4. Every Nth beat, reopen beads blocked on transient causes once the
//!    block is old enough, and sweep expired conversations.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::dispatch::Dispatcher;
use crate::config::HeartbeatConfig;
use crate::db::{AgentFilter, BeadFilter, Database, with_transaction};
use crate::error::{DatabaseError, DispatchError};
use crate::events::{Event, EventBus, types};
use crate::lock::LeaseKeeper;
use crate::model::{Agent, AgentStatus, Bead, BeadStatus, ctx};
use crate::workflow::ExecutionStatus;

/// Prefix of every block reason written by phase 2.
pub const RALPH_BLOCK_PREFIX: &str = "auto-blocked by Ralph: ";

/// Role search order for the triage agent that receives looping beads.
pub const TRIAGE_ROLES: &[&str] = &["cto", "chief-technology-officer", "engineering-manager"];

const TRANSIENT_MARKERS: &[&str] = &[
    "provider errors",
    "context canceled",
    "provider unavailable",
    "identical error repeated",
    "provider error",
    "rate limit",
];
const AUTH_MARKERS: &[&str] = &["auth", "unauthorized", "credential", "401", "403"];
const HARD_LIMIT_MARKERS: &[&str] = &["budget", "hard limit", "quota"];

const EVENT_SOURCE: &str = "ralph";

/// Why a bead was blocked, as far as recovery is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockClass {
    /// Provider hiccups; recovered after the provider threshold.
    Transient,
    /// Credential problems; recovered after the longer auth threshold.
    Auth,
    /// Budget or hard limits; never recovered.
    HardLimit,
    Unknown,
}

/// Classify a `ralph_blocked_reason`.
pub fn classify_block(reason: &str) -> BlockClass {
    let reason = reason.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| reason.contains(m));
    if has(HARD_LIMIT_MARKERS) {
        BlockClass::HardLimit
    } else if has(AUTH_MARKERS) {
        BlockClass::Auth
    } else if has(TRANSIENT_MARKERS) {
        BlockClass::Transient
    } else {
        BlockClass::Unknown
    }
}

/// Pick the agent that receives a looping bead.
pub fn pick_triage_agent<'a>(agents: &'a [Agent], project_id: &str) -> Option<&'a Agent> {
    let project: Vec<&Agent> = agents.iter().filter(|a| a.project_id == project_id).collect();
    let global: Vec<&Agent> = agents.iter().filter(|a| a.project_id.is_empty()).collect();
    for role in TRIAGE_ROLES {
        if let Some(agent) = project.iter().chain(global.iter()).find(|a| a.has_role(role)) {
            return Some(*agent);
        }
    }
    project.first().or(global.first()).copied()
}

/// What one beat did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BeatReport {
    pub beat: u64,
    /// False when another instance holds the lease; nothing else ran.
    pub lease_held: bool,
    pub agents_reset: usize,
    pub stuck_resolved: usize,
    pub dispatched: usize,
    pub recovered: usize,
    pub conversations_swept: u64,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, threshold: Duration) -> bool {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    now - since > threshold
}

pub struct HeartbeatLoop {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
    config: HeartbeatConfig,
    lease: Option<Arc<LeaseKeeper>>,
    beats: AtomicU64,
}

impl HeartbeatLoop {
    pub fn new(
        db: Arc<dyn Database>,
        events: Arc<EventBus>,
        dispatcher: Arc<Dispatcher>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            db,
            events,
            dispatcher,
            config,
            lease: None,
            beats: AtomicU64::new(0),
        }
    }

    /// Only beat while `lease` is held.
    pub fn with_lease(mut self, lease: Arc<LeaseKeeper>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn beat_count(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    // ==================== Phase 1 ====================

    /// Reset agents stuck in `working`. Their beads are flagged for redispatch.
    pub async fn reset_stuck_agents(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let working = self
            .db
            .list_agents(&AgentFilter {
                status: Some(AgentStatus::Working),
                ..Default::default()
            })
            .await?;

        let mut reset = 0;
        for mut agent in working {
            if !older_than(agent.last_active, now, self.config.stuck_agent_after) {
                continue;
            }
            let bead_id = std::mem::take(&mut agent.current_bead);
            agent.release(now);

            let bead = match self.db.get_bead(&bead_id).await {
                Ok(mut bead) if bead.assigned_to == agent.id && bead.status.is_active() => {
                    bead.set_ctx(ctx::REDISPATCH_REQUESTED, "true");
                    bead.updated_at = now;
                    Some(bead)
                }
                Ok(_) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            with_transaction(self.db.as_ref(), |batch| {
                batch.upsert_agent(&agent);
                if let Some(bead) = &bead {
                    batch.upsert_bead(bead);
                }
                Ok::<_, DatabaseError>(())
            })
            .await?;

            tracing::warn!(agent_id = %agent.id, bead_id = %bead_id, "Reset stuck agent");
            self.events.publish(
                Event::new(types::AGENT_STATUS_CHANGE, EVENT_SOURCE)
                    .with_project(agent.project_id.clone())
                    .with_data(serde_json::json!({
                        "agent_id": agent.id,
                        "status": agent.status.as_str(),
                        "reason": "stuck",
                    })),
            );
            reset += 1;
        }
        Ok(reset)
    }

    // ==================== Phase 2 ====================

    /// Block looping beads and assign them to a triage agent.
    pub async fn resolve_stuck_beads(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut looping = Vec::new();
        for status in [BeadStatus::Open, BeadStatus::InProgress] {
            let beads = self
                .db
                .list_beads(&BeadFilter {
                    status: Some(status),
                    ..Default::default()
                })
                .await?;
            looping.extend(beads.into_iter().filter(|b| {
                b.ctx_flag(ctx::LOOP_DETECTED)
                    && !b.is_ralph_blocked()
                    && b.ctx(ctx::WORKFLOW_STATUS) != ExecutionStatus::Escalated.as_str()
            }));
        }
        if looping.is_empty() {
            return Ok(0);
        }

        let agents = self.db.list_agents(&AgentFilter::default()).await?;
        let mut resolved = 0;
        for mut bead in looping {
            let detail = match bead.ctx(ctx::LOOP_DETECTED_REASON) {
                "" => "loop detected".to_string(),
                reason => reason.to_string(),
            };
            let previous = std::mem::take(&mut bead.assigned_to);
            bead.status = BeadStatus::Blocked;
            bead.set_ctx(ctx::RALPH_BLOCKED_AT, now.to_rfc3339());
            bead.set_ctx(ctx::RALPH_BLOCKED_REASON, format!("{}{}", RALPH_BLOCK_PREFIX, detail));
            bead.set_ctx(ctx::REDISPATCH_REQUESTED, "false");
            bead.updated_at = now;
            if let Some(triage) = pick_triage_agent(&agents, &bead.project_id) {
                bead.assigned_to = triage.id.clone();
            }

            // The agent that was looping lets go of the bead.
            let released = agents
                .iter()
                .find(|a| !previous.is_empty() && a.id == previous && a.current_bead == bead.id)
                .cloned()
                .map(|mut a| {
                    a.release(now);
                    a
                });

            with_transaction(self.db.as_ref(), |batch| {
                batch.upsert_bead(&bead);
                if let Some(agent) = &released {
                    batch.upsert_agent(agent);
                }
                Ok::<_, DatabaseError>(())
            })
            .await?;

            tracing::warn!(
                bead_id = %bead.id,
                triage_agent = %bead.assigned_to,
                reason = %detail,
                "Auto-blocked looping bead"
            );
            self.events.publish(
                Event::new(types::BEAD_STATUS_CHANGE, EVENT_SOURCE)
                    .with_project(bead.project_id.clone())
                    .with_data(serde_json::json!({
                        "bead_id": bead.id,
                        "status": BeadStatus::Blocked.as_str(),
                        "reason": bead.ctx(ctx::RALPH_BLOCKED_REASON),
                    })),
            );
            resolved += 1;
        }
        Ok(resolved)
    }

    // ==================== Phase 3 ====================

    /// Dispatch until nothing is dispatchable or the per-beat cap is hit.
    /// A dispatch error ends the drain for this beat.
    pub async fn drain(&self) -> usize {
        let mut dispatched = 0;
        while dispatched < self.config.max_dispatches_per_beat {
            match self.dispatcher.dispatch_once(None).await {
                Ok(result) if result.dispatched => dispatched += 1,
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(error = %e, kind = %e.kind(), "Dispatch failed, ending drain");
                    break;
                }
            }
        }
        dispatched
    }

    // ==================== Phase 4 ====================

    fn recovery_threshold(&self, class: BlockClass) -> Option<Duration> {
        match class {
            BlockClass::Transient => Some(self.config.provider_block_recovery),
            BlockClass::Auth => Some(self.config.auth_block_recovery),
            BlockClass::HardLimit | BlockClass::Unknown => None,
        }
    }

    /// Reopen beads whose transient block is older than its threshold.
    pub async fn recover_blocked(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let blocked = self
            .db
            .list_beads(&BeadFilter {
                status: Some(BeadStatus::Blocked),
                ..Default::default()
            })
            .await?;

        let mut recovered = 0;
        for mut bead in blocked {
            let reason = bead.ctx(ctx::RALPH_BLOCKED_REASON).to_string();
            let Some(threshold) = self.recovery_threshold(classify_block(&reason)) else {
                continue;
            };
            let Some(blocked_at) = bead.ralph_blocked_at() else {
                continue;
            };
            if !older_than(blocked_at, now, threshold) {
                continue;
            }

            bead.status = BeadStatus::Open;
            bead.assigned_to.clear();
            for (key, value) in [
                (ctx::RALPH_BLOCKED_REASON, ""),
                (ctx::RALPH_BLOCKED_AT, ""),
                (ctx::DISPATCH_COUNT, "0"),
                (ctx::LOOP_DETECTED, ""),
                (ctx::LOOP_DETECTED_REASON, ""),
                (ctx::ERROR_HISTORY, ""),
                (ctx::REDISPATCH_REQUESTED, "true"),
            ] {
                bead.set_ctx(key, value);
            }
            bead.updated_at = now;
            self.db.upsert_bead(&bead).await?;

            tracing::info!(bead_id = %bead.id, reason = %reason, "Auto-recovered blocked bead");
            self.events.publish(
                Event::new(types::BEAD_STATUS_CHANGE, EVENT_SOURCE)
                    .with_project(bead.project_id.clone())
                    .with_data(serde_json::json!({
                        "bead_id": bead.id,
                        "status": BeadStatus::Open.as_str(),
                        "reason": "auto-recovered",
                    })),
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    // ==================== Beat ====================

    pub async fn beat(&self) -> Result<BeatReport, DispatchError> {
        self.beat_at(Utc::now()).await
    }

    /// Run one beat with `now` as the reference time for age checks.
    pub async fn beat_at(&self, now: DateTime<Utc>) -> Result<BeatReport, DispatchError> {
        let started = Instant::now();
        let beat = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = BeatReport {
            beat,
            ..Default::default()
        };

        if let Some(lease) = &self.lease
            && !lease.is_held()
        {
            tracing::debug!(beat, lock = %lease.lock_name(), "Lease not held, skipping beat");
            report.elapsed = started.elapsed();
            return Ok(report);
        }
        report.lease_held = true;

        report.agents_reset = self.reset_stuck_agents(now).await?;
        report.stuck_resolved = self.resolve_stuck_beads(now).await?;
        report.dispatched = self.drain().await;

        if beat % self.config.recovery_every_n_beats.max(1) == 0 {
            report.recovered = self.recover_blocked(now).await?;
            report.conversations_swept = self.db.delete_expired_conversations(now).await?;
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            beat,
            dispatched = report.dispatched,
            stuck_resolved = report.stuck_resolved,
            agents_reset = report.agents_reset,
            recovered = report.recovered,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Heartbeat"
        );
        Ok(report)
    }

    /// Beat at the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "Heartbeat loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        tracing::error!(error = %e, kind = %e.kind(), "Heartbeat failed");
                    }
                }
            }
        }
        tracing::info!(beats = self.beat_count(), "Heartbeat loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::model::Priority;
    use crate::workflow::WorkflowEngine;

    fn ralph(db: Arc<dyn Database>) -> HeartbeatLoop {
        let events = Arc::new(EventBus::new(64));
        let engine = Arc::new(WorkflowEngine::new(db.clone(), events.clone()));
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), events.clone(), engine));
        HeartbeatLoop::new(db, events, dispatcher, HeartbeatConfig::default())
    }

    #[test]
    fn test_classify_block() {
        assert_eq!(classify_block("auto-blocked by Ralph: provider errors"), BlockClass::Transient);
        assert_eq!(
            classify_block("auto-blocked by Ralph: Identical error repeated 3 times: timeout"),
            BlockClass::Transient
        );
        assert_eq!(
            classify_block("Identical error repeated 3 times: Provider p rejected credentials (HTTP 401)"),
            BlockClass::Auth
        );
        assert_eq!(classify_block("budget exhausted"), BlockClass::HardLimit);
        assert_eq!(classify_block("waiting on design"), BlockClass::Unknown);
    }

    #[test]
    fn test_triage_order() {
        let dev = Agent::new("dev", "developer").with_project("p1");
        let em = Agent::new("em", "engineering_manager");
        let cto = Agent::new("cto", "Chief Technology Officer");
        let agents = vec![dev.clone(), em.clone(), cto.clone()];
        assert_eq!(pick_triage_agent(&agents, "p1").unwrap().id, cto.id);
        assert_eq!(pick_triage_agent(&agents[..2], "p1").unwrap().id, em.id);
        assert_eq!(pick_triage_agent(&agents[..1], "p1").unwrap().id, dev.id);
        assert!(pick_triage_agent(&[], "p1").is_none());
    }

    #[tokio::test]
    async fn test_stuck_agent_is_reset() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let mut bead = Bead::new("p1", "Add search", Priority::P1);
        let mut agent = Agent::new("dev", "developer");
        agent.assign(&bead.id, now - chrono::Duration::minutes(6));
        bead.status = BeadStatus::InProgress;
        bead.assigned_to = agent.id.clone();
        db.upsert_bead(&bead).await.unwrap();
        db.upsert_agent(&agent).await.unwrap();

        let mut fresh = Agent::new("fresh", "developer");
        fresh.assign("bd-other", now);
        db.upsert_agent(&fresh).await.unwrap();

        assert_eq!(ralph(db.clone()).reset_stuck_agents(now).await.unwrap(), 1);
        let agent = db.get_agent(&agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_bead.is_empty());
        assert_eq!(db.get_agent(&fresh.id).await.unwrap().status, AgentStatus::Working);
        assert_eq!(db.get_bead(&bead.id).await.unwrap().ctx(ctx::REDISPATCH_REQUESTED), "true");
    }

    #[tokio::test]
    async fn test_looping_bead_is_blocked_and_triaged() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let cto = Agent::new("cto", "cto");
        db.upsert_agent(&cto).await.unwrap();
        let mut bead = Bead::new("p1", "Add search", Priority::P1);
        bead.set_ctx(ctx::LOOP_DETECTED, "true");
        bead.set_ctx(ctx::LOOP_DETECTED_REASON, "Identical error repeated 3 times: boom");
        db.upsert_bead(&bead).await.unwrap();

        let now = Utc::now();
        assert_eq!(ralph(db.clone()).resolve_stuck_beads(now).await.unwrap(), 1);
        let stored = db.get_bead(&bead.id).await.unwrap();
        assert_eq!(stored.status, BeadStatus::Blocked);
        assert_eq!(stored.assigned_to, cto.id);
        assert_eq!(
            stored.ctx(ctx::RALPH_BLOCKED_REASON),
            "auto-blocked by Ralph: Identical error repeated 3 times: boom"
        );
        assert_eq!(stored.ralph_blocked_at(), Some(now));
    }

    #[tokio::test]
    async fn test_lease_not_held_skips_beat() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let lease = Arc::new(LeaseKeeper::new(db.clone(), "ralph", "i1", Duration::from_secs(30)));
        let heartbeat = ralph(db).with_lease(lease);
        let report = heartbeat.beat().await.unwrap();
        assert_eq!(report.beat, 1);
        assert!(!report.lease_held);
    }
}
