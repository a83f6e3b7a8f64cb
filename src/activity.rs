//! Activity feed.
//!
//! Entries are immutable except for aggregation: an entry carrying an
//! `aggregation_key` seen within the last few minutes bumps the count on
//! the existing row instead of adding a new one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::{ACTIVITY_AGGREGATION_WINDOW_MINUTES, Database};
use crate::error::DatabaseError;
use crate::events::{Event, EventBus, of_types, types};
use crate::model::{Activity, Visibility};

/// Events mirrored into the feed by [`ActivityFeed::run`].
pub const FEED_EVENTS: &[&str] = &[
    types::BEAD_CREATED,
    types::BEAD_ASSIGNED,
    types::BEAD_STATUS_CHANGE,
    types::BEAD_COMPLETED,
    types::AGENT_COMPLETED,
    types::WORKFLOW_STARTED,
    types::WORKFLOW_COMPLETED,
    types::WORKFLOW_ESCALATED,
    types::DECISION_CREATED,
    types::DECISION_RESOLVED,
    types::COMMENT_CREATED,
];

/// Store `activity`, folding it into a recent row with the same
/// aggregation key when one exists. Returns the stored row.
pub async fn record_activity(
    db: &dyn Database,
    activity: Activity,
    now: DateTime<Utc>,
) -> Result<Activity, DatabaseError> {
    if let Some(key) = activity.aggregation_key.as_deref() {
        let since = now - chrono::Duration::minutes(ACTIVITY_AGGREGATION_WINDOW_MINUTES);
        if let Some(mut existing) = db.recent_aggregatable_activity(key, since).await? {
            existing.aggregation_count += 1;
            existing.timestamp = now;
            db.upsert_activity(&existing).await?;
            tracing::debug!(aggregation_key = key, count = existing.aggregation_count, "Activity aggregated");
            return Ok(existing);
        }
    }
    let mut activity = activity;
    activity.timestamp = now;
    db.upsert_activity(&activity).await?;
    Ok(activity)
}

/// Map a domain event to a feed entry.
pub fn activity_from_event(event: &Event) -> Activity {
    let (resource_type, action) = event
        .event_type
        .split_once('.')
        .unwrap_or((event.event_type.as_str(), ""));

    let actor = [event.data_str("agent_id"), event.data_str("author_id")]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or(event.source.as_str());
    let resource_id = match resource_type {
        "agent" => event.data_str("agent_id"),
        "workflow" => event.data_str("execution_id"),
        "decision" => event.data_str("decision_id"),
        "comment" => event.data_str("comment_id"),
        _ => event.data_str("bead_id"),
    };

    let mut activity = Activity::new(event.event_type.clone(), actor);
    activity.project_id = event.project_id.clone();
    activity.resource_type = resource_type.to_string();
    activity.resource_id = resource_id.to_string();
    activity.action = action.to_string();
    if activity.project_id.is_empty() {
        activity.visibility = Visibility::Global;
    }
    // Status churn on one resource collapses into a single row.
    if event.event_type == types::BEAD_STATUS_CHANGE || event.event_type == types::AGENT_COMPLETED {
        activity.aggregation_key = Some(format!("{}:{}", event.event_type, resource_id));
    }
    activity
}

pub struct ActivityFeed {
    db: Arc<dyn Database>,
}

impl ActivityFeed {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn record(&self, activity: Activity) -> Result<Activity, DatabaseError> {
        record_activity(self.db.as_ref(), activity, Utc::now()).await
    }

    /// Newest first. `None` includes every project.
    pub async fn list(&self, project_id: Option<&str>, limit: usize) -> Result<Vec<Activity>, DatabaseError> {
        self.db.list_activity(project_id, limit).await
    }

    /// Mirror domain events into the feed until cancelled.
    pub async fn run(self: Arc<Self>, events: Arc<EventBus>, cancel: CancellationToken) {
        let mut subscription = events.subscribe(of_types(FEED_EVENTS));
        while let Some(event) = subscription.recv_until(&cancel).await {
            if let Err(e) = self.record(activity_from_event(&event)).await {
                tracing::warn!(event_type = %event.event_type, error = %e, "Failed to record activity");
            }
        }
        tracing::debug!("Activity feed stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn keyed(key: &str) -> Activity {
        let mut activity = Activity::new(types::BEAD_STATUS_CHANGE, "ralph");
        activity.project_id = "p1".to_string();
        activity.aggregation_key = Some(key.to_string());
        activity
    }

    #[tokio::test]
    async fn test_burst_is_aggregated() {
        let db = MemoryStore::new();
        let now = Utc::now();
        let first = record_activity(&db, keyed("k"), now).await.unwrap();
        let second = record_activity(&db, keyed("k"), now + chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.aggregation_count, 2);
        assert_eq!(db.list_activity(Some("p1"), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outside_window_inserts_new_row() {
        let db = MemoryStore::new();
        let now = Utc::now();
        record_activity(&db, keyed("k"), now).await.unwrap();
        let later = record_activity(&db, keyed("k"), now + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(later.aggregation_count, 1);
        record_activity(&db, Activity::new("bead.created", "u1"), now).await.unwrap();
        assert_eq!(db.list_activity(None, 10).await.unwrap().len(), 3);
    }

    #[test]
    fn test_activity_from_event() {
        let event = Event::new(types::BEAD_ASSIGNED, "dispatcher")
            .with_project("p1")
            .with_data(serde_json::json!({ "bead_id": "bd-1", "agent_id": "a1" }));
        let activity = activity_from_event(&event);
        assert_eq!(activity.resource_type, "bead");
        assert_eq!(activity.action, "assigned");
        assert_eq!(activity.resource_id, "bd-1");
        assert_eq!(activity.actor_id, "a1");
        assert!(activity.aggregation_key.is_none());
    }
}
