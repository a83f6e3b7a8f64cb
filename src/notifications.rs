//! Per-user notifications derived from domain events.
//!
//! Delivery honors [`NotificationPreferences`]: the subscription list,
//! the minimum priority, and quiet hours (only urgent notifications get
//! through while quiet).

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::events::{Event, EventBus, of_types, types};
use crate::model::{Notification, NotificationPreferences, NotificationPriority, NotificationStatus};

/// Events that can produce notifications.
pub const NOTIFY_EVENTS: &[&str] = &[types::MENTION_CREATED, types::DECISION_CREATED, types::BEAD_ASSIGNED];

/// Whether `hour` (UTC) falls inside `[start, end)`, wrapping past midnight.
pub fn in_quiet_hours(quiet: Option<(u32, u32)>, hour: u32) -> bool {
    match quiet {
        Some((start, end)) if start < end => hour >= start && hour < end,
        Some((start, end)) if start > end => hour >= start || hour < end,
        _ => false,
    }
}

/// Decide whether a notification should be delivered under `prefs`.
pub fn should_deliver(
    prefs: &NotificationPreferences,
    event_type: &str,
    priority: NotificationPriority,
    now: DateTime<Utc>,
) -> bool {
    if !prefs.subscribed_events.is_empty() && !prefs.subscribed_events.iter().any(|e| e == event_type) {
        return false;
    }
    if priority < prefs.min_priority {
        return false;
    }
    priority == NotificationPriority::Urgent || !in_quiet_hours(prefs.quiet_hours, now.hour())
}

/// A notification waiting for a preference check.
#[derive(Debug, Clone)]
pub struct Draft {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub resource_id: String,
}

pub struct NotificationService {
    db: Arc<dyn Database>,
    /// Users told about every new decision.
    decision_recipients: Vec<String>,
}

impl NotificationService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            decision_recipients: Vec::new(),
        }
    }

    pub fn with_decision_recipients(mut self, user_ids: Vec<String>) -> Self {
        self.decision_recipients = user_ids;
        self
    }

    /// Drafts for an event, before preferences are applied.
    async fn drafts_for(&self, event: &Event) -> Result<Vec<Draft>, DatabaseError> {
        let drafts = match event.event_type.as_str() {
            types::MENTION_CREATED => vec![Draft {
                user_id: event.data_str("user_id").to_string(),
                title: "You were mentioned".to_string(),
                message: format!(
                    "{} mentioned you on {}",
                    event.data_str("author_id"),
                    event.data_str("bead_id")
                ),
                priority: NotificationPriority::High,
                resource_id: event.data_str("comment_id").to_string(),
            }],
            types::DECISION_CREATED => self
                .decision_recipients
                .iter()
                .map(|user_id| Draft {
                    user_id: user_id.clone(),
                    title: "Decision required".to_string(),
                    message: event.data_str("title").to_string(),
                    priority: NotificationPriority::Urgent,
                    resource_id: event.data_str("decision_id").to_string(),
                })
                .collect(),
            // Only assignments to a human user are worth a notification.
            types::BEAD_ASSIGNED => {
                let assignee = event.data_str("agent_id");
                match self.db.get_user(assignee).await {
                    Ok(user) => vec![Draft {
                        user_id: user.id,
                        title: "Bead assigned to you".to_string(),
                        message: event.data_str("title").to_string(),
                        priority: NotificationPriority::Normal,
                        resource_id: event.data_str("bead_id").to_string(),
                    }],
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            _ => Vec::new(),
        };
        Ok(drafts.into_iter().filter(|d| !d.user_id.is_empty()).collect())
    }

    /// Store `draft` for `event_type` unless the user's preferences filter it.
    pub async fn notify(
        &self,
        event_type: &str,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, DatabaseError> {
        let prefs = self
            .db
            .get_preferences(&draft.user_id)
            .await?
            .unwrap_or_else(|| NotificationPreferences::defaults_for(&draft.user_id));
        if !should_deliver(&prefs, event_type, draft.priority, now) {
            tracing::debug!(user_id = %draft.user_id, event_type, "Notification suppressed by preferences");
            return Ok(None);
        }

        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: draft.user_id,
            event_type: event_type.to_string(),
            title: draft.title,
            message: draft.message,
            status: NotificationStatus::Unread,
            priority: draft.priority,
            resource_id: draft.resource_id,
            created_at: now,
            read_at: None,
            archived_at: None,
        };
        self.db.upsert_notification(&notification).await?;
        Ok(Some(notification))
    }

    /// Turn one event into stored notifications.
    pub async fn handle_event(&self, event: &Event, now: DateTime<Utc>) -> Result<Vec<Notification>, DatabaseError> {
        let mut delivered = Vec::new();
        for draft in self.drafts_for(event).await? {
            if let Some(notification) = self.notify(&event.event_type, draft, now).await? {
                delivered.push(notification);
            }
        }
        Ok(delivered)
    }

    async fn owned(&self, id: &str, user_id: &str) -> Result<Notification, DatabaseError> {
        let notification = self.db.get_notification(id).await?;
        if notification.user_id != user_id {
            return Err(DatabaseError::not_found("notification", "notification", id));
        }
        Ok(notification)
    }

    pub async fn mark_read(&self, id: &str, user_id: &str) -> Result<Notification, DatabaseError> {
        let mut notification = self.owned(id, user_id).await?;
        if notification.status == NotificationStatus::Unread {
            notification.status = NotificationStatus::Read;
            notification.read_at = Some(Utc::now());
            self.db.upsert_notification(&notification).await?;
        }
        Ok(notification)
    }

    pub async fn archive(&self, id: &str, user_id: &str) -> Result<Notification, DatabaseError> {
        let mut notification = self.owned(id, user_id).await?;
        let now = Utc::now();
        notification.read_at.get_or_insert(now);
        notification.status = NotificationStatus::Archived;
        notification.archived_at = Some(now);
        self.db.upsert_notification(&notification).await?;
        Ok(notification)
    }

    /// Unread notifications, newest first.
    pub async fn list_unread(&self, user_id: &str) -> Result<Vec<Notification>, DatabaseError> {
        self.db
            .list_notifications(user_id, Some(NotificationStatus::Unread))
            .await
    }

    /// Listen for notifying events until cancelled.
    pub async fn run(self: Arc<Self>, events: Arc<EventBus>, cancel: CancellationToken) {
        let mut subscription = events.subscribe(of_types(NOTIFY_EVENTS));
        tracing::info!("Notification listener started");
        while let Some(event) = subscription.recv_until(&cancel).await {
            match self.handle_event(&event, Utc::now()).await {
                Ok(delivered) if !delivered.is_empty() => {
                    tracing::debug!(event_type = %event.event_type, count = delivered.len(), "Notifications delivered");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(event_type = %event.event_type, error = %e, "Failed to deliver notifications");
                }
            }
        }
        tracing::info!("Notification listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::MemoryStore;
    use crate::model::User;

    fn mention_event(user_id: &str) -> Event {
        Event::new(types::MENTION_CREATED, "comments").with_data(serde_json::json!({
            "user_id": user_id,
            "author_id": "bob",
            "bead_id": "bd-1",
            "comment_id": "c1",
        }))
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        assert!(in_quiet_hours(Some((22, 7)), 23));
        assert!(in_quiet_hours(Some((22, 7)), 3));
        assert!(!in_quiet_hours(Some((22, 7)), 7));
        assert!(in_quiet_hours(Some((1, 5)), 1));
        assert!(!in_quiet_hours(Some((1, 5)), 5));
        assert!(!in_quiet_hours(None, 3));
    }

    #[test]
    fn test_preferences_filter() {
        let mut prefs = NotificationPreferences::defaults_for("u1");
        let noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(should_deliver(&prefs, "mention.created", NotificationPriority::Low, noon));

        prefs.min_priority = NotificationPriority::High;
        assert!(!should_deliver(&prefs, "mention.created", NotificationPriority::Normal, noon));

        prefs.quiet_hours = Some((10, 14));
        assert!(!should_deliver(&prefs, "mention.created", NotificationPriority::High, noon));
        assert!(should_deliver(&prefs, "mention.created", NotificationPriority::Urgent, noon));

        prefs.subscribed_events = vec!["decision.created".to_string()];
        assert!(!should_deliver(&prefs, "mention.created", NotificationPriority::Urgent, noon));
    }

    #[tokio::test]
    async fn test_mention_read_and_archive() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let service = NotificationService::new(db.clone());
        let delivered = service.handle_event(&mention_event("u1"), Utc::now()).await.unwrap();
        assert_eq!(delivered.len(), 1);
        let id = delivered[0].id.clone();
        assert_eq!(service.list_unread("u1").await.unwrap().len(), 1);

        assert!(service.mark_read(&id, "u2").await.unwrap_err().is_not_found());
        let read = service.mark_read(&id, "u1").await.unwrap();
        assert_eq!(read.status, NotificationStatus::Read);
        assert!(service.list_unread("u1").await.unwrap().is_empty());

        let archived = service.archive(&id, "u1").await.unwrap();
        assert_eq!(archived.status, NotificationStatus::Archived);
        assert!(archived.archived_at.is_some());
    }

    #[tokio::test]
    async fn test_assignment_only_notifies_users() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        db.upsert_user(&User::new("u1", "alice")).await.unwrap();
        let service = NotificationService::new(db.clone());

        let to_agent = Event::new(types::BEAD_ASSIGNED, "dispatcher")
            .with_data(serde_json::json!({ "bead_id": "bd-1", "agent_id": "agent-1", "title": "x" }));
        assert!(service.handle_event(&to_agent, Utc::now()).await.unwrap().is_empty());

        let to_user = Event::new(types::BEAD_ASSIGNED, "dispatcher")
            .with_data(serde_json::json!({ "bead_id": "bd-1", "agent_id": "u1", "title": "x" }));
        assert_eq!(service.handle_event(&to_user, Utc::now()).await.unwrap().len(), 1);
    }
}
