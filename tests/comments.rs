//! Comments, mentions, and the notifications and activity they feed.

use std::sync::Arc;

use chrono::Utc;

use beadwork::activity::{ActivityFeed, activity_from_event};
use beadwork::comments::CommentService;
use beadwork::db::{Database, MemoryStore};
use beadwork::events::{EventBus, of_types, types};
use beadwork::model::{Bead, NotificationPriority, Priority, User};
use beadwork::notifications::NotificationService;

async fn setup() -> (Arc<dyn Database>, Arc<EventBus>, CommentService, Bead) {
    let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
    let events = Arc::new(EventBus::new(64));
    let bead = Bead::new("p1", "Add search", Priority::P1);
    db.upsert_bead(&bead).await.unwrap();
    let service = CommentService::new(db.clone(), events.clone());
    (db, events, service, bead)
}

#[tokio::test]
async fn test_mention_of_known_user() {
    let (db, events, service, bead) = setup().await;
    let alice = User::new("u-alice", "alice");
    db.upsert_user(&alice).await.unwrap();
    let mut created = events.subscribe(of_types(&[types::COMMENT_CREATED]));
    let mut mentioned = events.subscribe(of_types(&[types::MENTION_CREATED]));

    let comment = service
        .create(&bead.id, "bob", "@alice please review", None)
        .await
        .unwrap();

    assert_eq!(db.list_comments(&bead.id).await.unwrap().len(), 1);
    let mentions = db.list_mentions(&comment.id).await.unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].mentioned_user_id, alice.id);

    let event = created.try_recv().unwrap();
    assert_eq!(event.data["mentions"], serde_json::json!(["alice"]));
    let mention = mentioned.try_recv().unwrap();
    assert_eq!(mention.data_str("user_id"), alice.id);
    assert!(mentioned.try_recv().is_none());

    // The mention turns into a high-priority notification for alice.
    let notifications = NotificationService::new(db.clone());
    let delivered = notifications.handle_event(&mention, Utc::now()).await.unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].user_id, alice.id);
    assert_eq!(delivered[0].priority, NotificationPriority::High);
    assert_eq!(notifications.list_unread(&alice.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mention_of_unknown_user() {
    let (db, events, service, bead) = setup().await;
    let mut created = events.subscribe(of_types(&[types::COMMENT_CREATED]));
    let mut mentioned = events.subscribe(of_types(&[types::MENTION_CREATED]));

    let comment = service
        .create(&bead.id, "bob", "@alice please review", None)
        .await
        .unwrap();

    assert_eq!(db.list_comments(&bead.id).await.unwrap().len(), 1);
    assert!(db.list_mentions(&comment.id).await.unwrap().is_empty());
    assert!(created.try_recv().is_some());
    assert!(mentioned.try_recv().is_none());
}

#[tokio::test]
async fn test_comment_activity_is_recorded() {
    let (db, events, service, bead) = setup().await;
    let mut created = events.subscribe(of_types(&[types::COMMENT_CREATED]));
    service.create(&bead.id, "bob", "looks good", None).await.unwrap();

    let feed = ActivityFeed::new(db.clone());
    let event = created.try_recv().unwrap();
    let activity = feed.record(activity_from_event(&event)).await.unwrap();
    assert_eq!(activity.actor_id, "bob");
    assert_eq!(activity.resource_type, "comment");
    assert_eq!(activity.action, "created");

    let listed = feed.list(Some("p1"), 10).await.unwrap();
    assert_eq!(listed.len(), 1);
}
