//! Threaded comments on beads with `@username` mentions.

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;

use crate::db::{Database, WriteBatch, WriteOp};
use crate::error::{CommentError, DatabaseError};
use crate::events::{Event, EventBus, types};
use crate::model::{Comment, Mention};

const EVENT_SOURCE: &str = "comments";

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_.@])@([A-Za-z0-9_][A-Za-z0-9_-]*)").expect("valid mention regex")
});

/// Usernames mentioned in `content`, in order of first appearance.
pub fn parse_mentions(content: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for capture in MENTION_RE.captures_iter(content) {
        let name = capture[1].to_string();
        if !seen.iter().any(|s| s.eq_ignore_ascii_case(&name)) {
            seen.push(name);
        }
    }
    seen
}

fn map_not_found(comment_id: &str) -> impl FnOnce(DatabaseError) -> CommentError + '_ {
    move |e| {
        if e.is_not_found() {
            CommentError::NotFound(comment_id.to_string())
        } else {
            CommentError::Database(e)
        }
    }
}

pub struct CommentService {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
}

impl CommentService {
    pub fn new(db: Arc<dyn Database>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Add a comment to a bead. Mentions of known users get a mention row
    /// and a `mention.created` event; a failure there is logged only.
    pub async fn create(
        &self,
        bead_id: &str,
        author_id: &str,
        content: &str,
        parent_id: Option<&str>,
    ) -> Result<Comment, CommentError> {
        if content.trim().is_empty() {
            return Err(CommentError::Invalid("content is empty".to_string()));
        }
        if author_id.is_empty() {
            return Err(CommentError::Invalid("author is required".to_string()));
        }
        let bead = self.db.get_bead(bead_id).await?;
        if let Some(parent_id) = parent_id {
            let parent = self.db.get_comment(parent_id).await.map_err(map_not_found(parent_id))?;
            if parent.bead_id != bead.id {
                return Err(CommentError::Invalid(format!(
                    "parent comment {} belongs to another bead",
                    parent_id
                )));
            }
        }

        let now = Utc::now();
        let comment = Comment {
            id: uuid::Uuid::new_v4().to_string(),
            bead_id: bead.id.clone(),
            parent_id: parent_id.map(str::to_string),
            author_id: author_id.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
            edited: false,
            deleted: false,
        };
        self.db.upsert_comment(&comment).await?;

        let usernames = parse_mentions(content);
        self.events.publish(
            Event::new(types::COMMENT_CREATED, EVENT_SOURCE)
                .with_project(bead.project_id.clone())
                .with_data(serde_json::json!({
                    "comment_id": comment.id,
                    "bead_id": comment.bead_id,
                    "author_id": comment.author_id,
                    "mentions": usernames,
                })),
        );

        if !usernames.is_empty()
            && let Err(e) = self.record_mentions(&comment, &bead.project_id, &usernames).await
        {
            tracing::warn!(comment_id = %comment.id, error = %e, "Failed to process mentions");
        }
        Ok(comment)
    }

    async fn record_mentions(
        &self,
        comment: &Comment,
        project_id: &str,
        usernames: &[String],
    ) -> Result<(), DatabaseError> {
        let mut resolved = Vec::new();
        for username in usernames {
            match self.db.find_user_by_username(username).await? {
                Some(user) => resolved.push((username, user)),
                None => tracing::debug!(username = %username, "Mentioned user does not exist"),
            }
        }
        if resolved.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut batch = WriteBatch::new();
        let mut mentions = Vec::new();
        for (username, user) in resolved {
            let mention = Mention {
                id: uuid::Uuid::new_v4().to_string(),
                comment_id: comment.id.clone(),
                mentioned_user_id: user.id.clone(),
                notified_at: Some(now),
            };
            batch.push(WriteOp::InsertMention(mention.clone()));
            mentions.push((username, mention));
        }
        self.db.commit(batch).await?;

        for (username, mention) in mentions {
            self.events.publish(
                Event::new(types::MENTION_CREATED, EVENT_SOURCE)
                    .with_project(project_id.to_string())
                    .with_data(serde_json::json!({
                        "mention_id": mention.id,
                        "comment_id": comment.id,
                        "bead_id": comment.bead_id,
                        "author_id": comment.author_id,
                        "user_id": mention.mentioned_user_id,
                        "username": username,
                    })),
            );
        }
        Ok(())
    }

    async fn owned(&self, comment_id: &str, user_id: &str) -> Result<Comment, CommentError> {
        let comment = self
            .db
            .get_comment(comment_id)
            .await
            .map_err(map_not_found(comment_id))?;
        if comment.deleted {
            return Err(CommentError::NotFound(comment_id.to_string()));
        }
        if comment.author_id != user_id {
            return Err(CommentError::NotAuthor {
                comment_id: comment_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        Ok(comment)
    }

    pub async fn edit(&self, comment_id: &str, user_id: &str, content: &str) -> Result<Comment, CommentError> {
        if content.trim().is_empty() {
            return Err(CommentError::Invalid("content is empty".to_string()));
        }
        let mut comment = self.owned(comment_id, user_id).await?;
        comment.content = content.to_string();
        comment.edited = true;
        comment.updated_at = Utc::now();
        self.db.upsert_comment(&comment).await?;

        self.events.publish(
            Event::new(types::COMMENT_UPDATED, EVENT_SOURCE).with_data(serde_json::json!({
                "comment_id": comment.id,
                "bead_id": comment.bead_id,
                "author_id": comment.author_id,
            })),
        );
        Ok(comment)
    }

    /// Soft delete. Replies stay attached to the thread.
    pub async fn delete(&self, comment_id: &str, user_id: &str) -> Result<(), CommentError> {
        let mut comment = self.owned(comment_id, user_id).await?;
        comment.deleted = true;
        comment.updated_at = Utc::now();
        self.db.upsert_comment(&comment).await?;

        self.events.publish(
            Event::new(types::COMMENT_DELETED, EVENT_SOURCE).with_data(serde_json::json!({
                "comment_id": comment.id,
                "bead_id": comment.bead_id,
                "author_id": comment.author_id,
            })),
        );
        Ok(())
    }

    /// Live comments on a bead, oldest first.
    pub async fn list(&self, bead_id: &str) -> Result<Vec<Comment>, CommentError> {
        let comments = self.db.list_comments(bead_id).await?;
        Ok(comments.into_iter().filter(|c| !c.deleted).collect())
    }

    pub async fn mentions(&self, comment_id: &str) -> Result<Vec<Mention>, CommentError> {
        Ok(self.db.list_mentions(comment_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::events::of_types;
    use crate::model::{Bead, Priority, User};

    async fn setup() -> (Arc<dyn Database>, Arc<EventBus>, CommentService, Bead) {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let events = Arc::new(EventBus::new(64));
        let bead = Bead::new("p1", "Add search", Priority::P2);
        db.upsert_bead(&bead).await.unwrap();
        let service = CommentService::new(db.clone(), events.clone());
        (db, events, service, bead)
    }

    #[test]
    fn test_parse_mentions() {
        assert_eq!(parse_mentions("@alice please review"), vec!["alice"]);
        assert_eq!(
            parse_mentions("cc @bob, @carol_x and @Bob again"),
            vec!["bob", "carol_x"]
        );
        assert!(parse_mentions("mail me at dev@example.com").is_empty());
    }

    #[tokio::test]
    async fn test_mention_of_unknown_user_creates_no_row() {
        let (_db, events, service, bead) = setup().await;
        let mut sub = events.subscribe(of_types(&[types::MENTION_CREATED]));
        let comment = service.create(&bead.id, "u1", "@ghost hello", None).await.unwrap();
        assert!(service.mentions(&comment.id).await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_only_author_can_edit_or_delete() {
        let (db, _events, service, bead) = setup().await;
        db.upsert_user(&User::new("u1", "alice")).await.unwrap();
        let comment = service.create(&bead.id, "u1", "first", None).await.unwrap();

        let err = service.edit(&comment.id, "u2", "hijack").await.unwrap_err();
        assert!(matches!(err, CommentError::NotAuthor { .. }));

        let edited = service.edit(&comment.id, "u1", "second").await.unwrap();
        assert!(edited.edited);

        service.delete(&comment.id, "u1").await.unwrap();
        assert!(service.list(&bead.id).await.unwrap().is_empty());
        assert!(db.get_comment(&comment.id).await.unwrap().deleted);
        let err = service.delete(&comment.id, "u1").await.unwrap_err();
        assert!(matches!(err, CommentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reply_must_share_bead() {
        let (db, _events, service, bead) = setup().await;
        let other = Bead::new("p1", "Other", Priority::P2);
        db.upsert_bead(&other).await.unwrap();
        let root = service.create(&bead.id, "u1", "root", None).await.unwrap();

        let reply = service.create(&bead.id, "u2", "reply", Some(&root.id)).await.unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some(root.id.as_str()));
        let err = service.create(&other.id, "u2", "stray", Some(&root.id)).await.unwrap_err();
        assert!(matches!(err, CommentError::Invalid(_)));
    }
}
