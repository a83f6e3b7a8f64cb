//! Supporting records: credentials, conversations, activity, notifications,
//! comments, lessons, project memory, and coordination tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An encrypted key pair owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub project_id: String,
    /// Key type, e.g. `ssh_ed25519`.
    #[serde(rename = "type")]
    pub credential_type: String,
    pub private_key_encrypted: Vec<u8>,
    pub public_key: String,
    /// Identifier of the encryption key used for `private_key_encrypted`.
    pub key_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// One message in a conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub token_count: i64,
}

/// Persisted conversation state for an agent session on a bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub bead_id: String,
    pub project_id: String,
    pub messages: Vec<ConversationMessage>,
    pub metadata: BTreeMap<String, String>,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(
        session_id: impl Into<String>,
        bead_id: impl Into<String>,
        project_id: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            bead_id: bead_id.into(),
            project_id: project_id.into(),
            messages: Vec::new(),
            metadata: BTreeMap::new(),
            token_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Append a message and keep the running token total.
    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>, tokens: i64) {
        self.messages.push(ConversationMessage {
            role: role.into(),
            content: content.into(),
            token_count: tokens,
        });
        self.token_count += tokens;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Project,
    Global,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Project => "project",
            Visibility::Global => "global",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Visibility::Project),
            "global" => Ok(Visibility::Global),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Immutable activity feed entry. Bursts sharing an `aggregation_key` are
/// collapsed into one row with a count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub project_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub action: String,
    pub aggregation_key: Option<String>,
    pub aggregation_count: i64,
    pub visibility: Visibility,
    pub metadata: BTreeMap<String, String>,
}

impl Activity {
    pub fn new(event_type: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            actor_id: actor_id.into(),
            project_id: String::new(),
            resource_type: String::new(),
            resource_id: String::new(),
            action: String::new(),
            aggregation_key: None,
            aggregation_count: 1,
            visibility: Visibility::Project,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Unread,
    Read,
    Archived,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Unread => "unread",
            NotificationStatus::Read => "read",
            NotificationStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(NotificationStatus::Unread),
            "read" => Ok(NotificationStatus::Read),
            "archived" => Ok(NotificationStatus::Archived),
            other => Err(format!("unknown notification status '{}'", other)),
        }
    }
}

/// Notification urgency, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }
}

impl std::str::FromStr for NotificationPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(NotificationPriority::Low),
            "normal" => Ok(NotificationPriority::Normal),
            "high" => Ok(NotificationPriority::High),
            "urgent" => Ok(NotificationPriority::Urgent),
            other => Err(format!("unknown notification priority '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub event_type: String,
    pub title: String,
    pub message: String,
    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestMode {
    Realtime,
    Hourly,
    Daily,
}

impl DigestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestMode::Realtime => "realtime",
            DigestMode::Hourly => "hourly",
            DigestMode::Daily => "daily",
        }
    }
}

impl std::str::FromStr for DigestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(DigestMode::Realtime),
            "hourly" => Ok(DigestMode::Hourly),
            "daily" => Ok(DigestMode::Daily),
            other => Err(format!("unknown digest mode '{}'", other)),
        }
    }
}

/// Per-user delivery preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: String,
    pub digest_mode: DigestMode,
    /// Quiet hours as UTC hours `[start, end)`; wraps past midnight when
    /// `start > end`.
    pub quiet_hours: Option<(u32, u32)>,
    pub min_priority: NotificationPriority,
    /// Subscribed event types; empty means all.
    pub subscribed_events: Vec<String>,
}

impl NotificationPreferences {
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            digest_mode: DigestMode::Realtime,
            quiet_hours: None,
            min_priority: NotificationPriority::Low,
            subscribed_events: Vec::new(),
        }
    }
}

/// A threaded annotation on a bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub bead_id: String,
    pub parent_id: Option<String>,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub edited: bool,
    /// Soft delete marker.
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub id: String,
    pub comment_id: String,
    pub mentioned_user_id: String,
    pub notified_at: Option<DateTime<Utc>>,
}

/// A piece of advice learned on a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub project_id: String,
    pub category: String,
    pub title: String,
    pub detail: String,
    pub source_bead_id: String,
    pub source_agent_id: String,
    pub relevance_score: f64,
    pub created_at: DateTime<Utc>,
    /// Little-endian packed `f32` vector.
    pub embedding: Option<Vec<u8>>,
}

impl Lesson {
    pub fn new(
        project_id: impl Into<String>,
        category: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            category: category.into(),
            title: title.into(),
            detail: detail.into(),
            source_bead_id: String::new(),
            source_agent_id: String::new(),
            relevance_score: 1.0,
            created_at: Utc::now(),
            embedding: None,
        }
    }
}

/// A structured fact about a project, unique per `(project, category, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub project_id: String,
    pub category: String,
    pub key: String,
    pub value: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
    pub source_bead: String,
}

/// A named lease held by one orchestrator instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryLock {
    pub lock_name: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// A running orchestrator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: String,
    pub metadata: BTreeMap<String, String>,
}
