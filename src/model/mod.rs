//! Domain records persisted by the durable store.

mod agent;
mod bead;
mod project;
mod provider;
mod records;

pub use agent::{Agent, AgentStatus, normalize_role};
pub use bead::{Bead, BeadStatus, Priority, ctx, new_bead_id};
pub use project::{GitStrategy, Project, ProjectStatus, User};
pub use provider::{ProtocolKind, Provider, ProviderStatus};
pub use records::{
    Activity, AdvisoryLock, Comment, ConversationContext, ConversationMessage, Credential,
    DigestMode, Instance, Lesson, Mention, MemoryEntry, Notification, NotificationPreferences,
    NotificationPriority, NotificationStatus, Visibility,
};
