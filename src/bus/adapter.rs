//! Maps high-level action verbs onto bus messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::message_bus::MessageBus;
use crate::bus::messages::{AgentMessage, MessagePriority, MessageType};
use crate::db::{AgentFilter, Database};
use crate::error::{DatabaseError, MessageBusError};
use crate::model::normalize_role;

/// Action verbs an agent can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerb {
    Question,
    Delegation,
    Notification,
}

impl ActionVerb {
    /// Message type, priority, and whether a response is expected.
    pub fn mapping(&self) -> (MessageType, MessagePriority, bool) {
        match self {
            ActionVerb::Question => (MessageType::AgentMessage, MessagePriority::Normal, true),
            ActionVerb::Delegation => (MessageType::Request, MessagePriority::High, true),
            ActionVerb::Notification => (MessageType::Notification, MessagePriority::Normal, false),
        }
    }
}

impl std::str::FromStr for ActionVerb {
    type Err = MessageBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(ActionVerb::Question),
            "delegation" => Ok(ActionVerb::Delegation),
            "notification" => Ok(ActionVerb::Notification),
            other => Err(MessageBusError::UnsupportedMessageType(other.to_string())),
        }
    }
}

/// Resolves role names to agent ids.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn find_agent_by_role(&self, role: &str) -> Result<Option<String>, DatabaseError>;
}

/// Registry backed by the agent table; idle agents are preferred.
pub struct DbAgentRegistry {
    db: Arc<dyn Database>,
    project_id: Option<String>,
}

impl DbAgentRegistry {
    pub fn new(db: Arc<dyn Database>, project_id: Option<String>) -> Self {
        Self { db, project_id }
    }
}

#[async_trait]
impl AgentRegistry for DbAgentRegistry {
    async fn find_agent_by_role(&self, role: &str) -> Result<Option<String>, DatabaseError> {
        let filter = AgentFilter {
            project_id: self.project_id.clone(),
            status: None,
        };
        let wanted = normalize_role(role);
        let agents = self.db.list_agents(&filter).await?;
        let mut matching: Vec<_> = agents
            .into_iter()
            .filter(|a| normalize_role(&a.role) == wanted)
            .collect();
        matching.sort_by_key(|a| !a.is_idle());
        Ok(matching.into_iter().next().map(|a| a.id))
    }
}

/// A verb-level action to deliver.
#[derive(Debug, Clone, Default)]
pub struct Action {
    pub verb: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub subject: String,
    pub body: String,
    pub payload: BTreeMap<String, serde_json::Value>,
}

/// Translates actions into bus messages.
pub struct ActionAdapter {
    bus: Arc<MessageBus>,
    registry: Option<Arc<dyn AgentRegistry>>,
}

impl ActionAdapter {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the message an action maps to, without sending it.
    ///
    /// String values of the payload are mirrored into the message context so
    /// routing keys such as `bead_id` are visible to filters and handlers.
    pub fn build(&self, action: &Action) -> Result<AgentMessage, MessageBusError> {
        let verb: ActionVerb = action.verb.parse()?;
        let (message_type, priority, requires_response) = verb.mapping();

        let mut msg = AgentMessage::new(message_type, action.from_agent_id.clone())
            .to(action.to_agent_id.clone())
            .with_subject(action.subject.clone())
            .with_priority(priority);
        msg.body = action.body.clone();
        msg.requires_response = requires_response;
        msg.payload = action.payload.clone();
        for (key, value) in &action.payload {
            if let Some(s) = value.as_str() {
                msg.context.insert(key.clone(), s.to_string());
            }
        }
        Ok(msg)
    }

    /// Map and send an action.
    pub fn send(&self, action: &Action) -> Result<AgentMessage, MessageBusError> {
        let msg = self.build(action)?;
        self.bus.send(msg)
    }

    /// Resolve a role to an agent id through the registry.
    pub async fn resolve_role(&self, role: &str) -> Result<String, MessageBusError> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| MessageBusError::NoRegistry(role.to_string()))?;
        match registry.find_agent_by_role(role).await {
            Ok(Some(agent_id)) => Ok(agent_id),
            Ok(None) => Err(MessageBusError::RoleNotFound(role.to_string())),
            Err(e) => {
                tracing::warn!(role, error = %e, "Role lookup failed");
                Err(MessageBusError::RoleNotFound(role.to_string()))
            }
        }
    }

    /// Send an action addressed to whichever agent holds `role`.
    pub async fn send_to_role(
        &self,
        mut action: Action,
        role: &str,
    ) -> Result<AgentMessage, MessageBusError> {
        action.to_agent_id = self.resolve_role(role).await?;
        self.send(&action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageBusConfig;
    use crate::db::MemoryStore;
    use crate::events::EventBus;
    use crate::model::Agent;

    fn adapter() -> (ActionAdapter, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(
            Arc::new(EventBus::new(64)),
            &MessageBusConfig::default(),
        ));
        (ActionAdapter::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_delegation_maps_to_high_priority_request() {
        let (adapter, bus) = adapter();
        let mut payload = BTreeMap::new();
        payload.insert("bead_id".to_string(), serde_json::json!("B"));

        let msg = adapter
            .send(&Action {
                verb: "delegation".into(),
                from_agent_id: "a1".into(),
                to_agent_id: "a2".into(),
                payload,
                ..Action::default()
            })
            .unwrap();

        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.priority, MessagePriority::High);
        assert!(msg.requires_response);
        assert_eq!(msg.context.get("bead_id").map(String::as_str), Some("B"));
        assert_eq!(msg.payload.get("bead_id"), Some(&serde_json::json!("B")));
        assert_eq!(bus.history("a1").len(), 1);
        assert_eq!(bus.history("a2").len(), 1);
    }

    #[tokio::test]
    async fn test_question_and_notification_mapping() {
        let (adapter, _bus) = adapter();
        let question = adapter
            .build(&Action {
                verb: "question".into(),
                from_agent_id: "a1".into(),
                to_agent_id: "a2".into(),
                ..Action::default()
            })
            .unwrap();
        assert_eq!(question.message_type, MessageType::AgentMessage);
        assert!(question.requires_response);

        let note = adapter
            .build(&Action {
                verb: "notification".into(),
                from_agent_id: "a1".into(),
                ..Action::default()
            })
            .unwrap();
        assert_eq!(note.message_type, MessageType::Notification);
        assert_eq!(note.priority, MessagePriority::Normal);
        assert!(!note.requires_response);
    }

    #[tokio::test]
    async fn test_unknown_verb_rejected() {
        let (adapter, _bus) = adapter();
        let err = adapter
            .send(&Action {
                verb: "gossip".into(),
                from_agent_id: "a1".into(),
                ..Action::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported message type: gossip");
    }

    #[tokio::test]
    async fn test_role_resolution_requires_registry() {
        let (adapter, _bus) = adapter();
        let err = adapter.resolve_role("cto").await.unwrap_err();
        assert!(matches!(err, MessageBusError::NoRegistry(_)));
    }

    #[tokio::test]
    async fn test_role_resolution_through_store() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let cto = Agent::new("boss", "CTO");
        db.upsert_agent(&cto).await.unwrap();

        let (adapter, _bus) = adapter();
        let adapter = adapter.with_registry(Arc::new(DbAgentRegistry::new(db, None)));
        assert_eq!(adapter.resolve_role("cto").await.unwrap(), cto.id);
        assert!(matches!(
            adapter.resolve_role("designer").await.unwrap_err(),
            MessageBusError::RoleNotFound(_)
        ));
    }
}
