//! Agent message types and subscription filters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Direct 1:1 message; requires `to_agent_id`.
    AgentMessage,
    Broadcast,
    Request,
    /// Correlated to a request through `in_reply_to`.
    Response,
    Notification,
    /// 1:N with enumerated `to_agent_ids`.
    ConsensusRequest,
    ConsensusVote,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AgentMessage => "agent_message",
            MessageType::Broadcast => "broadcast",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::ConsensusRequest => "consensus_request",
            MessageType::ConsensusVote => "consensus_vote",
        }
    }

    /// Event type used when publishing on the event bus.
    pub fn event_type(&self) -> String {
        format!("{}{}", crate::events::types::AGENT_MESSAGE_PREFIX, self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_message" => Ok(MessageType::AgentMessage),
            "broadcast" => Ok(MessageType::Broadcast),
            "request" => Ok(MessageType::Request),
            "response" => Ok(MessageType::Response),
            "notification" => Ok(MessageType::Notification),
            "consensus_request" => Ok(MessageType::ConsensusRequest),
            "consensus_vote" => Ok(MessageType::ConsensusVote),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message priority; the derived ordering ranks `Low` lowest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn rank(&self) -> u8 {
        match self {
            MessagePriority::Low => 0,
            MessagePriority::Normal => 1,
            MessagePriority::High => 2,
            MessagePriority::Urgent => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
    Failed,
}

/// A typed message between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Assigned on send when empty.
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from_agent_id: String,
    #[serde(default)]
    pub to_agent_id: String,
    #[serde(default)]
    pub to_agent_ids: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub in_reply_to: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl AgentMessage {
    pub fn new(message_type: MessageType, from_agent_id: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            message_type,
            from_agent_id: from_agent_id.into(),
            to_agent_id: String::new(),
            to_agent_ids: Vec::new(),
            subject: String::new(),
            body: String::new(),
            payload: BTreeMap::new(),
            context: BTreeMap::new(),
            priority: MessagePriority::Normal,
            requires_response: false,
            in_reply_to: String::new(),
            timestamp: None,
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
        }
    }

    /// Direct message to one agent.
    pub fn direct(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::AgentMessage, from);
        msg.to_agent_id = to.into();
        msg.body = body.into();
        msg
    }

    /// Response correlated to `request`, addressed back to its sender.
    pub fn reply_to(request: &AgentMessage, body: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Response, request.to_agent_id.clone());
        msg.to_agent_id = request.from_agent_id.clone();
        msg.in_reply_to = request.message_id.clone();
        msg.subject = request.subject.clone();
        msg.body = body.into();
        msg
    }

    pub fn to(mut self, to_agent_id: impl Into<String>) -> Self {
        self.to_agent_id = to_agent_id.into();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Every agent this message is addressed to, without duplicates.
    pub fn recipients(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if !self.to_agent_id.is_empty() {
            out.push(&self.to_agent_id);
        }
        for id in &self.to_agent_ids {
            if !id.is_empty() && !out.contains(&id.as_str()) {
                out.push(id);
            }
        }
        out
    }

    /// True when `agent_id` should receive this message.
    pub fn is_addressed_to(&self, agent_id: &str) -> bool {
        self.message_type == MessageType::Broadcast
            || self.to_agent_id == agent_id
            || self.to_agent_ids.iter().any(|id| id == agent_id)
    }
}

/// Conjunctive message filter. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub message_types: Vec<MessageType>,
    pub from_agent_ids: Vec<String>,
    pub to_agent_id: Option<String>,
    pub min_priority: Option<MessagePriority>,
}

impl MessageFilter {
    /// Messages addressed to `agent_id`, including broadcasts.
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            to_agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: &[MessageType]) -> Self {
        self.message_types = types.to_vec();
        self
    }

    pub fn with_min_priority(mut self, priority: MessagePriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn matches(&self, msg: &AgentMessage) -> bool {
        if !self.message_types.is_empty() && !self.message_types.contains(&msg.message_type) {
            return false;
        }
        if !self.from_agent_ids.is_empty() && !self.from_agent_ids.contains(&msg.from_agent_id) {
            return false;
        }
        if let Some(to) = &self.to_agent_id
            && !msg.is_addressed_to(to)
        {
            return false;
        }
        if let Some(min) = self.min_priority
            && msg.priority.rank() < min.rank()
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_all() {
        let msg = AgentMessage::direct("a1", "a2", "hi");
        assert!(MessageFilter::default().matches(&msg));
    }

    #[test]
    fn test_to_agent_filter_accepts_lists_and_broadcasts() {
        let filter = MessageFilter::for_agent("a3");

        assert!(!filter.matches(&AgentMessage::direct("a1", "a2", "hi")));

        let mut consensus = AgentMessage::new(MessageType::ConsensusRequest, "a1");
        consensus.to_agent_ids = vec!["a2".into(), "a3".into()];
        assert!(filter.matches(&consensus));

        let broadcast = AgentMessage::new(MessageType::Broadcast, "a1");
        assert!(filter.matches(&broadcast));
    }

    #[test]
    fn test_filter_fields_compose() {
        let filter = MessageFilter {
            message_types: vec![MessageType::Request],
            from_agent_ids: vec!["a1".into()],
            to_agent_id: None,
            min_priority: Some(MessagePriority::High),
        };
        let mut msg = AgentMessage::new(MessageType::Request, "a1").to("a2");
        assert!(!filter.matches(&msg));
        msg.priority = MessagePriority::Urgent;
        assert!(filter.matches(&msg));
        msg.from_agent_id = "a9".into();
        assert!(!filter.matches(&msg));
    }

    #[test]
    fn test_priority_rank_is_monotonic() {
        let ranks: Vec<u8> = [
            MessagePriority::Low,
            MessagePriority::Normal,
            MessagePriority::High,
            MessagePriority::Urgent,
        ]
        .iter()
        .map(|p| p.rank())
        .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_event_type_naming() {
        assert_eq!(MessageType::ConsensusVote.event_type(), "agent.message.consensus_vote");
    }
}
