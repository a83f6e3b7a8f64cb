//! Message bus over the event bus.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::bus::messages::{AgentMessage, MessageFilter, MessageStatus, MessageType};
use crate::config::MessageBusConfig;
use crate::error::MessageBusError;
use crate::events::{Event, EventBus, EventFilter, Subscription, types};

/// Agent-to-agent messaging with bounded per-agent history.
pub struct MessageBus {
    events: Arc<EventBus>,
    history: Mutex<HashMap<String, VecDeque<AgentMessage>>>,
    history_cap: usize,
}

impl MessageBus {
    pub fn new(events: Arc<EventBus>, config: &MessageBusConfig) -> Self {
        Self {
            events,
            history: Mutex::new(HashMap::new()),
            history_cap: config.history_cap.max(1),
        }
    }

    /// Validate, stamp, record, and publish a message.
    pub fn send(&self, mut msg: AgentMessage) -> Result<AgentMessage, MessageBusError> {
        if self.events.is_closed() {
            return Err(MessageBusError::Closed);
        }
        validate(&msg)?;

        if msg.message_id.is_empty() {
            msg.message_id = uuid::Uuid::new_v4().to_string();
        }
        if msg.timestamp.is_none() {
            msg.timestamp = Some(Utc::now());
        }
        msg.status = MessageStatus::Sent;

        self.record(&msg);

        let data = serde_json::to_value(&msg)
            .map_err(|e| MessageBusError::InvalidMessage(e.to_string()))?;
        let delivered = self.events.publish(
            Event::new(msg.message_type.event_type(), "message_bus")
                .with_project(msg.context.get("project_id").cloned().unwrap_or_default())
                .with_data(data),
        );

        tracing::debug!(
            message_id = %msg.message_id,
            message_type = %msg.message_type,
            from = %msg.from_agent_id,
            subscribers = delivered,
            "Message sent"
        );
        Ok(msg)
    }

    /// Subscribe on behalf of an agent.
    pub fn subscribe(&self, filter: MessageFilter) -> MessageSubscription {
        let inner = self.events.subscribe(message_events());
        MessageSubscription { inner, filter }
    }

    /// Send a request and wait for the first correlated response from the
    /// addressee.
    pub async fn send_and_wait(
        &self,
        mut request: AgentMessage,
        timeout: Duration,
    ) -> Result<AgentMessage, MessageBusError> {
        if request.message_type != MessageType::Request {
            return Err(MessageBusError::InvalidMessage(format!(
                "send_and_wait requires a request, got {}",
                request.message_type
            )));
        }
        if request.to_agent_id.is_empty() {
            return Err(MessageBusError::InvalidMessage(
                "request requires to_agent_id".to_string(),
            ));
        }
        if request.message_id.is_empty() {
            request.message_id = uuid::Uuid::new_v4().to_string();
        }
        request.requires_response = true;

        // Subscribe before sending so a fast responder cannot be missed.
        let mut responses = self.subscribe(MessageFilter {
            message_types: vec![MessageType::Response],
            from_agent_ids: vec![request.to_agent_id.clone()],
            ..MessageFilter::default()
        });
        let request = self.send(request)?;

        let wait = async {
            while let Some(msg) = responses.recv().await {
                if msg.in_reply_to == request.message_id {
                    return Some(msg);
                }
            }
            None
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(MessageBusError::Closed),
            Err(_) => Err(MessageBusError::Timeout(timeout)),
        }
    }

    /// Snapshot of an agent's history, oldest first.
    pub fn history(&self, agent_id: &str) -> Vec<AgentMessage> {
        let history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history
            .get(agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_history(&self, agent_id: &str) {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.remove(agent_id);
    }

    /// Close the underlying event bus, ending every subscription.
    pub fn close(&self) {
        self.events.close();
    }

    fn record(&self, msg: &AgentMessage) {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut owners = vec![msg.from_agent_id.as_str()];
        for r in msg.recipients() {
            if !owners.contains(&r) {
                owners.push(r);
            }
        }
        for owner in owners {
            let entries = history.entry(owner.to_string()).or_default();
            entries.push_back(msg.clone());
            while entries.len() > self.history_cap {
                entries.pop_front();
            }
        }
    }
}

fn validate(msg: &AgentMessage) -> Result<(), MessageBusError> {
    if msg.from_agent_id.is_empty() {
        return Err(MessageBusError::InvalidMessage(
            "from_agent_id is required".to_string(),
        ));
    }
    match msg.message_type {
        MessageType::AgentMessage if msg.to_agent_id.is_empty() => Err(
            MessageBusError::InvalidMessage("agent_message requires to_agent_id".to_string()),
        ),
        MessageType::ConsensusRequest if msg.to_agent_ids.is_empty() => {
            Err(MessageBusError::InvalidMessage(
                "consensus_request requires to_agent_ids".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

fn message_events() -> EventFilter {
    Arc::new(|e: &Event| e.event_type.starts_with(types::AGENT_MESSAGE_PREFIX))
}

/// Filtered stream of messages.
pub struct MessageSubscription {
    inner: Subscription,
    filter: MessageFilter,
}

impl MessageSubscription {
    /// Next matching message, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        while let Some(event) = self.inner.recv().await {
            match serde_json::from_value::<AgentMessage>(event.data.clone()) {
                Ok(msg) if self.filter.matches(&msg) => return Some(msg),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "Undecodable message event");
                }
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        while let Some(event) = self.inner.try_recv() {
            if let Ok(msg) = serde_json::from_value::<AgentMessage>(event.data.clone())
                && self.filter.matches(&msg)
            {
                return Some(msg);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::messages::MessagePriority;

    fn bus_with_cap(cap: usize) -> MessageBus {
        MessageBus::new(
            Arc::new(EventBus::new(64)),
            &MessageBusConfig {
                history_cap: cap,
                ..MessageBusConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_send_fills_defaults_and_history() {
        let bus = bus_with_cap(1000);
        let sent = bus.send(AgentMessage::direct("a1", "a2", "hello")).unwrap();

        assert!(!sent.message_id.is_empty());
        assert!(sent.timestamp.is_some());
        assert_eq!(sent.priority, MessagePriority::Normal);
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(bus.history("a1")[0].message_id, sent.message_id);
        assert_eq!(bus.history("a2")[0].message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let bus = bus_with_cap(10);
        let err = bus.send(AgentMessage::new(MessageType::Broadcast, "")).unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidMessage(_)));

        let err = bus.send(AgentMessage::new(MessageType::AgentMessage, "a1")).unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidMessage(_)));

        let err = bus
            .send(AgentMessage::new(MessageType::ConsensusRequest, "a1"))
            .unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_history_is_bounded_fifo() {
        let bus = bus_with_cap(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let sent = bus.send(AgentMessage::direct("a1", "a2", format!("m{i}"))).unwrap();
            ids.push(sent.message_id);
        }
        let history: Vec<String> = bus.history("a2").into_iter().map(|m| m.message_id).collect();
        assert_eq!(history, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn test_subscription_respects_filter_and_order() {
        let bus = bus_with_cap(10);
        let mut sub = bus.subscribe(MessageFilter::for_agent("a2"));

        bus.send(AgentMessage::direct("a1", "a3", "not for a2")).unwrap();
        bus.send(AgentMessage::direct("a1", "a2", "first")).unwrap();
        bus.send(AgentMessage::direct("a1", "a2", "second")).unwrap();

        assert_eq!(sub.recv().await.unwrap().body, "first");
        assert_eq!(sub.recv().await.unwrap().body, "second");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_send_and_wait_returns_correlated_response() {
        let bus = Arc::new(bus_with_cap(10));
        let mut inbox = bus.subscribe(
            MessageFilter::for_agent("a2").with_types(&[MessageType::Request]),
        );

        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let request = inbox.recv().await.unwrap();
                // A response from someone else must be ignored.
                let mut stray = AgentMessage::reply_to(&request, "stray");
                stray.from_agent_id = "a9".into();
                bus.send(stray).unwrap();
                bus.send(AgentMessage::reply_to(&request, "done")).unwrap();
            })
        };

        let request = AgentMessage::new(MessageType::Request, "a1").to("a2");
        let response = bus
            .send_and_wait(request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.body, "done");
        assert_eq!(response.from_agent_id, "a2");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let bus = bus_with_cap(10);
        let request = AgentMessage::new(MessageType::Request, "a1").to("a2");
        let err = bus
            .send_and_wait(request, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MessageBusError::Timeout(_)));

        let not_request = AgentMessage::direct("a1", "a2", "hi");
        let err = bus
            .send_and_wait(not_request, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MessageBusError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_close_rejects_sends() {
        let bus = bus_with_cap(10);
        bus.close();
        let err = bus.send(AgentMessage::direct("a1", "a2", "late")).unwrap_err();
        assert!(matches!(err, MessageBusError::Closed));
    }
}
