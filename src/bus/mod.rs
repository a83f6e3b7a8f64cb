//! Agent message bus.
//!
//! Typed agent-to-agent messages ride on the [`EventBus`](crate::events::EventBus)
//! under `agent.message.<type>` event types. The bus keeps a bounded history
//! per agent, correlates requests with responses, and fans consensus
//! requests out to enumerated recipients. [`ActionAdapter`] maps the verbs
//! agents emit (question, delegation, notification) onto messages.

mod adapter;
mod message_bus;
mod messages;

pub use adapter::{Action, ActionAdapter, ActionVerb, AgentRegistry, DbAgentRegistry};
pub use message_bus::{MessageBus, MessageSubscription};
pub use messages::{AgentMessage, MessageFilter, MessagePriority, MessageStatus, MessageType};
