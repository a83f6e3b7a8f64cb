//! In-process event bus.
//!
//! Each subscriber supplies a predicate and owns a bounded queue that only
//! matching events enter. A subscriber that falls behind loses its oldest
//! queued events without an error. Nothing is persisted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Well-known event types.
pub mod types {
    pub const AGENT_SPAWNED: &str = "agent.spawned";
    pub const AGENT_STATUS_CHANGE: &str = "agent.status_change";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const BEAD_CREATED: &str = "bead.created";
    pub const BEAD_ASSIGNED: &str = "bead.assigned";
    pub const BEAD_STATUS_CHANGE: &str = "bead.status_change";
    pub const BEAD_COMPLETED: &str = "bead.completed";
    pub const PROVIDER_REGISTERED: &str = "provider.registered";
    pub const PROVIDER_UPDATED: &str = "provider.updated";
    pub const PROVIDER_DELETED: &str = "provider.deleted";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_ESCALATED: &str = "workflow.escalated";
    pub const DECISION_CREATED: &str = "decision.created";
    pub const DECISION_RESOLVED: &str = "decision.resolved";
    pub const COMMENT_CREATED: &str = "comment.created";
    pub const COMMENT_UPDATED: &str = "comment.updated";
    pub const COMMENT_DELETED: &str = "comment.deleted";
    pub const MENTION_CREATED: &str = "mention.created";
    /// Prefix of message bus events; the message type follows.
    pub const AGENT_MESSAGE_PREFIX: &str = "agent.message.";
}

/// A domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Component that produced the event.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            project_id: String::new(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Read a string field of `data`, empty when absent.
    pub fn data_str(&self, key: &str) -> &str {
        self.data.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

/// Predicate deciding which events reach a subscriber.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Match every event.
pub fn all_events() -> EventFilter {
    Arc::new(|_| true)
}

/// Match events whose type is one of `event_types`.
pub fn of_types(event_types: &[&str]) -> EventFilter {
    let wanted: Vec<String> = event_types.iter().map(|t| t.to_string()).collect();
    Arc::new(move |e| wanted.iter().any(|t| t == &e.event_type))
}

/// Process-wide publish/subscribe hub.
pub struct EventBus {
    capacity: usize,
    state: Mutex<BusState>,
}

struct BusState {
    closed: bool,
    slots: Vec<Arc<Slot>>,
}

/// Per-subscriber bounded queue. Only events passing `filter` are queued.
struct Slot {
    filter: EventFilter,
    queue: Mutex<VecDeque<Arc<Event>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Slot {
    fn new(filter: EventFilter, closed: bool) -> Self {
        Self {
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(closed),
        }
    }

    fn push(&self, event: Arc<Event>, capacity: usize) {
        let mut queue = lock(&self.queue);
        if queue.len() >= capacity {
            queue.pop_front();
            tracing::debug!("Subscriber full, oldest event dropped");
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<Event>> {
        lock(&self.queue).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EventBus {
    /// Create a bus whose subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BusState {
                closed: false,
                slots: Vec::new(),
            }),
        }
    }

    /// Publish an event. Returns the number of subscribers it was handed to;
    /// publishing to a closed bus is a no-op.
    pub fn publish(&self, event: Event) -> usize {
        let mut state = lock(&self.state);
        if state.closed {
            tracing::debug!(event_type = %event.event_type, "Event bus closed, dropping event");
            return 0;
        }
        // A slot only the bus still references belongs to a dropped subscription.
        state.slots.retain(|slot| Arc::strong_count(slot) > 1);

        tracing::trace!(event_type = %event.event_type, id = %event.id, "Publishing event");
        let event = Arc::new(event);
        let mut delivered = 0;
        for slot in state.slots.iter().filter(|slot| (slot.filter)(event.as_ref())) {
            slot.push(event.clone(), self.capacity);
            delivered += 1;
        }
        delivered
    }

    /// Register a predicate; the returned subscription yields matching events.
    /// A subscription on a closed bus ends immediately.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let mut state = lock(&self.state);
        let slot = Arc::new(Slot::new(filter, state.closed));
        if !state.closed {
            state.slots.push(slot.clone());
        }
        Subscription { slot }
    }

    /// Close the bus. Subscribers drain what is buffered, then end.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        for slot in state.slots.drain(..) {
            slot.close();
        }
        tracing::debug!("Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A filtered view over the bus.
pub struct Subscription {
    slot: Arc<Slot>,
}

impl Subscription {
    /// Next matching event, or `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            if let Some(event) = self.slot.pop() {
                return Some(event);
            }
            if self.slot.is_closed() {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Like [`recv`](Self::recv) but ends early when `cancel` fires.
    pub async fn recv_until(&mut self, cancel: &CancellationToken) -> Option<Arc<Event>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            event = self.recv() => event,
        }
    }

    /// Non-blocking poll; `None` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.slot.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filter_forwards_only_matching() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(of_types(&[types::BEAD_ASSIGNED]));

        bus.publish(Event::new(types::AGENT_SPAWNED, "test"));
        bus.publish(Event::new(types::BEAD_ASSIGNED, "test").with_project("p1"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, types::BEAD_ASSIGNED);
        assert_eq!(event.project_id, "p1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(all_events());
        for i in 0..5 {
            bus.publish(Event::new("tick", "test").with_data(serde_json::json!({ "i": i })));
        }
        let first = sub.recv().await.unwrap();
        assert_eq!(first.data["i"], 3);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.data["i"], 4);
    }

    #[tokio::test]
    async fn test_unmatched_burst_keeps_matching_event() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(of_types(&[types::BEAD_ASSIGNED]));

        assert_eq!(bus.publish(Event::new(types::BEAD_ASSIGNED, "test")), 1);
        for _ in 0..3 {
            assert_eq!(bus.publish(Event::new(types::AGENT_SPAWNED, "test")), 0);
        }

        let event = sub.try_recv().unwrap();
        assert_eq!(event.event_type, types::BEAD_ASSIGNED);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe(all_events());
        assert_eq!(bus.publish(Event::new("tick", "test")), 1);
        drop(sub);
        assert_eq!(bus.publish(Event::new("tick", "test")), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::new(4));
        let mut sub = bus.subscribe(of_types(&[types::BEAD_CREATED]));
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(Event::new(types::BEAD_CREATED, "test"));
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, types::BEAD_CREATED);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(all_events());
        bus.publish(Event::new("last", "test"));
        bus.close();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.publish(Event::new("after", "test")), 0);
        assert!(bus.subscribe(all_events()).recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_until_cancelled() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe(all_events());
        let token = CancellationToken::new();
        token.cancel();
        assert!(sub.recv_until(&token).await.is_none());
    }
}
