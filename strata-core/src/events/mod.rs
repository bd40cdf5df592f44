//! Change-notification bus.
//!
//! Every durable write publishes an [`Event`]. Lifecycle tasks subscribe and
//! wake up on changes to the stack they are driving instead of sleeping for a
//! full poll interval; the interval remains only as a ceiling because
//! notifications are best effort (a lagged subscriber drops events).
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe(vec!["stack.*".to_string()]);
//!
//! bus.publish(Event::new(EventType::StackUpdated, "demo", "k3x9q").with_revision(4));
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{} {}", event.event_type, event.resource_id);
//! }
//! ```

use chrono::Utc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of events buffered in the broadcast channel.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Event types for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    StackUpdated,
    StackDeleted,
    AccountUpdated,
    AccountDeleted,
    ServiceRegistered,
    ServiceRemoved,
}

impl EventType {
    /// Get the event type string (e.g., "stack.updated").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StackUpdated => "stack.updated",
            EventType::StackDeleted => "stack.deleted",
            EventType::AccountUpdated => "account.updated",
            EventType::AccountDeleted => "account.deleted",
            EventType::ServiceRegistered => "service.registered",
            EventType::ServiceRemoved => "service.removed",
        }
    }
}

/// A change to durable state.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Event type string (e.g., "stack.updated")
    pub event_type: String,
    /// Owning account namespace (empty for system catalog changes)
    pub account: String,
    /// Stack id, service key or account namespace
    pub resource_id: String,
    /// Stack revision after the write, when applicable
    pub revision: Option<u64>,
}

impl Event {
    pub fn new(event_type: EventType, account: &str, resource_id: &str) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            event_type: event_type.as_str().to_string(),
            account: account.to_string(),
            resource_id: resource_id.to_string(),
            revision: None,
        }
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = Some(revision);
        self
    }

    /// True when this event concerns the given stack.
    pub fn is_stack(&self, account: &str, stack_id: &str) -> bool {
        self.event_type.starts_with("stack.")
            && self.account == account
            && self.resource_id == stack_id
    }
}

/// Event bus for publishing and subscribing to state changes.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Event) {
        debug!(event_type = %event.event_type, resource_id = %event.resource_id, "Publishing event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events, optionally filtered by event type patterns.
    ///
    /// - `"stack.*"` - all stack events
    /// - `"account.deleted"` - only account deletions
    /// - empty list - all events
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe(), filters }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event subscriber with optional filtering.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
    filters: Vec<String>,
}

impl EventSubscriber {
    /// Receive the next matching event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    /// Wait until the given stack changes or `ceiling` elapses.
    ///
    /// Returns true when woken by a change. A lagged receiver also counts as a
    /// change since the dropped events may have concerned this stack.
    pub async fn wait_for_stack(&mut self, account: &str, stack_id: &str, ceiling: Duration) -> bool {
        let wait = async {
            loop {
                match self.receiver.recv().await {
                    Ok(event) if event.is_stack(account, stack_id) => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => return true,
                    Err(broadcast::error::RecvError::Closed) => {
                        // Nothing will ever arrive; fall back to the ceiling.
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::time::timeout(ceiling, wait).await.unwrap_or(false)
    }

    fn matches(&self, event: &Event) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        self.filters.iter().any(|filter| {
            filter == &event.event_type
                || filter
                    .strip_suffix(".*")
                    .map_or(false, |prefix| event.event_type.starts_with(prefix))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec![]);

        bus.publish(Event::new(EventType::StackUpdated, "demo", "k3x9q").with_revision(2));

        let event = tokio::time::timeout(Duration::from_millis(100), subscriber.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.event_type, "stack.updated");
        assert_eq!(event.revision, Some(2));
        assert!(event.is_stack("demo", "k3x9q"));
    }

    #[tokio::test]
    async fn test_filter_match() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec!["stack.*".to_string()]);

        bus.publish(Event::new(EventType::AccountUpdated, "demo", "demo"));
        bus.publish(Event::new(EventType::StackDeleted, "demo", "k3x9q"));

        let event = tokio::time::timeout(Duration::from_millis(100), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "stack.deleted");
    }

    #[tokio::test]
    async fn test_wait_for_stack_ignores_other_stacks() {
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe(vec![]);

        bus.publish(Event::new(EventType::StackUpdated, "demo", "other"));
        let woke = subscriber.wait_for_stack("demo", "k3x9q", Duration::from_millis(50)).await;
        assert!(!woke);

        bus.publish(Event::new(EventType::StackUpdated, "demo", "k3x9q"));
        let woke = subscriber.wait_for_stack("demo", "k3x9q", Duration::from_secs(5)).await;
        assert!(woke);
    }
}
