//! Broadcast bus for distributing `FlowNotification` to live observers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; slow subscribers observe `RecvError::Lagged` instead of
//! blocking the engine.

use tokio::sync::broadcast;
use waypoint_types::event::FlowNotification;

/// Multi-consumer notification bus.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<FlowNotification>,
}

impl NotificationBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowNotification> {
        self.sender.subscribe()
    }

    /// Publish a notification to all current subscribers.
    pub fn publish(&self, notification: FlowNotification) {
        let _ = self.sender.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
