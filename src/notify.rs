use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-resource broadcast of reservation lifecycle events.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event. No-op if nobody is listening; drops the channel once
    /// every receiver is gone.
    pub fn send(&self, event: &Event) {
        let resource_id = event.resource_id();
        let orphaned = match self.channels.get(resource_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if orphaned {
            self.channels
                .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn cancelled(resource_id: &str) -> Event {
        Event::ReservationCancelled {
            id: Ulid::new(),
            resource_id: resource_id.into(),
            at: 1_000,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("room-1");

        let event = cancelled("room-1");
        hub.send(&event);
        hub.send(&cancelled("room-2")); // other resource, not delivered

        assert_eq!(rx.recv().await.unwrap(), event);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&cancelled("room-1"));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscribers_release_channel() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe("room-1");
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.send(&cancelled("room-1"));
        assert_eq!(hub.channel_count(), 0);
    }
}
