use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-salon event subscriptions: owner dashboards watch
/// bookings arrive, customers watch their hold transitions.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
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

    /// Subscribe to events for a salon. Creates the channel if needed.
    pub fn subscribe(&self, salon_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(salon_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, salon_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&salon_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let salon_id = Ulid::new();
        let mut rx = hub.subscribe(salon_id);

        let event = Event::BookingConfirmed {
            id: Ulid::new(),
            salon_id,
        };
        hub.send(salon_id, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let salon_id = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            salon_id,
            &Event::BookingCancelled {
                id: Ulid::new(),
                salon_id,
            },
        );
    }
}
