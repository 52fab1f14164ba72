//! Process-wide event bus
//!
//! A bounded multi-subscriber broadcast. Slow subscribers lag and drop the
//! oldest events (acceptable for the debug-oriented streams carried here);
//! the lossless `state:changed` pipeline into each port's automation
//! manager uses its own mpsc channel and only mirrors onto this bus.

use crate::domain::types::BridgeEvent;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. No-op when nobody is listening.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BridgeEvent::CoreStarted { port_id: "main".into() });
        match rx.recv().await.unwrap() {
            BridgeEvent::CoreStarted { port_id } => assert_eq!(port_id, "main"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(BridgeEvent::CoreStopped { port_id: "main".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
