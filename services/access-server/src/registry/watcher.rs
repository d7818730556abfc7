//! In-process change notification hub shared by the registry backends.

use tokio::sync::broadcast;
use tracing::debug;

use super::RegistryEvent;
use crate::device::Device;

/// Events buffered per subscriber before it starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Fan-out of registry events to subscribers.
///
/// Publishing never blocks. A subscriber that falls more than
/// [`EVENT_CHANNEL_CAPACITY`] events behind observes a lag error on its
/// next receive instead of stalling the publisher.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<RegistryEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    pub fn emit_add(&self, device: &Device) {
        self.emit(RegistryEvent::Added(device.clone()));
    }

    pub fn emit_delete(&self, device: &Device) {
        self.emit(RegistryEvent::Deleted(device.clone()));
    }

    pub fn emit_reconnect(&self) {
        self.emit(RegistryEvent::Reconnected);
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers yet is fine; startup runs a full reconcile anyway.
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            debug!(kind = event.kind(), "No registry subscribers");
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit_reconnect();

        assert_eq!(a.recv().await.unwrap(), RegistryEvent::Reconnected);
        assert_eq!(b.recv().await.unwrap(), RegistryEvent::Reconnected);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.emit_reconnect();
    }
}
