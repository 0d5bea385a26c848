//! The embedded event bus (spec §2, §4.I): a typed broadcast of relay
//! traffic for external observers and for the `Runtime.enable` latch in
//! the CDP emulator.
//!
//! Grounded on the base crate's `services::event::EventDispatcher`, which
//! used a `tokio::sync::broadcast` channel behind a typed event enum. The
//! relay doesn't need per-subscription filter predicates the way the base
//! crate's page/console/network dispatcher did, so this is the same
//! broadcast-channel core without the `Subscription` bookkeeping layer.

use serde_json::Value;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Events emitted onto the bus (spec §4.D, §4.F, §8).
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A CDP command frame was received from a driver (spec §4.D).
    CdpCommand {
        client_id: String,
        id: u64,
        session_id: Option<String>,
        method: String,
    },
    /// A response was sent back to a driver for a given command id.
    CdpResponse {
        client_id: String,
        id: u64,
        ok: bool,
    },
    /// A CDP event was delivered (or synthesized) towards a driver.
    CdpEvent {
        extension_id: String,
        session_id: Option<String>,
        method: String,
        params: Value,
        server_generated: bool,
    },
}

/// The relay's embedded event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Broadcast channels only fail to send when there
    /// are no subscribers; that's expected when nothing is observing the
    /// bus, so it's silently ignored (mirrors the base crate's
    /// `try_dispatch_*` treatment of "no receivers").
    pub fn publish(&self, event: RelayEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_observed_by_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(RelayEvent::CdpCommand {
            client_id: "a".into(),
            id: 1,
            session_id: None,
            method: "Target.setAutoAttach".into(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, RelayEvent::CdpCommand { id: 1, .. });
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(RelayEvent::CdpResponse {
            client_id: "a".into(),
            id: 1,
            ok: true,
        });
    }
}
