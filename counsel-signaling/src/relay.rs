use counsel_core::realtime::{publish_json, topics, RealtimeBus};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tracing;
use uuid::Uuid;

use crate::signal::{Signal, SignalEnvelope};

/// Per-identity signal mailboxes on the realtime bus.
///
/// Delivery is fire and forget: nothing is acknowledged and a signal sent to
/// an identity with no live subscriber is lost.
#[derive(Clone)]
pub struct SignalRelay {
    bus: Arc<dyn RealtimeBus>,
}

impl SignalRelay {
    pub fn new(bus: Arc<dyn RealtimeBus>) -> Self {
        Self { bus }
    }

    /// Publishes `signal` into the mailbox of `to`, stamped with `from`.
    pub async fn send(&self, from: Uuid, to: Uuid, signal: Signal) -> counsel_core::Result<()> {
        if from == to {
            return Err(counsel_core::Error::Validation("cannot signal yourself".to_string()));
        }
        let kind = signal.kind();
        let envelope = SignalEnvelope { from, to, signal };
        publish_json(self.bus.as_ref(), &topics::signals(to), &envelope).await?;
        tracing::debug!(from = %from, to = %to, kind, "Signal relayed");
        Ok(())
    }

    /// Envelopes addressed to `user_id` from now on. Malformed payloads and
    /// envelopes addressed to someone else are dropped.
    pub async fn inbox(&self, user_id: Uuid) -> counsel_core::Result<BoxStream<'static, SignalEnvelope>> {
        let subscription = self.bus.subscribe(&topics::signals(user_id)).await?;
        let stream = subscription.filter_map(move |payload| async move {
            match serde_json::from_str::<SignalEnvelope>(&payload) {
                Ok(envelope) if envelope.to == user_id => Some(envelope),
                Ok(envelope) => {
                    tracing::warn!(user_id = %user_id, to = %envelope.to, "Misrouted signal dropped");
                    None
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, "Malformed signal dropped: {}", e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_core::MemoryBus;

    #[tokio::test]
    async fn test_signal_reaches_recipient_with_sender() {
        let relay = SignalRelay::new(Arc::new(MemoryBus::new()));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut inbox = relay.inbox(bob).await.unwrap();

        relay.send(alice, bob, Signal::Offer { sdp: "v=0".to_string() }).await.unwrap();

        let envelope = inbox.next().await.unwrap();
        assert_eq!(envelope.from, alice);
        assert_eq!(envelope.to, bob);
        assert_eq!(envelope.signal, Signal::Offer { sdp: "v=0".to_string() });
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let relay = SignalRelay::new(bus.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut inbox = relay.inbox(bob).await.unwrap();

        bus.publish(&topics::signals(bob), "{\"not\":\"a signal\"}").await.unwrap();
        relay.send(alice, bob, Signal::Busy).await.unwrap();

        assert_eq!(inbox.next().await.unwrap().signal, Signal::Busy);
    }

    #[tokio::test]
    async fn test_self_signal_rejected() {
        let relay = SignalRelay::new(Arc::new(MemoryBus::new()));
        let alice = Uuid::new_v4();
        assert!(relay.send(alice, alice, Signal::EndCall).await.is_err());
    }
}
