//! Outbound ports: live broadcast and participant notification.
//!
//! Both are best-effort. The engine publishes after every state change and
//! never waits for delivery; a failed or slow consumer cannot stall metering.

use async_trait::async_trait;
use tokio::sync::broadcast;

use talkmeter_core::{EventEnvelope, SessionEvent, SessionRecord, UserId};

/// Live event fan-out to connected participants.
pub trait BroadcastPort: Send + Sync {
    /// Publish an event. Must not block.
    fn publish(&self, envelope: EventEnvelope);
}

/// Out-of-band notification to one participant (push, email, ...).
#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Deliver `envelope` to `recipient`.
    async fn notify(&self, recipient: UserId, envelope: EventEnvelope);
}

/// Broadcast over an in-process tokio channel.
///
/// Slow subscribers lag and drop old events rather than applying
/// backpressure to the publisher.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<EventEnvelope>,
}

impl ChannelBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl BroadcastPort for ChannelBroadcaster {
    fn publish(&self, envelope: EventEnvelope) {
        // No subscribers is not an error.
        if self.sender.send(envelope).is_err() {
            tracing::trace!("event published with no subscribers");
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl BroadcastPort for NullBroadcaster {
    fn publish(&self, _envelope: EventEnvelope) {}
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationPort for TracingNotifier {
    async fn notify(&self, recipient: UserId, envelope: EventEnvelope) {
        tracing::info!(
            recipient = %recipient,
            session_id = %envelope.session_id,
            event = envelope.event.name(),
            "Notification dispatched"
        );
    }
}

/// Participants who get an out-of-band notification for `event`.
///
/// Only request handshakes and session endings notify; live progress goes
/// over the broadcast port alone.
#[must_use]
pub fn notification_recipients(record: &SessionRecord, event: &SessionEvent) -> Vec<UserId> {
    match event {
        SessionEvent::RequestCreated { .. } | SessionEvent::RequestCancelled => {
            vec![record.provider_id]
        }
        SessionEvent::RequestAccepted { .. } | SessionEvent::RequestRejected => {
            vec![record.payer_id]
        }
        SessionEvent::SessionEnded { .. } => vec![record.payer_id, record.provider_id],
        _ => Vec::new(),
    }
}
