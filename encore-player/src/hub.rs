//! State broadcaster for connected observers
//!
//! Fan-out of server messages to every WebSocket observer. Backed by a
//! tokio broadcast channel; observers that fall behind the buffer see a
//! lag error on their receiver and get resynchronized with a fresh
//! snapshot by the connection handler.

use encore_common::protocol::ServerMessage;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone)]
pub struct StateBroadcaster {
    tx: broadcast::Sender<ServerMessage>,
}

impl StateBroadcaster {
    /// Create a broadcaster buffering up to `capacity` messages per
    /// observer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast a message, ignoring whether anyone is listening.
    pub fn broadcast_lossy(&self, message: ServerMessage) {
        if let Ok(count) = self.tx.send(message) {
            debug!("broadcast state to {count} observers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// Number of currently connected observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_common::Session;

    fn update() -> ServerMessage {
        ServerMessage::StateUpdate {
            state: Session::default(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_message() {
        let hub = StateBroadcaster::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.observer_count(), 2);

        hub.broadcast_lossy(update());
        assert!(matches!(
            a.recv().await.unwrap(),
            ServerMessage::StateUpdate { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            ServerMessage::StateUpdate { .. }
        ));
    }

    #[tokio::test]
    async fn broadcast_without_observers_is_a_no_op() {
        let hub = StateBroadcaster::new(16);
        hub.broadcast_lossy(update());
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let hub = StateBroadcaster::new(2);
        let mut rx = hub.subscribe();
        for _ in 0..5 {
            hub.broadcast_lossy(update());
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
