use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use uuid::Uuid;

use threadly_types::events::LiveEvent;

use crate::LiveChannel;

/// Manages all connected clients and routes events to them.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast topic: every connected client receives every event
    broadcast_tx: broadcast::Sender<LiveEvent>,

    /// Per-user targeted send channels: user_id -> [(conn_id, sender)].
    /// A user may have several tabs or devices connected at once.
    user_channels: DashMap<Uuid, Vec<(Uuid, mpsc::UnboundedSender<LiveEvent>)>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: DashMap::new(),
            }),
        }
    }

    /// Subscribe to the broadcast topic.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Register a per-connection targeted channel. Returns (conn_id, receiver).
    pub fn register_user_channel(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<LiveEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .entry(user_id)
            .or_default()
            .push((conn_id, tx));
        (conn_id, rx)
    }

    /// Unregister one connection's channel. Other connections of the same
    /// user stay registered.
    pub fn unregister_user_channel(&self, user_id: Uuid, conn_id: Uuid) {
        self.inner.user_channels.remove_if_mut(&user_id, |_, conns| {
            conns.retain(|(cid, _)| *cid != conn_id);
            conns.is_empty()
        });
    }

    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .user_channels
            .get(&user_id)
            .map_or(0, |conns| conns.len())
    }
}

impl LiveChannel for Dispatcher {
    fn send_to_user(&self, user_id: Uuid, event: LiveEvent) {
        let Some(conns) = self.inner.user_channels.get(&user_id) else {
            trace!("No live connection for {}, dropping {}", user_id, event.channel());
            return;
        };
        for (_, tx) in conns.iter() {
            let _ = tx.send(event.clone());
        }
    }

    fn broadcast(&self, event: LiveEvent) {
        // No receivers is fine: nobody is connected
        let _ = self.inner.broadcast_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadly_types::models::PresenceStatus;

    fn receipt(reader_id: Uuid) -> LiveEvent {
        LiveEvent::ReadReceipt { reader_id }
    }

    #[test]
    fn targeted_events_reach_every_connection_of_user() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, mut tab_a) = dispatcher.register_user_channel(user);
        let (_, mut tab_b) = dispatcher.register_user_channel(user);
        let (_, mut other) = dispatcher.register_user_channel(Uuid::new_v4());

        dispatcher.send_to_user(user, receipt(Uuid::nil()));

        assert_eq!(tab_a.try_recv().unwrap(), receipt(Uuid::nil()));
        assert_eq!(tab_b.try_recv().unwrap(), receipt(Uuid::nil()));
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn unregister_only_removes_matching_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (first, _rx1) = dispatcher.register_user_channel(user);
        let (second, _rx2) = dispatcher.register_user_channel(user);

        dispatcher.unregister_user_channel(user, first);
        assert_eq!(dispatcher.connection_count(user), 1);

        dispatcher.unregister_user_channel(user, Uuid::new_v4());
        assert_eq!(dispatcher.connection_count(user), 1);

        dispatcher.unregister_user_channel(user, second);
        assert_eq!(dispatcher.connection_count(user), 0);
    }

    #[test]
    fn send_to_offline_user_is_dropped() {
        let dispatcher = Dispatcher::new();
        dispatcher.send_to_user(Uuid::new_v4(), receipt(Uuid::nil()));
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let event = LiveEvent::PresenceUpdate {
            user_id: Uuid::new_v4(),
            status: PresenceStatus::Online,
        };

        dispatcher.broadcast(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
