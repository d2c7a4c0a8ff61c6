use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use threadly_types::events::{LiveCommand, LiveEvent};
use threadly_types::models::PresenceStatus;

use crate::LiveChannel;
use crate::dispatcher::Dispatcher;
use crate::presence::PresenceTracker;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Channels of one open connection, plus who else was online when it opened.
struct Session {
    conn_id: Uuid,
    user_rx: mpsc::UnboundedReceiver<LiveEvent>,
    broadcast_rx: broadcast::Receiver<LiveEvent>,
    snapshot: Vec<LiveEvent>,
}

/// Subscribe and register before reading presence, so any change published
/// after the snapshot is still queued for this connection.
fn open_session(dispatcher: &Dispatcher, presence: &PresenceTracker, user_id: Uuid) -> Session {
    let broadcast_rx = dispatcher.subscribe();
    let (conn_id, user_rx) = dispatcher.register_user_channel(user_id);

    let snapshot = presence
        .snapshot()
        .into_iter()
        .filter(|entry| entry.user_id != user_id && entry.status.is_online())
        .map(|entry| LiveEvent::PresenceUpdate {
            user_id: entry.user_id,
            status: entry.status,
        })
        .collect();

    Session {
        conn_id,
        user_rx,
        broadcast_rx,
        snapshot,
    }
}

/// Drop one connection. The user goes offline only with their last one.
fn close_session(dispatcher: &Dispatcher, presence: &PresenceTracker, user_id: Uuid, conn_id: Uuid) -> usize {
    dispatcher.unregister_user_channel(user_id, conn_id);
    let remaining = dispatcher.connection_count(user_id);
    if remaining == 0 {
        presence.set_status(user_id, PresenceStatus::Offline);
    }
    remaining
}

/// Handle a pre-authenticated WebSocket connection.
/// The JWT was already validated at the HTTP upgrade layer, so we go
/// straight to Ready + event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    presence: Arc<PresenceTracker>,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, receiver) = socket.split();

    let session = open_session(&dispatcher, &presence, user_id);
    let conn_id = session.conn_id;
    info!(
        "{} ({}) connected to gateway ({} open)",
        username,
        user_id,
        dispatcher.connection_count(user_id)
    );

    let ready = LiveEvent::Ready {
        user_id,
        username: username.clone(),
    };
    let greeted = async {
        send_event(&mut sender, &ready).await?;
        for event in &session.snapshot {
            send_event(&mut sender, event).await?;
        }
        Ok::<_, axum::Error>(())
    }
    .await;

    if greeted.is_ok() {
        presence.set_status(user_id, PresenceStatus::Online);
        run_connection_loop(
            sender,
            receiver,
            session,
            dispatcher.clone(),
            presence.clone(),
            user_id,
            username.clone(),
        )
        .await;
    }

    let remaining = close_session(&dispatcher, &presence, user_id, conn_id);
    info!(
        "{} ({}) disconnected from gateway ({} still open)",
        username, user_id, remaining
    );
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    session: Session,
    dispatcher: Dispatcher,
    presence: Arc<PresenceTracker>,
    user_id: Uuid,
    username: String,
) {
    let Session {
        mut user_rx,
        mut broadcast_rx,
        ..
    } = session;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<LiveCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher, &presence, user_id, &username, cmd),
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username,
                            user_id,
                            e,
                            truncate(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

fn handle_command(
    dispatcher: &Dispatcher,
    presence: &PresenceTracker,
    user_id: Uuid,
    username: &str,
    cmd: LiveCommand,
) {
    match cmd {
        LiveCommand::Heartbeat => presence.heartbeat(user_id),

        LiveCommand::StartTyping { target_id } => {
            debug!("{} ({}) typing to {}", username, user_id, target_id);
            dispatcher.send_to_user(
                target_id,
                LiveEvent::TypingStart {
                    user_id,
                    username: username.to_string(),
                    target_id,
                },
            );
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &LiveEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.channel(), e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::DEFAULT_HEARTBEAT_TTL;

    fn setup() -> (Dispatcher, Arc<PresenceTracker>) {
        let dispatcher = Dispatcher::new();
        let presence = Arc::new(PresenceTracker::new(
            Arc::new(dispatcher.clone()),
            DEFAULT_HEARTBEAT_TTL,
        ));
        (dispatcher, presence)
    }

    #[test]
    fn heartbeat_command_marks_online() {
        let (dispatcher, presence) = setup();
        let user = Uuid::new_v4();
        handle_command(&dispatcher, &presence, user, "alice", LiveCommand::Heartbeat);
        assert_eq!(presence.get_status(user), PresenceStatus::Online);
    }

    #[test]
    fn typing_goes_only_to_target() {
        let (dispatcher, presence) = setup();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let (_, mut bob_rx) = dispatcher.register_user_channel(bob);
        let (_, mut alice_rx) = dispatcher.register_user_channel(alice);

        handle_command(
            &dispatcher,
            &presence,
            alice,
            "alice",
            LiveCommand::StartTyping { target_id: bob },
        );

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            LiveEvent::TypingStart {
                user_id: alice,
                username: "alice".into(),
                target_id: bob
            }
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn changes_after_snapshot_are_queued_for_new_session() {
        let (dispatcher, presence) = setup();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        presence.set_status(alice, PresenceStatus::Online);
        presence.set_status(carol, PresenceStatus::Offline);

        let mut session = open_session(&dispatcher, &presence, bob);
        assert_eq!(
            session.snapshot,
            vec![LiveEvent::PresenceUpdate {
                user_id: alice,
                status: PresenceStatus::Online
            }]
        );

        // Carol comes online before bob's loop starts forwarding
        presence.set_status(carol, PresenceStatus::Online);
        assert_eq!(
            session.broadcast_rx.try_recv().unwrap(),
            LiveEvent::PresenceUpdate {
                user_id: carol,
                status: PresenceStatus::Online
            }
        );

        dispatcher.send_to_user(bob, LiveEvent::ReadReceipt { reader_id: alice });
        assert!(session.user_rx.try_recv().is_ok());
    }

    #[test]
    fn offline_only_when_last_connection_closes() {
        let (dispatcher, presence) = setup();
        let alice = Uuid::new_v4();
        let laptop = open_session(&dispatcher, &presence, alice);
        let phone = open_session(&dispatcher, &presence, alice);
        presence.set_status(alice, PresenceStatus::Online);

        assert_eq!(close_session(&dispatcher, &presence, alice, laptop.conn_id), 1);
        assert_eq!(presence.get_status(alice), PresenceStatus::Online);

        assert_eq!(close_session(&dispatcher, &presence, alice, phone.conn_id), 0);
        assert_eq!(presence.get_status(alice), PresenceStatus::Offline);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 200), "hi");
    }
}
