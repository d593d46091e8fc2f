use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use counsel_core::types::ChatMessage;
use counsel_signaling::{Signal, SignalEnvelope};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing;
use uuid::Uuid;

use crate::auth::{verify_token, AuthenticatedUser};
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Signal { to: Uuid, signal: Signal },
    SubscribeChat { chat_id: Uuid },
    UnsubscribeChat { chat_id: Uuid },
}

/// Frames pushed to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Signal {
        #[serde(flatten)]
        envelope: SignalEnvelope,
    },
    UnreadCount {
        total: u64,
    },
    ChatMessages {
        chat_id: Uuid,
        messages: Vec<ChatMessage>,
    },
    Error {
        message: String,
    },
}

/// Per-chat message feeds of one socket. Dropping the set aborts every feed,
/// so they end with the task that owns them even when that task is aborted.
#[derive(Default)]
struct ChatFeeds {
    tasks: JoinSet<()>,
    by_chat: HashMap<Uuid, AbortHandle>,
}

impl ChatFeeds {
    fn contains(&self, chat_id: &Uuid) -> bool {
        self.by_chat.contains_key(chat_id)
    }

    fn spawn<F>(&mut self, chat_id: Uuid, feed: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Reap feeds that already finished or were unsubscribed.
        while self.tasks.try_join_next().is_some() {}
        let handle = self.tasks.spawn(feed);
        if let Some(previous) = self.by_chat.insert(chat_id, handle) {
            previous.abort();
        }
    }

    fn remove(&mut self, chat_id: &Uuid) {
        if let Some(handle) = self.by_chat.remove(chat_id) {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.by_chat.len()
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    Extension(state): Extension<AppState>,
) -> Response {
    let user = match verify_token(&query.token, &state.config.server.jwt_secret) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    if let Err(e) = state.profiles.get_profile(user.user_id).await {
        tracing::debug!(user_id = %user.user_id, "WebSocket refused: {}", e);
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: AuthenticatedUser, state: AppState) {
    let user_id = user.user_id;
    tracing::info!(user_id = %user_id, "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let mut feeds = JoinSet::new();
    match state.relay.inbox(user_id).await {
        Ok(mut inbox) => {
            let outbound = outbound.clone();
            feeds.spawn(async move {
                while let Some(envelope) = inbox.next().await {
                    if outbound.send(ServerFrame::Signal { envelope }).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => tracing::error!(user_id = %user_id, "Failed to open signal inbox: {}", e),
    }
    match state.chats.subscribe_to_unread_count(user_id).await {
        Ok(mut counts) => {
            let outbound = outbound.clone();
            feeds.spawn(async move {
                while let Some(total) = counts.next().await {
                    if outbound.send(ServerFrame::UnreadCount { total }).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(e) => tracing::error!(user_id = %user_id, "Failed to subscribe to unread count: {}", e),
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode WebSocket frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(text)).await {
                tracing::debug!("Failed to send WebSocket message: {}", e);
                return;
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        let mut chats = ChatFeeds::default();

        while let Some(msg) = receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let frame = match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    let message = format!("malformed frame: {}", e);
                    if outbound.send(ServerFrame::Error { message }).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(message) = handle_frame(&recv_state, user_id, frame, &outbound, &mut chats).await {
                if outbound.send(ServerFrame::Error { message }).await.is_err() {
                    break;
                }
            }
        }
    });

    // Awaiting the aborted half drops its chat feeds before the socket is reported closed.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }
    feeds.abort_all();

    tracing::info!(user_id = %user_id, "WebSocket connection closed");
}

async fn handle_frame(
    state: &AppState,
    user_id: Uuid,
    frame: ClientFrame,
    outbound: &mpsc::Sender<ServerFrame>,
    chats: &mut ChatFeeds,
) -> Result<(), String> {
    match frame {
        ClientFrame::Signal { to, signal } => state
            .relay
            .send(user_id, to, signal)
            .await
            .map_err(|e| e.to_string()),
        ClientFrame::SubscribeChat { chat_id } => {
            if chats.contains(&chat_id) {
                return Ok(());
            }
            let mut snapshots = state
                .chats
                .subscribe_to_messages(chat_id, user_id)
                .await
                .map_err(|e| e.to_string())?;
            let outbound = outbound.clone();
            chats.spawn(chat_id, async move {
                while let Some(messages) = snapshots.next().await {
                    let frame = ServerFrame::ChatMessages { chat_id, messages };
                    if outbound.send(frame).await.is_err() {
                        break;
                    }
                }
            });
            tracing::debug!(user_id = %user_id, chat_id = %chat_id, feeds = chats.len(), "Chat subscribed");
            Ok(())
        }
        ClientFrame::UnsubscribeChat { chat_id } => {
            chats.remove(&chat_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_client_frames_parse() {
        let to = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"signal","to":"{}","signal":{{"type":"offer","sdp":"v=0"}}}}"#,
            to
        );
        match serde_json::from_str::<ClientFrame>(&raw).unwrap() {
            ClientFrame::Signal { to: parsed, signal } => {
                assert_eq!(parsed, to);
                assert_eq!(signal, Signal::Offer { sdp: "v=0".to_string() });
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let chat_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"subscribe_chat","chat_id":"{}"}}"#, chat_id);
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(&raw).unwrap(),
            ClientFrame::SubscribeChat { chat_id: parsed } if parsed == chat_id
        ));
    }

    #[test]
    fn test_unread_frame_shape() {
        let json = serde_json::to_value(ServerFrame::UnreadCount { total: 3 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "unread_count", "total": 3 }));
    }

    fn parked(alive: oneshot::Sender<()>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            let _alive = alive;
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_chat_feeds_end_with_their_owner() {
        let (alive, mut stopped) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let owner = tokio::spawn(async move {
            let mut chats = ChatFeeds::default();
            chats.spawn(Uuid::new_v4(), parked(alive));
            let _ = ready_tx.send(chats.len());
            std::future::pending::<()>().await;
        });

        assert_eq!(ready_rx.await.unwrap(), 1);
        assert!(matches!(stopped.try_recv(), Err(oneshot::error::TryRecvError::Empty)));

        owner.abort();
        assert!(stopped.await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_resubscribe_replace_feed() {
        let chat_id = Uuid::new_v4();
        let mut chats = ChatFeeds::default();

        let (first, first_stopped) = oneshot::channel();
        chats.spawn(chat_id, parked(first));
        let (second, second_stopped) = oneshot::channel();
        chats.spawn(chat_id, parked(second));
        assert!(first_stopped.await.is_err());
        assert_eq!(chats.len(), 1);

        chats.remove(&chat_id);
        assert!(!chats.contains(&chat_id));
        assert!(second_stopped.await.is_err());
    }
}
