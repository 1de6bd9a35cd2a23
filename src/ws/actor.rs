use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::chat::store;
use crate::state::AppState;
use crate::ws::groups::room_group;
use crate::ws::protocol::{self, ServerEvent};
use crate::ws::registry::ConnectionHandle;
use crate::ws::SessionContext;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming commands, dispatches to protocol handlers
///
/// The mpsc channel allows any part of the system to push events to this
/// client by cloning the sender; it also gives each connection a simple FIFO,
/// so one sender's sequential messages arrive in send order.
///
/// Lifecycle per connection: register in the connection registry, mirror the
/// persisted room list into live groups, acknowledge the new connection only,
/// then pump commands until the transport closes. Reconnection is a brand-new
/// connection identity — there is no resume.
pub async fn run_connection(socket: WebSocket, state: AppState, ctx: SessionContext) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register this connection in the connection registry
    state.registry.register(ConnectionHandle {
        conn_id: ctx.conn_id.clone(),
        user_id: ctx.user_id.clone(),
        user_name: ctx.user_name.clone(),
        role: ctx.role,
        connected_at: Utc::now(),
        sender: tx.clone(),
    });

    // Mirror the user's persisted room list into the live group directory.
    // A store failure here degrades to an empty initial set — the client can
    // still join rooms explicitly.
    match store::rooms_for_user(&state.db, &ctx.user_id).await {
        Ok(rooms) => {
            for room_id in &rooms {
                state.groups.join(&room_group(room_id), &ctx.conn_id);
            }
            tracing::debug!(
                user_id = %ctx.user_id,
                conn_id = %ctx.conn_id,
                rooms = rooms.len(),
                "Initial room groups joined"
            );
        }
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                error = %e,
                "Failed to fetch room list, starting with no rooms"
            );
        }
    }

    // Acknowledge the new connection only — never broadcast.
    protocol::send_event(
        &tx,
        "",
        ServerEvent::Connected {
            connection_id: ctx.conn_id.clone(),
        },
    );

    tracing::info!(
        user_id = %ctx.user_id,
        conn_id = %ctx.conn_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            // Send ping
            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            // Wait for pong within timeout
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    // Decode JSON command frame and dispatch
                    protocol::handle_text_frame(&text, &tx, &state, &ctx).await;
                }
                Message::Binary(data) => {
                    // The protocol is JSON text frames; ignore binary
                    tracing::debug!(
                        user_id = %ctx.user_id,
                        bytes = data.len(),
                        "Received unexpected binary frame"
                    );
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %ctx.user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %ctx.user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(user_id = %ctx.user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    // Purge group memberships before deregistering, so membership never
    // references an unregistered connection. The two steps are individually
    // idempotent; no transaction spans them.
    let left = state.groups.leave_all(&ctx.conn_id);
    let outcome = state.registry.deregister(&ctx.user_id, &ctx.conn_id);

    if outcome.last_for_user {
        // Offline transition — observed exactly once per user going offline
        tracing::info!(user_id = %ctx.user_id, "User went offline");
    }

    tracing::info!(
        user_id = %ctx.user_id,
        conn_id = %ctx.conn_id,
        groups_left = left.len(),
        "WebSocket actor stopped"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}

/// Mint the session context for a freshly authenticated connection.
pub fn new_session(user_id: &str, user_name: &str, role: crate::auth::Role) -> SessionContext {
    SessionContext {
        conn_id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        role,
    }
}
