//! Wire protocol: JSON text frames over the WebSocket.
//!
//! Client commands are internally tagged (`"type"`) with an optional `id`
//! the server echoes back on direct acknowledgments. Events pushed by
//! fan-out carry no id. Only the initiating connection ever receives
//! error/ack feedback; group members never see another member's failures.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::chat::dispatch;
use crate::chat::store::StoredMessage;
use crate::state::AppState;
use crate::ws::{ConnectionSender, SessionContext};

/// RPC-style commands a client can issue over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    JoinRoom { room_id: String },
    LeaveRoom { room_id: String },
    SendMessage { room_id: String, content: String },
    MarkAsRead { room_id: String },
    StartTyping { room_id: String },
    StopTyping { room_id: String },
    SubscribeToAdminChannel,
    SubscribeToInstructorChannel,
}

/// Incoming frame: command plus optional correlation id.
#[derive(Debug, Deserialize)]
pub struct CommandFrame {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    Connected {
        connection_id: String,
    },
    JoinedRoom {
        room_id: String,
    },
    LeftRoom {
        room_id: String,
    },
    ReceiveMessage {
        message: StoredMessage,
    },
    MessagesRead {
        room_id: String,
    },
    UserTyping {
        room_id: String,
        user_id: String,
        user_name: String,
    },
    UserStoppedTyping {
        room_id: String,
        user_id: String,
    },
    ReceiveNotification {
        payload: serde_json::Value,
    },
    Error {
        code: u16,
        message: String,
    },
}

/// Outgoing frame: event plus the correlation id of the command it answers,
/// empty (and omitted) for fan-out pushes.
#[derive(Debug, Serialize)]
pub struct EventFrame {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(flatten)]
    pub event: ServerEvent,
}

/// Handle an incoming text frame: decode the command and dispatch.
pub async fn handle_text_frame(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    ctx: &SessionContext,
) {
    let frame = match serde_json::from_str::<CommandFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                error = %e,
                "Failed to decode command frame"
            );
            send_error(tx, "", 400, "Invalid command");
            return;
        }
    };

    let request_id = frame.id;
    match frame.command {
        ClientCommand::JoinRoom { room_id } => {
            dispatch::join_room(state, ctx, tx, &request_id, &room_id).await;
        }
        ClientCommand::LeaveRoom { room_id } => {
            dispatch::leave_room(state, ctx, tx, &request_id, &room_id);
        }
        ClientCommand::SendMessage { room_id, content } => {
            dispatch::send_message(state, ctx, tx, &request_id, &room_id, &content).await;
        }
        ClientCommand::MarkAsRead { room_id } => {
            dispatch::mark_as_read(state, ctx, tx, &request_id, &room_id).await;
        }
        ClientCommand::StartTyping { room_id } => {
            dispatch::start_typing(state, ctx, &room_id);
        }
        ClientCommand::StopTyping { room_id } => {
            dispatch::stop_typing(state, ctx, &room_id);
        }
        ClientCommand::SubscribeToAdminChannel => {
            dispatch::subscribe_role_channel(state, ctx, dispatch::RoleChannel::Admin);
        }
        ClientCommand::SubscribeToInstructorChannel => {
            dispatch::subscribe_role_channel(state, ctx, dispatch::RoleChannel::Instructor);
        }
    }
}

/// Serialize an event once for fan-out; recipients get cheap clones.
pub fn event_message(event: &ServerEvent) -> Option<Message> {
    let frame = EventFrame {
        id: String::new(),
        event: event.clone(),
    };
    serde_json::to_string(&frame)
        .ok()
        .map(|json| Message::Text(json.into()))
}

/// Send an event to one connection, echoing the request id.
pub fn send_event(tx: &ConnectionSender, request_id: &str, event: ServerEvent) {
    let frame = EventFrame {
        id: request_id.to_string(),
        event,
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = tx.send(Message::Text(json.into()));
    }
}

/// Send an error acknowledgment to the initiating connection.
pub fn send_error(tx: &ConnectionSender, request_id: &str, code: u16, message: &str) {
    send_event(
        tx,
        request_id,
        ServerEvent::Error {
            code,
            message: message.to_string(),
        },
    );
}
