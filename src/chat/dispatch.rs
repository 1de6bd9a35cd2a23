//! Message/notification dispatcher: authorizes via the persisted roster,
//! persists durable events via the store, and fans out to the live members
//! returned by the group directory.
//!
//! Delivery is best-effort, at-most-once: members are resolved at fan-out
//! time, a connection that is mid-disconnect is silently skipped, and
//! nothing is queued or retried. Missed messages are recovered through the
//! history API.

use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::chat::store;
use crate::state::AppState;
use crate::ws::groups::{room_group, ADMIN_CHANNEL, INSTRUCTOR_CHANNEL};
use crate::ws::protocol::{self, send_error, send_event, ServerEvent};
use crate::ws::{ConnectionSender, SessionContext};

/// Maximum message content length (chars).
const MAX_CONTENT_LENGTH: usize = 4000;

/// Role-scoped broadcast channels and the roles they admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleChannel {
    Admin,
    Instructor,
}

impl RoleChannel {
    pub fn group(&self) -> &'static str {
        match self {
            Self::Admin => ADMIN_CHANNEL,
            Self::Instructor => INSTRUCTOR_CHANNEL,
        }
    }

    /// Admins may also listen on the instructor channel.
    pub fn admits(&self, role: Role) -> bool {
        match self {
            Self::Admin => role == Role::Admin,
            Self::Instructor => role == Role::Instructor || role == Role::Admin,
        }
    }
}

/// Target set for a system notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationScope {
    User { user_id: String },
    Role { channel: RoleChannel },
    All,
}

/// Join a live room group, gated on persisted room membership.
/// Authorization failure is a silent no-op: no ack, no error — the caller
/// learns nothing about rooms it does not belong to.
pub async fn join_room(
    state: &AppState,
    ctx: &SessionContext,
    tx: &ConnectionSender,
    request_id: &str,
    room_id: &str,
) {
    match store::is_member(&state.db, &ctx.user_id, room_id).await {
        Ok(true) => {
            state.groups.join(&room_group(room_id), &ctx.conn_id);
            send_event(
                tx,
                request_id,
                ServerEvent::JoinedRoom {
                    room_id: room_id.to_string(),
                },
            );
        }
        Ok(false) => {
            tracing::debug!(
                user_id = %ctx.user_id,
                room_id = %room_id,
                "Room join denied: not a member"
            );
        }
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                room_id = %room_id,
                error = %e,
                "Room membership check failed"
            );
            send_error(tx, request_id, 500, "Membership check failed");
        }
    }
}

/// Unconditional leave; acknowledges the caller only.
pub fn leave_room(
    state: &AppState,
    ctx: &SessionContext,
    tx: &ConnectionSender,
    request_id: &str,
    room_id: &str,
) {
    state.groups.leave(&room_group(room_id), &ctx.conn_id);
    send_event(
        tx,
        request_id,
        ServerEvent::LeftRoom {
            room_id: room_id.to_string(),
        },
    );
}

/// Persist first, then fan the durable record out to every connection in
/// the room group at that moment — including the sender's own devices.
/// A persistence failure surfaces as an explicit error ack to the sender.
pub async fn send_message(
    state: &AppState,
    ctx: &SessionContext,
    tx: &ConnectionSender,
    request_id: &str,
    room_id: &str,
    content: &str,
) {
    if content.is_empty() {
        send_error(tx, request_id, 400, "Message content is empty");
        return;
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        send_error(tx, request_id, 400, "Message content too long");
        return;
    }

    match store::persist_message(&state.db, room_id, &ctx.user_id, &ctx.user_name, content).await {
        Ok(message) => {
            let members = state.groups.members_of(&room_group(room_id));
            fan_out(state, &members, ServerEvent::ReceiveMessage { message }, None);
        }
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                room_id = %room_id,
                error = %e,
                "Failed to persist message"
            );
            send_error(tx, request_id, 500, "Failed to persist message");
        }
    }
}

/// Durable read-state update; acknowledged to the calling connection only,
/// never broadcast to the room.
pub async fn mark_as_read(
    state: &AppState,
    ctx: &SessionContext,
    tx: &ConnectionSender,
    request_id: &str,
    room_id: &str,
) {
    match store::mark_read(&state.db, &ctx.user_id, room_id).await {
        Ok(()) => {
            send_event(
                tx,
                request_id,
                ServerEvent::MessagesRead {
                    room_id: room_id.to_string(),
                },
            );
        }
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.user_id,
                room_id = %room_id,
                error = %e,
                "Failed to update read state"
            );
            send_error(tx, request_id, 500, "Failed to update read state");
        }
    }
}

/// Ephemeral typing signal, never persisted. Broadcast to every connection
/// in the room except the calling connection itself — the same user's other
/// devices still receive it.
pub fn start_typing(state: &AppState, ctx: &SessionContext, room_id: &str) {
    let members = state.groups.members_of(&room_group(room_id));
    fan_out(
        state,
        &members,
        ServerEvent::UserTyping {
            room_id: room_id.to_string(),
            user_id: ctx.user_id.clone(),
            user_name: ctx.user_name.clone(),
        },
        Some(ctx.conn_id.as_str()),
    );
}

pub fn stop_typing(state: &AppState, ctx: &SessionContext, room_id: &str) {
    let members = state.groups.members_of(&room_group(room_id));
    fan_out(
        state,
        &members,
        ServerEvent::UserStoppedTyping {
            room_id: room_id.to_string(),
            user_id: ctx.user_id.clone(),
        },
        Some(ctx.conn_id.as_str()),
    );
}

/// Join a role-scoped channel if the session's role claim admits it.
/// A claim mismatch is a silent no-op, mirroring unauthorized room joins.
pub fn subscribe_role_channel(state: &AppState, ctx: &SessionContext, channel: RoleChannel) {
    if !channel.admits(ctx.role) {
        tracing::debug!(
            user_id = %ctx.user_id,
            role = %ctx.role.as_str(),
            channel = channel.group(),
            "Channel subscription denied"
        );
        return;
    }
    state.groups.join(channel.group(), &ctx.conn_id);
    tracing::debug!(
        user_id = %ctx.user_id,
        channel = channel.group(),
        "Subscribed to channel"
    );
}

/// Push a system notification to every connection in scope. Fire-and-forget:
/// no acknowledgment is expected from recipients. Called from the socket
/// layer and from the business-logic REST entry point (e.g. the
/// enrollment-approval flow). Returns the number of delivery attempts that
/// were accepted by a live connection queue.
pub fn broadcast_notification(
    state: &AppState,
    scope: &NotificationScope,
    payload: serde_json::Value,
) -> usize {
    let conn_ids = match scope {
        NotificationScope::User { user_id } => state.registry.connections_of(user_id),
        NotificationScope::Role { channel } => state.groups.members_of(channel.group()),
        NotificationScope::All => state.registry.connection_ids(),
    };
    fan_out(
        state,
        &conn_ids,
        ServerEvent::ReceiveNotification { payload },
        None,
    )
}

/// Serialize once, push to each target connection. Connections that closed
/// between lookup and push are silently skipped — at-most-once delivery.
fn fan_out(
    state: &AppState,
    conn_ids: &[String],
    event: ServerEvent,
    except: Option<&str>,
) -> usize {
    let Some(message) = protocol::event_message(&event) else {
        return 0;
    };

    let mut delivered = 0;
    for conn_id in conn_ids {
        if except.is_some_and(|skip| skip == conn_id) {
            continue;
        }
        if state.registry.send_to(conn_id, message.clone()) {
            delivered += 1;
        }
    }
    delivered
}
