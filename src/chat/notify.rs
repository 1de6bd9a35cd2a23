//! Entry point for the business-logic layer to push live notifications
//! without knowing about transport details — e.g. the enrollment-approval
//! flow notifying a student, or an announcement to every instructor.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::chat::dispatch::{self, NotificationScope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub scope: NotificationScope,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    /// Delivery attempts accepted by a live connection queue.
    /// Fire-and-forget — nothing is queued for offline users.
    pub delivered: usize,
}

/// POST /api/notify — Broadcast a notification to a scope. Admin only.
/// Body: { "scope": { "type": "User"|"Role"|"All", ... }, "payload": {...} }
pub async fn post_notify(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, StatusCode> {
    if claims.role != Role::Admin {
        return Err(StatusCode::FORBIDDEN);
    }

    let delivered = dispatch::broadcast_notification(&state, &body.scope, body.payload);
    Ok(Json(NotifyResponse { delivered }))
}
