//! Presence as seen by the rest of the platform: a derived view over the
//! connection registry. Never persisted — a process restart means everyone
//! is offline until they reconnect.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::auth::middleware::Claims;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: String,
    pub online: bool,
    pub connections: usize,
}

/// GET /api/presence/{user_id} — Online state for one user. JWT auth required.
/// A user is online iff they have at least one live connection.
pub async fn get_presence(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<String>,
) -> Json<PresenceResponse> {
    let connections = state.registry.connections_of(&user_id);
    Json(PresenceResponse {
        online: !connections.is_empty(),
        connections: connections.len(),
        user_id,
    })
}
