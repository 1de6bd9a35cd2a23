use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection.
/// Browser WebSocket clients cannot set custom headers on the upgrade
/// request, so the JWT is accepted as ?token= in addition to the standard
/// bearer header. Both paths run the same validation.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid or missing
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT (or Authorization: Bearer)
/// WebSocket upgrade endpoint. On auth failure, upgrades then immediately
/// closes with the appropriate close code — no registry state is created.
/// On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.or_else(|| bearer_token(&headers));

    let claims = match token {
        Some(token) => jwt::validate_access_token(&state.jwt_secret, &token),
        None => {
            tracing::warn!("WebSocket upgrade without credentials");
            return close_with(ws, CLOSE_TOKEN_INVALID, "Missing credentials");
        }
    };

    match claims {
        Ok(claims) => {
            tracing::info!(
                user_id = %claims.sub,
                role = %claims.role.as_str(),
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| {
                let ctx = actor::new_session(&claims.sub, &claims.name, claims.role);
                actor::run_connection(socket, state, ctx)
            })
        }
        Err(err) => {
            // Determine close code based on error type
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            tracing::warn!(
                close_code = close_code,
                reason = reason,
                "WebSocket auth failed"
            );

            close_with(ws, close_code, reason)
        }
    }
}

/// Extract a bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

/// Upgrade the connection, then immediately close with the error code.
fn close_with(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        let close_frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(close_frame))).await;
    })
}
