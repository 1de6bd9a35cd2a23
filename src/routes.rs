use axum::{middleware, Json, Router};

use crate::auth::middleware::JwtSecret;
use crate::chat::{messages, notify, presence};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Authenticated API routes (JWT bearer — Claims extractor validates token)
    let api_routes = Router::new()
        .route(
            "/api/presence/{user_id}",
            axum::routing::get(presence::get_presence),
        )
        .route(
            "/api/rooms/{room_id}/messages",
            axum::routing::get(messages::room_history),
        )
        .route("/api/notify", axum::routing::post(notify::post_notify));

    // WebSocket endpoint (auth via query param or bearer header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(api_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
