pub mod actor;
pub mod groups;
pub mod handler;
pub mod protocol;
pub mod registry;

use tokio::sync::mpsc;

use crate::auth::Role;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Identity of one authenticated connection, resolved from the JWT claims
/// at upgrade time and carried through every dispatched command.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub conn_id: String,
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
}
