use std::sync::Arc;

use crate::db::DbPool;
use crate::ws::groups::GroupDirectory;
use crate::ws::registry::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
/// Constructed once at startup and cloned by reference into collaborators —
/// the registry and directory are the only shared mutable state in the
/// process, and all mutation goes through their documented operations.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key, shared with the identity service)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections per user
    pub registry: Arc<ConnectionRegistry>,
    /// Live membership of chat rooms and role channels
    pub groups: Arc<GroupDirectory>,
}

impl AppState {
    pub fn new(db: DbPool, jwt_secret: Vec<u8>) -> Self {
        Self {
            db,
            jwt_secret,
            registry: Arc::new(ConnectionRegistry::new()),
            groups: Arc::new(GroupDirectory::new()),
        }
    }
}
