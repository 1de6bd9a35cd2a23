//! Connection registry: tracks all active WebSocket connections per user.
//! A user can have multiple concurrent connections (multiple devices/tabs);
//! the user is online iff their connection set is non-empty. The registry is
//! rebuilt from zero on process restart — nothing here is persisted.

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

use crate::auth::Role;
use crate::ws::ConnectionSender;

/// One live transport connection for one device/tab.
/// Owned by the registry for the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
    pub connected_at: DateTime<Utc>,
    pub sender: ConnectionSender,
}

/// Outcome of a deregistration. `last_for_user` is true for exactly one
/// caller per offline transition, computed under the per-user entry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deregistration {
    pub removed: bool,
    pub last_for_user: bool,
}

/// Per-user connection tracking with DashMap sharding — unrelated users'
/// connect/disconnect traffic never serializes on a shared lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    /// conn_id -> live handle
    conns: DashMap<String, ConnectionHandle>,
    /// user_id -> conn_ids, the derived presence relation
    users: DashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its user's connection set.
    /// Idempotent: registering the same conn_id twice is a no-op returning false.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        // users index first, conns map second; deregister takes the same
        // order so the shard locks never cross.
        let newly = {
            let mut set = self.users.entry(handle.user_id.clone()).or_default();
            set.insert(handle.conn_id.clone())
        };
        if newly {
            tracing::debug!(
                user_id = %handle.user_id,
                conn_id = %handle.conn_id,
                "Connection registered"
            );
            self.conns.insert(handle.conn_id.clone(), handle);
        }
        newly
    }

    /// Remove a connection. If the user's set becomes empty this signals the
    /// presence-offline transition via `last_for_user`, exactly once.
    pub fn deregister(&self, user_id: &str, conn_id: &str) -> Deregistration {
        let mut removed = false;
        let mut last_for_user = false;

        if let Some(mut set) = self.users.get_mut(user_id) {
            removed = set.remove(conn_id);
            last_for_user = removed && set.is_empty();
        }
        if last_for_user {
            // Re-checked under the entry lock: a concurrent register wins.
            self.users.remove_if(user_id, |_, set| set.is_empty());
        }
        if removed {
            self.conns.remove(conn_id);
            tracing::debug!(
                user_id = %user_id,
                conn_id = %conn_id,
                "Connection deregistered"
            );
        }

        Deregistration {
            removed,
            last_for_user,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users
            .get(user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<String> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All live connection ids — the broadcast-to-all resolution set.
    pub fn connection_ids(&self) -> Vec<String> {
        self.conns.iter().map(|e| e.key().clone()).collect()
    }

    /// Best-effort push to one connection. A connection that is mid-disconnect
    /// (missing from the map, or its receiver already dropped) is silently
    /// skipped. Returns whether the message was accepted by the queue.
    pub fn send_to(&self, conn_id: &str, message: Message) -> bool {
        match self.conns.get(conn_id) {
            Some(handle) => handle.sender.send(message).is_ok(),
            None => false,
        }
    }
}
