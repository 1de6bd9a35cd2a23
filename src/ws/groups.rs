//! Group membership directory: live connections per chat room or role-scoped
//! broadcast channel. Groups are created implicitly on first join and are
//! ephemeral — every reconnect re-derives room membership from the persisted
//! roster. Membership is always a subset of currently-registered connections:
//! the connection actor purges a closing connection from every group before
//! deregistering it.

use dashmap::DashMap;
use std::collections::HashSet;

/// Group name for a chat room.
pub fn room_group(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Role-scoped broadcast channel names.
pub const ADMIN_CHANNEL: &str = "role:admin";
pub const INSTRUCTOR_CHANNEL: &str = "role:instructor";

/// Per-group connection sets with a reverse index so a disconnecting
/// connection is purged in O(groups it belongs to), not O(all groups).
#[derive(Default)]
pub struct GroupDirectory {
    /// group -> member conn_ids
    groups: DashMap<String, HashSet<String>>,
    /// conn_id -> groups joined (reverse index for leave_all)
    memberships: DashMap<String, HashSet<String>>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent join: joining twice has the same effect as joining once.
    pub fn join(&self, group: &str, conn_id: &str) -> bool {
        let newly = {
            let mut members = self.groups.entry(group.to_string()).or_default();
            members.insert(conn_id.to_string())
        };
        if newly {
            self.memberships
                .entry(conn_id.to_string())
                .or_default()
                .insert(group.to_string());
        }
        newly
    }

    /// Idempotent leave. Empty groups are dropped from the map.
    pub fn leave(&self, group: &str, conn_id: &str) -> bool {
        let removed = self
            .groups
            .get_mut(group)
            .map(|mut members| members.remove(conn_id))
            .unwrap_or(false);
        self.groups.remove_if(group, |_, members| members.is_empty());

        if removed {
            if let Some(mut joined) = self.memberships.get_mut(conn_id) {
                joined.remove(group);
            }
            self.memberships
                .remove_if(conn_id, |_, joined| joined.is_empty());
        }
        removed
    }

    /// Membership at call time — no snapshot caching across calls.
    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Purge a connection from every group it belongs to. Invoked by the
    /// connection actor on disconnect, before registry deregistration.
    /// Returns the groups that were left.
    pub fn leave_all(&self, conn_id: &str) -> Vec<String> {
        let Some((_, joined)) = self.memberships.remove(conn_id) else {
            return Vec::new();
        };

        let mut left = Vec::with_capacity(joined.len());
        for group in joined {
            let removed = self
                .groups
                .get_mut(&group)
                .map(|mut members| members.remove(conn_id))
                .unwrap_or(false);
            self.groups.remove_if(&group, |_, members| members.is_empty());
            if removed {
                left.push(group);
            }
        }
        left
    }
}
