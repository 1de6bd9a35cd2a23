//! Collaborator contracts backed by the SQLite store: the room membership
//! roster, the durable message record, and per-user read-state.
//!
//! rusqlite is synchronous, so every call goes through
//! tokio::task::spawn_blocking — these are the only points in the system
//! that suspend on persistence.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::db::DbPool;

/// Store failure surfaced to the dispatcher. The caller decides whether it
/// becomes an explicit error acknowledgment (sends, read-state) or a log
/// line (initial room fetch).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// The persisted message record, also the in-flight payload fanned out to
/// room members. `sent_at` is Unix milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub sent_at: i64,
}

/// Room ids the user is a persisted member of. Fetched once per connection
/// to derive the initial live group memberships.
pub async fn rooms_for_user(db: &DbPool, user_id: &str) -> Result<Vec<String>, StoreError> {
    let db = db.clone();
    let user_id = user_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut stmt = conn.prepare("SELECT room_id FROM room_members WHERE user_id = ?1")?;
        let rooms = stmt
            .query_map([&user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rooms)
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Whether the user is a persisted member of the room — the authorization
/// check behind live room joins.
pub async fn is_member(db: &DbPool, user_id: &str, room_id: &str) -> Result<bool, StoreError> {
    let db = db.clone();
    let user_id = user_id.to_string();
    let room_id = room_id.to_string();

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut stmt =
            conn.prepare("SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2")?;
        Ok(stmt.exists(rusqlite::params![room_id, user_id])?)
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Persist a message and return the durable record for fan-out.
pub async fn persist_message(
    db: &DbPool,
    room_id: &str,
    sender_id: &str,
    sender_name: &str,
    content: &str,
) -> Result<StoredMessage, StoreError> {
    let db = db.clone();
    let message = StoredMessage {
        id: Uuid::new_v4().to_string(),
        room_id: room_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_name: sender_name.to_string(),
        content: content.to_string(),
        sent_at: Utc::now().timestamp_millis(),
    };
    let record = message.clone();

    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let conn = db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute(
            "INSERT INTO messages (id, room_id, sender_id, content, sent_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id,
                record.room_id,
                record.sender_id,
                record.content,
                millis_to_rfc3339(record.sent_at),
            ],
        )?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))??;

    Ok(message)
}

/// Record that the user has read the room up to now.
pub async fn mark_read(db: &DbPool, user_id: &str, room_id: &str) -> Result<(), StoreError> {
    let db = db.clone();
    let user_id = user_id.to_string();
    let room_id = room_id.to_string();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute(
            "INSERT INTO message_reads (room_id, user_id, last_read_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id, user_id) DO UPDATE SET last_read_at = excluded.last_read_at",
            rusqlite::params![room_id, user_id, now],
        )?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// History page for the REST layer, newest first. Not used by the live
/// fan-out path — a connection that missed a delivery catches up here.
pub async fn message_history(
    db: &DbPool,
    room_id: &str,
    before: Option<i64>,
    limit: u32,
) -> Result<Vec<StoredMessage>, StoreError> {
    let db = db.clone();
    let room_id = room_id.to_string();
    let before = before.map(millis_to_rfc3339);

    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.room_id, m.sender_id, u.user_name, m.content, m.sent_at
             FROM messages m JOIN users u ON u.id = m.sender_id
             WHERE m.room_id = ?1 AND (?2 IS NULL OR m.sent_at < ?2)
             ORDER BY m.sent_at DESC LIMIT ?3",
        )?;
        let messages = stmt
            .query_map(rusqlite::params![room_id, before, limit], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    room_id: row.get(1)?,
                    sender_id: row.get(2)?,
                    sender_name: row.get(3)?,
                    content: row.get(4)?,
                    sent_at: rfc3339_to_millis(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?
}

/// Timestamps are stored as fixed-width RFC 3339 UTC strings so SQL string
/// comparison orders them correctly.
fn millis_to_rfc3339(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn rfc3339_to_millis(s: &str) -> i64 {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp_millis())
        .unwrap_or_default()
}
