//! Database row types. These map directly to SQLite rows.
//! Conversions into the shared `banter-types` models live here so the
//! rest of the workspace never touches raw column strings.

use anyhow::{Context, Result};
use uuid::Uuid;

use banter_types::models::{GroupMessage, PrivateMessage, User};

use crate::from_db_time;

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: String,
}

pub struct GroupMessageRow {
    pub id: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub room_id: String,
    pub timestamp: String,
}

pub struct PrivateMessageRow {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    /// Joined from `users`; "unknown" when the sender row is gone
    pub sender_name: String,
    pub text: String,
    pub timestamp: String,
    pub is_read: bool,
    pub read_at: Option<String>,
}

pub struct ReadStatusRow {
    pub message_id: i64,
    pub user_id: String,
    pub message_type: String,
    pub is_read: bool,
    pub read_at: Option<String>,
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("corrupt {} '{}'", what, raw))
}

impl TryFrom<UserRow> for User {
    type Error = anyhow::Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: parse_uuid(&row.id, "user id")?,
            username: row.username,
            display_name: row.display_name,
            is_online: row.is_online,
            last_seen: from_db_time(&row.last_seen)?,
        })
    }
}

impl TryFrom<GroupMessageRow> for GroupMessage {
    type Error = anyhow::Error;

    fn try_from(row: GroupMessageRow) -> Result<Self> {
        Ok(GroupMessage {
            id: row.id,
            sender_id: parse_uuid(&row.sender_id, "sender id")?,
            sender_name: row.sender_name,
            text: row.text,
            room_id: row.room_id,
            timestamp: from_db_time(&row.timestamp)?,
        })
    }
}

impl TryFrom<PrivateMessageRow> for PrivateMessage {
    type Error = anyhow::Error;

    fn try_from(row: PrivateMessageRow) -> Result<Self> {
        Ok(PrivateMessage {
            id: row.id,
            sender_id: parse_uuid(&row.sender_id, "sender id")?,
            receiver_id: parse_uuid(&row.receiver_id, "receiver id")?,
            text: row.text,
            timestamp: from_db_time(&row.timestamp)?,
            is_read: row.is_read,
            read_at: row.read_at.as_deref().map(from_db_time).transpose()?,
        })
    }
}
