use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- JWT Claims --

/// Claims issued by the identity provider. Shared by the REST middleware
/// and the hub upgrade so both resolve the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub exp: usize,
}

/// Identity resolved once when a request or connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSession {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
}

impl AuthenticatedSession {
    pub fn new(user_id: Uuid, username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<Claims> for AuthenticatedSession {
    fn from(claims: Claims) -> Self {
        let full_name = format!("{} {}", claims.first_name, claims.last_name);
        let full_name = full_name.trim();
        let display_name = if full_name.is_empty() {
            claims.username.clone()
        } else {
            full_name.to_string()
        };

        Self {
            user_id: claims.sub,
            username: claims.username,
            display_name,
        }
    }
}

// -- History --

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
    /// Only messages with an id lower than this one
    pub before: Option<i64>,
}

fn default_history_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupMessageResponse {
    pub id: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: String,
    pub room_id: String,
    pub timestamp: DateTime<Utc>,
    pub time: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrivateMessageResponse {
    pub id: i64,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_own_message: bool,
}

// -- Users --

#[derive(Debug, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
}

/// One row of the chat list.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u64,
}

// -- Read state --

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub success: bool,
    pub count: usize,
}
