use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageKind;

/// Events pushed from the server to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum HubEvent {
    /// The connection is registered and may send commands
    Ready {
        user_id: Uuid,
        display_name: String,
        connection_id: Uuid,
    },

    /// A group message, delivered to connections joined to its room
    ReceiveMessage {
        display_name: String,
        text: String,
        time: String,
        message_id: i64,
        sender_id: Uuid,
    },

    /// Same payload as `ReceiveMessage`, for live connections outside the room
    ReceiveMessageNotification {
        display_name: String,
        text: String,
        time: String,
        message_id: i64,
        sender_id: Uuid,
    },

    ReceivePrivateMessage {
        sender_id: Uuid,
        display_name: String,
        text: String,
        time: String,
        message_id: i64,
    },

    /// Echo to the sender's originating connection
    PrivateMessageSent {
        receiver_id: Uuid,
        text: String,
        time: String,
        message_id: i64,
    },

    /// A recipient read one of your messages
    MessageRead {
        message_id: i64,
        message_type: MessageKind,
    },

    UnreadMessageCount {
        group_unread: u64,
        private_unread: u64,
    },

    UserJoined {
        display_name: String,
        user_id: Uuid,
        room_id: String,
    },

    UserLeft {
        display_name: String,
        user_id: Uuid,
        room_id: String,
    },

    /// Clients drop the indicator after `expires_in_ms` unless refreshed
    UserTyping {
        user_id: Uuid,
        display_name: String,
        is_private: bool,
        scope_id: String,
        expires_in_ms: u64,
    },

    UserStoppedTyping {
        user_id: Uuid,
        display_name: String,
        is_private: bool,
        scope_id: String,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        display_name: String,
        online: bool,
        last_seen: DateTime<Utc>,
    },

    /// A command from this connection failed
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

/// Commands sent FROM client TO server over the hub socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum HubCommand {
    SendMessage {
        text: String,
        #[serde(default = "default_room")]
        room_id: String,
    },

    SendPrivateMessage { receiver_id: Uuid, text: String },

    MarkMessageAsRead {
        message_id: i64,
        #[serde(default)]
        message_type: MessageKind,
    },

    JoinRoom {
        #[serde(default = "default_room")]
        room_id: String,
    },

    LeaveRoom {
        #[serde(default = "default_room")]
        room_id: String,
    },

    GetUnreadMessageCount,

    SendTypingNotification { scope: TypingScope },

    SendStopTypingNotification { scope: TypingScope },
}

/// Where a typing signal is shown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypingScope {
    Room { room_id: String },
    /// `user_id` is the counterpart of the conversation
    Private { user_id: Uuid },
}

impl TypingScope {
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private { .. })
    }

    pub fn scope_id(&self) -> String {
        match self {
            Self::Room { room_id } => room_id.clone(),
            Self::Private { user_id } => user_id.to_string(),
        }
    }
}

fn default_room() -> String {
    crate::DEFAULT_ROOM.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_defaults_to_general_room() {
        let cmd: HubCommand =
            serde_json::from_str(r#"{"type":"SendMessage","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(
            cmd,
            HubCommand::SendMessage {
                text: "hi".into(),
                room_id: "general".into(),
            }
        );
    }

    #[test]
    fn mark_read_defaults_to_group() {
        let cmd: HubCommand =
            serde_json::from_str(r#"{"type":"MarkMessageAsRead","data":{"message_id":7}}"#).unwrap();
        assert_eq!(
            cmd,
            HubCommand::MarkMessageAsRead {
                message_id: 7,
                message_type: MessageKind::Group,
            }
        );
    }

    #[test]
    fn unit_command_needs_no_data() {
        let cmd: HubCommand = serde_json::from_str(r#"{"type":"GetUnreadMessageCount"}"#).unwrap();
        assert_eq!(cmd, HubCommand::GetUnreadMessageCount);
    }

    #[test]
    fn typing_scope_is_tagged_by_kind() {
        let json = r#"{"type":"SendTypingNotification","data":{"scope":{"kind":"room","room_id":"general"}}}"#;
        let cmd: HubCommand = serde_json::from_str(json).unwrap();
        let HubCommand::SendTypingNotification { scope } = cmd else {
            panic!("wrong command");
        };
        assert!(!scope.is_private());
        assert_eq!(scope.scope_id(), "general");
    }

    #[test]
    fn events_use_type_and_data() {
        let event = HubEvent::MessageRead {
            message_id: 3,
            message_type: MessageKind::Private,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "MessageRead");
        assert_eq!(value["data"]["message_type"], "private");
    }
}
