use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use banter_db::{Database, to_db_time};
use banter_types::api::AuthenticatedSession;
use banter_types::events::HubEvent;
use banter_types::models::clock_label;

use crate::blocking;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomMembership, validate_room_id};

/// A private message stored while its receiver had no live connection.
#[derive(Debug, Clone)]
pub struct OfflineNotice {
    pub message_id: i64,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub receiver_id: Uuid,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Hook for reaching users that are not connected (mail, push, ...).
/// Called once per undelivered private message; failures stay inside the hook.
pub trait OfflineNotifier: Send + Sync {
    fn notify_offline(&self, notice: &OfflineNotice);
}

/// Default hook: only records the miss.
pub struct LoggingNotifier;

impl OfflineNotifier for LoggingNotifier {
    fn notify_offline(&self, notice: &OfflineNotice) {
        info!(
            "Private message {} from {} queued for offline user {}",
            notice.message_id, notice.sender_id, notice.receiver_id
        );
    }
}

/// Persists outbound messages and pushes them to the live recipients.
pub struct MessageRouter {
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMembership>,
    notifier: Arc<dyn OfflineNotifier>,
    room_locks: DashMap<String, Arc<Mutex<()>>>,
    max_message_len: usize,
    max_room_id_len: usize,
}

impl MessageRouter {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMembership>,
        notifier: Arc<dyn OfflineNotifier>,
        config: &HubConfig,
    ) -> Self {
        Self {
            db,
            registry,
            rooms,
            notifier,
            room_locks: DashMap::new(),
            max_message_len: config.max_message_len,
            max_room_id_len: config.max_room_id_len,
        }
    }

    /// Store a room message with an unread row for every other connected
    /// user, then push it. Room members get `ReceiveMessage`; other live
    /// connections of those users get `ReceiveMessageNotification`.
    pub async fn send_group_message(
        &self,
        session: &AuthenticatedSession,
        room_id: &str,
        text: &str,
    ) -> HubResult<i64> {
        let text = validate_text(text, self.max_message_len)?;
        validate_room_id(room_id, self.max_room_id_len)?;

        // Persist and push under the room lock so delivery order is storage order
        let _turn = self.room_turn(room_id).await;

        let recipients: Vec<Uuid> = self
            .registry
            .online_users()
            .into_iter()
            .filter(|user| *user != session.user_id)
            .collect();

        let now = Utc::now();
        let message_id = {
            let sender_id = session.user_id.to_string();
            let sender_name = session.display_name.clone();
            let room = room_id.to_string();
            let body = text.clone();
            let ts = to_db_time(&now);
            let ids: Vec<String> = recipients.iter().map(Uuid::to_string).collect();
            blocking(&self.db, move |db| {
                db.insert_group_message(&sender_id, &sender_name, &room, &body, &ts, &ids)
            })
            .await?
        };

        let time = clock_label(&now);
        let in_room: HashSet<Uuid> = self.rooms.connections_in_room(room_id);
        let delivered = self.registry.send_to_all(
            in_room.iter().copied(),
            &HubEvent::ReceiveMessage {
                display_name: session.display_name.clone(),
                text: text.clone(),
                time: time.clone(),
                message_id,
                sender_id: session.user_id,
            },
        );

        let outside: Vec<Uuid> = recipients
            .iter()
            .flat_map(|user| self.registry.active_connections(*user))
            .filter(|conn| !in_room.contains(conn))
            .collect();
        let notified = self.registry.send_to_all(
            outside,
            &HubEvent::ReceiveMessageNotification {
                display_name: session.display_name.clone(),
                text,
                time,
                message_id,
                sender_id: session.user_id,
            },
        );

        debug!(
            "Group message {} in '{}': {} recipients, {} room deliveries, {} notifications",
            message_id,
            room_id,
            recipients.len(),
            delivered,
            notified
        );
        Ok(message_id)
    }

    /// Store a private message and push it to the receiver, or hand it to the
    /// offline hook. The sender's originating connection gets an echo.
    pub async fn send_private_message(
        &self,
        session: &AuthenticatedSession,
        connection_id: Uuid,
        receiver_id: Uuid,
        text: &str,
    ) -> HubResult<i64> {
        let text = validate_text(text, self.max_message_len)?;
        if receiver_id == session.user_id {
            return Err(HubError::invalid("cannot send a private message to yourself"));
        }

        let rid = receiver_id.to_string();
        if !blocking(&self.db, move |db| db.user_exists(&rid)).await? {
            return Err(HubError::UnknownRecipient(receiver_id));
        }

        let now = Utc::now();
        let message_id = {
            let sender_id = session.user_id.to_string();
            let rid = receiver_id.to_string();
            let body = text.clone();
            let ts = to_db_time(&now);
            blocking(&self.db, move |db| db.insert_private_message(&sender_id, &rid, &body, &ts)).await?
        };

        let time = clock_label(&now);
        let delivered = self.registry.send_to_user(
            receiver_id,
            HubEvent::ReceivePrivateMessage {
                sender_id: session.user_id,
                display_name: session.display_name.clone(),
                text: text.clone(),
                time: time.clone(),
                message_id,
            },
        );

        if delivered == 0 {
            self.notifier.notify_offline(&OfflineNotice {
                message_id,
                sender_id: session.user_id,
                sender_name: session.display_name.clone(),
                receiver_id,
                text: text.clone(),
                timestamp: now,
            });
        }

        self.registry.send(
            connection_id,
            HubEvent::PrivateMessageSent {
                receiver_id,
                text,
                time,
                message_id,
            },
        );

        debug!(
            "Private message {} {} -> {} ({} deliveries)",
            message_id, session.user_id, receiver_id, delivered
        );
        Ok(message_id)
    }

    async fn room_turn(&self, room_id: &str) -> RoomTurn<'_> {
        let lock = self
            .room_locks
            .entry(room_id.to_string())
            .or_default()
            .clone();
        let mut turn = RoomTurn {
            locks: &self.room_locks,
            room_id: room_id.to_string(),
            guard: None,
        };
        turn.guard = Some(lock.lock_owned().await);
        turn
    }
}

/// Exclusive use of a room's send lock. The table entry is dropped with the
/// last holder, so idle rooms cost nothing.
struct RoomTurn<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    room_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.room_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Trimmed text, non-empty and at most `max_len` characters.
pub fn validate_text(text: &str, max_len: usize) -> HubResult<String> {
    let text = text.trim();
    if text.is_empty() {
        return Err(HubError::invalid("message text must not be empty"));
    }
    if text.chars().count() > max_len {
        return Err(HubError::invalid(format!(
            "message text exceeds {} characters",
            max_len
        )));
    }
    Ok(text.to_string())
}
