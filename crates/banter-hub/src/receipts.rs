use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use banter_db::{Database, to_db_time};
use banter_types::events::HubEvent;
use banter_types::models::MessageKind;

use crate::blocking;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::registry::ConnectionRegistry;
use crate::rooms::validate_room_id;

/// Read-state transitions. Each unread row flips to read exactly once;
/// whoever performs the flip notifies the original sender.
pub struct ReadReceiptTracker {
    db: Arc<Database>,
    registry: Arc<ConnectionRegistry>,
    max_room_id_len: usize,
}

impl ReadReceiptTracker {
    pub fn new(db: Arc<Database>, registry: Arc<ConnectionRegistry>, config: &HubConfig) -> Self {
        Self {
            db,
            registry,
            max_room_id_len: config.max_room_id_len,
        }
    }

    pub async fn mark_read(&self, message_id: i64, kind: MessageKind, user_id: Uuid) -> HubResult<bool> {
        match kind {
            MessageKind::Group => self.mark_group_read(message_id, user_id).await,
            MessageKind::Private => self.mark_private_read(message_id, user_id).await,
        }
    }

    /// Missing rows and repeated marks return false.
    pub async fn mark_group_read(&self, message_id: i64, user_id: Uuid) -> HubResult<bool> {
        self.ensure_user(user_id).await?;

        let uid = user_id.to_string();
        let ts = to_db_time(&Utc::now());
        let sender = blocking(&self.db, move |db| {
            if !db.mark_group_read(message_id, &uid, &ts)? {
                return Ok(None);
            }
            db.get_group_message(message_id)?
                .map(|row| parse_user(&row.sender_id))
                .transpose()
        })
        .await?;

        Ok(self.notify_sender(sender, message_id, MessageKind::Group))
    }

    /// Only the designated receiver can flip a private message.
    pub async fn mark_private_read(&self, message_id: i64, user_id: Uuid) -> HubResult<bool> {
        self.ensure_user(user_id).await?;

        let uid = user_id.to_string();
        let ts = to_db_time(&Utc::now());
        let sender = blocking(&self.db, move |db| {
            if !db.mark_private_read(message_id, &uid, &ts)? {
                return Ok(None);
            }
            db.get_private_message(message_id)?
                .map(|row| parse_user(&row.sender_id))
                .transpose()
        })
        .await?;

        Ok(self.notify_sender(sender, message_id, MessageKind::Private))
    }

    /// Everything `sender_id` sent to `reader_id` becomes read. The sender
    /// hears about each message that actually flipped.
    pub async fn mark_conversation_read(&self, reader_id: Uuid, sender_id: Uuid) -> HubResult<usize> {
        self.ensure_user(reader_id).await?;

        let rid = reader_id.to_string();
        let sid = sender_id.to_string();
        let ts = to_db_time(&Utc::now());
        let ids = blocking(&self.db, move |db| db.mark_conversation_read(&rid, &sid, &ts)).await?;

        for message_id in &ids {
            self.registry.send_to_user(
                sender_id,
                HubEvent::MessageRead {
                    message_id: *message_id,
                    message_type: MessageKind::Private,
                },
            );
        }
        debug!("{} read {} messages from {}", reader_id, ids.len(), sender_id);
        Ok(ids.len())
    }

    /// Every unread room message of the reader becomes read.
    pub async fn mark_room_read(&self, reader_id: Uuid, room_id: &str) -> HubResult<usize> {
        validate_room_id(room_id, self.max_room_id_len)?;
        self.ensure_user(reader_id).await?;

        let rid = reader_id.to_string();
        let room = room_id.to_string();
        let ts = to_db_time(&Utc::now());
        let count = blocking(&self.db, move |db| db.mark_room_read(&rid, &room, &ts)).await?;

        debug!("{} read {} messages in '{}'", reader_id, count, room_id);
        Ok(count)
    }

    async fn ensure_user(&self, user_id: Uuid) -> HubResult<()> {
        let uid = user_id.to_string();
        if blocking(&self.db, move |db| db.user_exists(&uid)).await? {
            Ok(())
        } else {
            Err(HubError::UnknownRecipient(user_id))
        }
    }

    fn notify_sender(&self, sender: Option<Uuid>, message_id: i64, kind: MessageKind) -> bool {
        let Some(sender) = sender else {
            return false;
        };

        let delivered = self.registry.send_to_user(
            sender,
            HubEvent::MessageRead {
                message_id,
                message_type: kind,
            },
        );
        debug!("{} message {} read, {} sender connections told", kind, message_id, delivered);
        true
    }
}

fn parse_user(raw: &str) -> anyhow::Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt sender id '{}'", raw))
}
