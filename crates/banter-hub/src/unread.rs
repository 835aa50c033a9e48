use std::sync::Arc;

use uuid::Uuid;

use banter_db::Database;
use banter_types::models::UnreadCounts;

use crate::blocking;
use crate::error::HubResult;

/// Unread badges, computed from storage on every call.
pub struct UnreadCounter {
    db: Arc<Database>,
}

impl UnreadCounter {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get_counts(&self, user_id: Uuid) -> HubResult<UnreadCounts> {
        let uid = user_id.to_string();
        blocking(&self.db, move |db| {
            Ok(UnreadCounts {
                group_unread: db.count_group_unread(&uid)?,
                private_unread: db.count_private_unread(&uid)?,
            })
        })
        .await
    }

    /// Unread private messages from one sender.
    pub async fn unread_from(&self, receiver_id: Uuid, sender_id: Uuid) -> HubResult<u64> {
        let rid = receiver_id.to_string();
        let sid = sender_id.to_string();
        blocking(&self.db, move |db| db.count_private_unread_from(&rid, &sid)).await
    }
}
