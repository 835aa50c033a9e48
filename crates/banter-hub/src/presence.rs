use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use uuid::Uuid;

use banter_db::{Database, from_db_time, to_db_time};
use banter_types::events::HubEvent;

use crate::blocking;
use crate::error::HubResult;
use crate::registry::ConnectionRegistry;

/// Online state is read from the registry; `users.is_online` is a cache
/// kept for listings.
///
/// Flips for one user run one at a time and are decided from the registry
/// as it is when the flip runs, so the last announcement always matches it.
pub struct PresenceService {
    registry: Arc<ConnectionRegistry>,
    db: Arc<Database>,
    last_seen: DashMap<Uuid, DateTime<Utc>>,
    announced: DashSet<Uuid>,
    flips: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PresenceService {
    pub fn new(registry: Arc<ConnectionRegistry>, db: Arc<Database>) -> Self {
        Self {
            registry,
            db,
            last_seen: DashMap::new(),
            announced: DashSet::new(),
            flips: DashMap::new(),
        }
    }

    /// Stamp last-seen and announce the user online unless already announced.
    /// Returns true when the user flipped online.
    pub async fn on_connect(&self, user_id: Uuid, display_name: &str) -> HubResult<bool> {
        let _flip = self.flip(user_id).await;

        // Gone again before we got here; the pending disconnect settles it
        if !self.registry.is_connected(user_id) {
            return Ok(false);
        }

        let now = Utc::now();
        self.last_seen.insert(user_id, now);

        let uid = user_id.to_string();
        let ts = to_db_time(&now);
        blocking(&self.db, move |db| db.set_presence(&uid, true, &ts)).await?;

        if !self.announced.insert(user_id) {
            return Ok(false);
        }

        info!("{} ({}) is online", display_name, user_id);
        self.registry.broadcast(&HubEvent::PresenceUpdate {
            user_id,
            display_name: display_name.to_string(),
            online: true,
            last_seen: now,
        });
        Ok(true)
    }

    /// Flip offline only if no connection of the user is left right now.
    /// Returns true when the user flipped offline.
    pub async fn on_disconnect(&self, user_id: Uuid, display_name: &str) -> HubResult<bool> {
        let _flip = self.flip(user_id).await;

        if self.registry.is_connected(user_id) {
            return Ok(false);
        }

        let now = Utc::now();
        self.last_seen.insert(user_id, now);

        let uid = user_id.to_string();
        let ts = to_db_time(&now);
        blocking(&self.db, move |db| db.set_presence(&uid, false, &ts)).await?;

        if self.announced.remove(&user_id).is_none() {
            return Ok(false);
        }

        info!("{} ({}) is offline", display_name, user_id);
        self.registry.broadcast(&HubEvent::PresenceUpdate {
            user_id,
            display_name: display_name.to_string(),
            online: false,
            last_seen: now,
        });
        Ok(true)
    }

    async fn flip(&self, user_id: Uuid) -> Flip<'_> {
        let lock = self.flips.entry(user_id).or_default().clone();
        let mut flip = Flip {
            flips: &self.flips,
            user_id,
            guard: None,
        };
        flip.guard = Some(lock.lock_owned().await);
        flip
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.registry.is_connected(user_id)
    }

    /// Falls back to storage for users this process has not seen.
    pub async fn last_seen(&self, user_id: Uuid) -> HubResult<Option<DateTime<Utc>>> {
        if let Some(seen) = self.last_seen.get(&user_id) {
            return Ok(Some(*seen));
        }

        let uid = user_id.to_string();
        let stored = blocking(&self.db, move |db| {
            db.get_user(&uid)?
                .map(|row| from_db_time(&row.last_seen))
                .transpose()
        })
        .await?;
        Ok(stored)
    }
}

/// Turn at flipping one user's presence. Frees the lock entry when idle.
struct Flip<'a> {
    flips: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    user_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flip<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.flips
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
