use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use banter_types::events::HubEvent;

/// Outbound half of a connection's event channel.
pub type EventSender = mpsc::UnboundedSender<HubEvent>;

struct ConnectionEntry {
    user_id: Uuid,
    display_name: String,
    connected_at: DateTime<Utc>,
    tx: EventSender,
}

/// What `disconnect` removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub user_id: Uuid,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
    /// No other connection of the user remains
    pub was_last: bool,
}

/// Live connections and the user each one belongs to.
///
/// Both maps are sharded; the per-user connection set is only changed
/// through its map entry, so "first" and "last" are decided atomically
/// per user without a global lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, ConnectionEntry>,
    by_user: DashMap<Uuid, HashSet<Uuid>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true when it is the user's first.
    pub fn connect(&self, connection_id: Uuid, user_id: Uuid, display_name: &str, tx: EventSender) -> bool {
        let mut conns = self.by_user.entry(user_id).or_default();
        let first = conns.is_empty();
        conns.insert(connection_id);

        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                display_name: display_name.to_string(),
                connected_at: Utc::now(),
                tx,
            },
        );

        first
    }

    /// Unknown or already removed connections yield `None`.
    pub fn disconnect(&self, connection_id: Uuid) -> Option<Disconnected> {
        let (_, entry) = self.connections.remove(&connection_id)?;

        let was_last = match self.by_user.entry(entry.user_id) {
            Entry::Occupied(mut conns) => {
                conns.get_mut().remove(&connection_id);
                if conns.get().is_empty() {
                    conns.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };

        Some(Disconnected {
            user_id: entry.user_id,
            display_name: entry.display_name,
            connected_at: entry.connected_at,
            was_last,
        })
    }

    pub fn active_connections(&self, user_id: Uuid) -> HashSet<Uuid> {
        self.by_user
            .get(&user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.by_user.get(&user_id).is_some_and(|conns| !conns.is_empty())
    }

    pub fn online_users(&self) -> HashSet<Uuid> {
        self.by_user
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn user_of(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connections.get(&connection_id).map(|entry| entry.user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Push one event. A closed or unknown connection is not an error.
    pub fn send(&self, connection_id: Uuid, event: HubEvent) -> bool {
        let Some(entry) = self.connections.get(&connection_id) else {
            debug!("Dropping event for unknown connection {}", connection_id);
            return false;
        };

        if entry.tx.send(event).is_err() {
            debug!("Connection {} of {} is gone, event dropped", connection_id, entry.user_id);
            return false;
        }
        true
    }

    /// Push to every live connection of a user. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: Uuid, event: HubEvent) -> usize {
        self.send_to_all(self.active_connections(user_id), &event)
    }

    pub fn send_to_all(&self, targets: impl IntoIterator<Item = Uuid>, event: &HubEvent) -> usize {
        targets
            .into_iter()
            .filter(|conn| self.send(*conn, event.clone()))
            .count()
    }

    pub fn broadcast(&self, event: &HubEvent) -> usize {
        let targets: Vec<Uuid> = self.connections.iter().map(|entry| *entry.key()).collect();
        self.send_to_all(targets, event)
    }
}
