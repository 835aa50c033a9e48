use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;

use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{HubError, HubResult};

/// Process-local room membership of live connections.
#[derive(Default)]
pub struct RoomMembership {
    by_connection: DashMap<Uuid, HashSet<String>>,
    by_room: DashMap<String, HashSet<Uuid>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the connection was already a member.
    pub fn join(&self, connection_id: Uuid, room_id: &str) -> bool {
        let newly_joined = self
            .by_connection
            .entry(connection_id)
            .or_default()
            .insert(room_id.to_string());

        if newly_joined {
            self.by_room
                .entry(room_id.to_string())
                .or_default()
                .insert(connection_id);
        }
        newly_joined
    }

    pub fn leave(&self, connection_id: Uuid, room_id: &str) -> bool {
        let was_member = remove_member(&self.by_connection, &connection_id, room_id);
        if was_member {
            remove_member(&self.by_room, room_id, &connection_id);
        }
        was_member
    }

    pub fn connections_in_room(&self, room_id: &str) -> HashSet<Uuid> {
        self.by_room
            .get(room_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection_id: Uuid, room_id: &str) -> bool {
        self.by_connection
            .get(&connection_id)
            .is_some_and(|rooms| rooms.contains(room_id))
    }

    /// Rooms of a connection, sorted.
    pub fn rooms_of(&self, connection_id: Uuid) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .by_connection
            .get(&connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Drop every membership of a closing connection. Returns the rooms it left, sorted.
    pub fn release(&self, connection_id: Uuid) -> Vec<String> {
        let Some((_, rooms)) = self.by_connection.remove(&connection_id) else {
            return Vec::new();
        };

        let mut rooms: Vec<String> = rooms.into_iter().collect();
        rooms.sort();
        for room_id in &rooms {
            remove_member(&self.by_room, room_id.as_str(), &connection_id);
        }
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.by_room.len()
    }
}

/// Remove `member` from the set under `key` and drop the set once empty.
fn remove_member<K, Q, V, M>(map: &DashMap<K, HashSet<V>>, key: &Q, member: &M) -> bool
where
    K: Eq + Hash + Borrow<Q>,
    Q: Eq + Hash + ?Sized,
    V: Eq + Hash + Borrow<M>,
    M: Eq + Hash + ?Sized,
{
    let removed = match map.get_mut(key) {
        Some(mut set) => set.remove(member),
        None => false,
    };
    map.remove_if(key, |_, set| set.is_empty());
    removed
}

/// Room ids are opaque, non-blank and bounded in length.
pub fn validate_room_id(room_id: &str, max_len: usize) -> HubResult<()> {
    if room_id.trim().is_empty() {
        return Err(HubError::invalid("room id must not be empty"));
    }
    if room_id.chars().count() > max_len {
        return Err(HubError::invalid(format!(
            "room id exceeds {} characters",
            max_len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_are_idempotent() {
        let rooms = RoomMembership::new();
        let conn = Uuid::new_v4();

        assert!(rooms.join(conn, "general"));
        assert!(!rooms.join(conn, "general"));
        assert!(rooms.is_member(conn, "general"));

        assert!(rooms.leave(conn, "general"));
        assert!(!rooms.leave(conn, "general"));
        assert!(rooms.connections_in_room("general").is_empty());
        assert_eq!(rooms.room_count(), 0);
    }

    #[test]
    fn a_connection_can_sit_in_several_rooms() {
        let rooms = RoomMembership::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.join(a, "general");
        rooms.join(a, "random");
        rooms.join(b, "general");

        assert_eq!(rooms.rooms_of(a), vec!["general".to_string(), "random".to_string()]);
        assert_eq!(rooms.connections_in_room("general").len(), 2);

        assert_eq!(rooms.release(a), vec!["general".to_string(), "random".to_string()]);
        assert_eq!(rooms.connections_in_room("general"), HashSet::from([b]));
        assert!(rooms.connections_in_room("random").is_empty());
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.release(a).is_empty());
    }

    #[test]
    fn room_ids_are_validated() {
        assert!(validate_room_id("general", 100).is_ok());
        assert!(validate_room_id("  ", 100).is_err());
        assert!(validate_room_id(&"r".repeat(101), 100).is_err());
    }
}
