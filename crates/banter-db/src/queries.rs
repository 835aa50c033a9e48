use crate::Database;
use crate::models::{GroupMessageRow, PrivateMessageRow, ReadStatusRow, UserRow};
use anyhow::Result;
use rusqlite::{Connection, params};

const GROUP: &str = "group";

impl Database {
    // -- Users --

    /// Insert the user on first sight, refresh the names afterwards.
    pub fn upsert_user(&self, id: &str, username: &str, display_name: &str, now: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, display_name, is_online, last_seen)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    display_name = excluded.display_name",
                params![id, username, display_name, now],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                [id],
                |row| row.get(0),
            )?;
            Ok(found == 1)
        })
    }

    pub fn set_presence(&self, id: &str, online: bool, last_seen: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET is_online = ?2, last_seen = ?3 WHERE id = ?1",
                params![id, online, last_seen],
            )?;
            Ok(())
        })
    }

    /// Every user except `id`, online first, then by display name.
    pub fn list_users_except(&self, id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, display_name, is_online, last_seen
                 FROM users
                 WHERE id != ?1
                 ORDER BY is_online DESC, display_name ASC",
            )?;

            let rows = stmt
                .query_map([id], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Connections --

    pub fn insert_connection(&self, connection_id: &str, user_id: &str, connected_at: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO user_connections (user_id, connection_id, connected_at, is_active)
                 VALUES (?1, ?2, ?3, 1)",
                params![user_id, connection_id, connected_at],
            )?;
            Ok(())
        })
    }

    /// Returns false when the row was already inactive or never existed.
    pub fn deactivate_connection(&self, connection_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE user_connections SET is_active = 0
                 WHERE connection_id = ?1 AND is_active = 1",
                [connection_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Rows left active by a previous process can never be closed by it.
    pub fn deactivate_all_connections(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE user_connections SET is_active = 0 WHERE is_active = 1",
                [],
            )?;
            conn.execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
            Ok(changed)
        })
    }

    pub fn count_active_connections(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM user_connections WHERE user_id = ?1 AND is_active = 1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    // -- Group messages --

    /// Store a group message together with one unread status row per
    /// recipient. Both land in one transaction or neither does.
    pub fn insert_group_message(
        &self,
        sender_id: &str,
        sender_name: &str,
        room_id: &str,
        text: &str,
        timestamp: &str,
        recipients: &[String],
    ) -> Result<i64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "INSERT INTO group_messages (sender_id, sender_name, text, room_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sender_id, sender_name, text, room_id, timestamp],
            )?;
            let message_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO message_read_status (message_id, user_id, message_type, is_read)
                     VALUES (?1, ?2, ?3, 0)",
                )?;
                for user_id in recipients {
                    stmt.execute(params![message_id, user_id, GROUP])?;
                }
            }

            tx.commit()?;
            Ok(message_id)
        })
    }

    pub fn get_group_message(&self, id: i64) -> Result<Option<GroupMessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, sender_id, sender_name, text, room_id, timestamp
                 FROM group_messages WHERE id = ?1",
                [id],
                map_group_message,
            )
            .optional()
        })
    }

    /// Up to `limit` messages of a room older than `before`, oldest first.
    pub fn get_room_messages(&self, room_id: &str, limit: u32, before: Option<i64>) -> Result<Vec<GroupMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, sender_name, text, room_id, timestamp
                 FROM group_messages
                 WHERE room_id = ?1 AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;

            let mut rows = stmt
                .query_map(params![room_id, before, limit], map_group_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();

            Ok(rows)
        })
    }

    pub fn get_read_statuses(&self, message_id: i64) -> Result<Vec<ReadStatusRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, user_id, message_type, is_read, read_at
                 FROM message_read_status
                 WHERE message_id = ?1 AND message_type = ?2
                 ORDER BY user_id",
            )?;

            let rows = stmt
                .query_map(params![message_id, GROUP], |row| {
                    Ok(ReadStatusRow {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        message_type: row.get(2)?,
                        is_read: row.get(3)?,
                        read_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Flip one group status row to read. Only the caller that performs the
    /// 0 -> 1 update gets `true`; repeats and missing rows get `false`.
    pub fn mark_group_read(&self, message_id: i64, user_id: &str, read_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE message_read_status SET is_read = 1, read_at = ?4
                 WHERE message_id = ?1 AND user_id = ?2 AND message_type = ?3 AND is_read = 0",
                params![message_id, user_id, GROUP, read_at],
            )?;
            Ok(changed == 1)
        })
    }

    /// Mark every unread group status of `user_id` in `room_id` as read.
    pub fn mark_room_read(&self, user_id: &str, room_id: &str, read_at: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE message_read_status SET is_read = 1, read_at = ?4
                 WHERE user_id = ?1 AND message_type = ?3 AND is_read = 0
                   AND message_id IN (SELECT id FROM group_messages WHERE room_id = ?2)",
                params![user_id, room_id, GROUP, read_at],
            )?;
            Ok(changed)
        })
    }

    pub fn count_group_unread(&self, user_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM message_read_status
                 WHERE user_id = ?1 AND message_type = ?2 AND is_read = 0",
                params![user_id, GROUP],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    // -- Private messages --

    pub fn insert_private_message(&self, sender_id: &str, receiver_id: &str, text: &str, timestamp: &str) -> Result<i64> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO private_messages (sender_id, receiver_id, text, timestamp, is_read)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![sender_id, receiver_id, text, timestamp],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_private_message(&self, id: i64) -> Result<Option<PrivateMessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT p.id, p.sender_id, p.receiver_id, COALESCE(u.display_name, 'unknown'),
                        p.text, p.timestamp, p.is_read, p.read_at
                 FROM private_messages p
                 LEFT JOIN users u ON p.sender_id = u.id
                 WHERE p.id = ?1",
                [id],
                map_private_message,
            )
            .optional()
        })
    }

    /// Same contract as `mark_group_read`, restricted to the designated receiver.
    pub fn mark_private_read(&self, id: i64, receiver_id: &str, read_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE private_messages SET is_read = 1, read_at = ?3
                 WHERE id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![id, receiver_id, read_at],
            )?;
            Ok(changed == 1)
        })
    }

    /// Mark everything `sender_id` sent to `receiver_id` as read.
    /// Returns the ids that actually transitioned.
    pub fn mark_conversation_read(&self, receiver_id: &str, sender_id: &str, read_at: &str) -> Result<Vec<i64>> {
        self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "UPDATE private_messages SET is_read = 1, read_at = ?3
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0
                 RETURNING id",
            )?;

            let mut ids = stmt
                .query_map(params![receiver_id, sender_id, read_at], |row| row.get(0))?
                .collect::<std::result::Result<Vec<i64>, _>>()?;
            ids.sort_unstable();

            Ok(ids)
        })
    }

    /// One page of the conversation between two users, oldest first.
    pub fn get_conversation(&self, user_a: &str, user_b: &str, limit: u32, offset: u32) -> Result<Vec<PrivateMessageRow>> {
        self.with_conn(|conn| query_conversation(conn, user_a, user_b, limit, offset))
    }

    pub fn last_message_between(&self, user_a: &str, user_b: &str) -> Result<Option<PrivateMessageRow>> {
        self.with_conn(|conn| Ok(query_conversation(conn, user_a, user_b, 1, 0)?.pop()))
    }

    pub fn count_private_unread(&self, receiver_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM private_messages WHERE receiver_id = ?1 AND is_read = 0",
                [receiver_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    pub fn count_private_unread_from(&self, receiver_id: &str, sender_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM private_messages
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
                params![receiver_id, sender_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn query_user(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    conn.query_row(
        "SELECT id, username, display_name, is_online, last_seen FROM users WHERE id = ?1",
        [id],
        map_user,
    )
    .optional()
}

fn query_conversation(
    conn: &Connection,
    user_a: &str,
    user_b: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<PrivateMessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT p.id, p.sender_id, p.receiver_id, COALESCE(u.display_name, 'unknown'),
                p.text, p.timestamp, p.is_read, p.read_at
         FROM private_messages p
         LEFT JOIN users u ON p.sender_id = u.id
         WHERE (p.sender_id = ?1 AND p.receiver_id = ?2)
            OR (p.sender_id = ?2 AND p.receiver_id = ?1)
         ORDER BY p.id DESC
         LIMIT ?3 OFFSET ?4",
    )?;

    let mut rows = stmt
        .query_map(params![user_a, user_b, limit, offset], map_private_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.reverse();

    Ok(rows)
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        is_online: row.get(3)?,
        last_seen: row.get(4)?,
    })
}

fn map_group_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMessageRow> {
    Ok(GroupMessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_name: row.get(2)?,
        text: row.get(3)?,
        room_id: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

fn map_private_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrivateMessageRow> {
    Ok(PrivateMessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        sender_name: row.get(3)?,
        text: row.get(4)?,
        timestamp: row.get(5)?,
        is_read: row.get(6)?,
        read_at: row.get(7)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
