use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                is_online     INTEGER NOT NULL DEFAULT 0,
                last_seen     TEXT NOT NULL,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE user_connections (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                connection_id  TEXT NOT NULL UNIQUE,
                connected_at   TEXT NOT NULL,
                is_active      INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX idx_connections_user_active
                ON user_connections(user_id, is_active);

            CREATE TABLE group_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id    TEXT NOT NULL REFERENCES users(id),
                sender_name  TEXT NOT NULL,
                text         TEXT NOT NULL,
                room_id      TEXT NOT NULL,
                timestamp    TEXT NOT NULL
            );

            CREATE INDEX idx_group_messages_room
                ON group_messages(room_id, timestamp);

            CREATE TABLE private_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id    TEXT NOT NULL REFERENCES users(id),
                receiver_id  TEXT NOT NULL REFERENCES users(id),
                text         TEXT NOT NULL,
                timestamp    TEXT NOT NULL,
                is_read      INTEGER NOT NULL DEFAULT 0,
                read_at      TEXT
            );

            CREATE INDEX idx_private_messages_pair
                ON private_messages(sender_id, receiver_id);
            CREATE INDEX idx_private_messages_unread
                ON private_messages(receiver_id, is_read);
            CREATE INDEX idx_private_messages_time
                ON private_messages(timestamp);

            CREATE TABLE message_read_status (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id    INTEGER NOT NULL,
                user_id       TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                message_type  TEXT NOT NULL,
                is_read       INTEGER NOT NULL DEFAULT 0,
                read_at       TEXT,
                UNIQUE(message_id, user_id, message_type)
            );

            CREATE INDEX idx_read_status_user
                ON message_read_status(user_id, message_type, is_read);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }
}
