use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            sender      TEXT NOT NULL,
            receiver    TEXT,
            message     TEXT NOT NULL,
            timestamp   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_timestamp
            ON messages(timestamp, id);

        CREATE TABLE IF NOT EXISTS reactions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            emoji       TEXT NOT NULL,
            user        TEXT NOT NULL,
            timestamp   TEXT NOT NULL,
            UNIQUE(message_id, user)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id, timestamp);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
