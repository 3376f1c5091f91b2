use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use rusqlite::{Connection, Row};

use crate::models::{MessageRow, ReactionRow, ToggleOutcome};
use crate::{Database, Result, Store, StoreError};

/// Fixed-width UTC timestamps, so `ORDER BY timestamp` is chronological.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

impl Store for Database {
    fn list_messages_for_viewer(&self, viewer: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut messages = query_messages_for_viewer(conn, viewer)?;
            let mut reactions = query_reactions_for_viewer(conn, viewer)?;

            for message in &mut messages {
                if let Some(rows) = reactions.remove(&message.id) {
                    message.reactions = rows;
                }
            }

            Ok(messages)
        })
    }

    fn insert_message(&self, sender: &str, recipient: Option<&str>, body: &str) -> Result<MessageRow> {
        self.with_conn(|conn| {
            // Taken under the lock, at stored precision
            let now = Utc::now().trunc_subsecs(6);
            conn.execute(
                "INSERT INTO messages (sender, receiver, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![sender, recipient, body, format_timestamp(&now)],
            )?;

            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                sender: sender.to_string(),
                receiver: recipient.map(str::to_string),
                message: body.to_string(),
                timestamp: now,
                reactions: vec![],
            })
        })
    }

    fn toggle_reaction(&self, message_id: i64, emoji: &str, user: &str) -> Result<ToggleOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            // At most one row per (message, user), enforced by the schema
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, emoji FROM reactions WHERE message_id = ?1 AND user = ?2",
                    rusqlite::params![message_id, user],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let outcome = match existing {
                Some((id, current)) if current == emoji => {
                    tx.execute("DELETE FROM reactions WHERE id = ?1", [id])?;
                    ToggleOutcome::Removed
                }
                Some((id, _)) => {
                    tx.execute("DELETE FROM reactions WHERE id = ?1", [id])?;
                    insert_reaction(&tx, message_id, emoji, user)?;
                    ToggleOutcome::Replaced
                }
                None => {
                    insert_reaction(&tx, message_id, emoji, user)?;
                    ToggleOutcome::Added
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    fn list_reactions(&self, message_id: i64) -> Result<Vec<ReactionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, emoji, user, timestamp
                 FROM reactions
                 WHERE message_id = ?1
                 ORDER BY timestamp ASC, id ASC",
            )?;

            let rows = stmt
                .query_map([message_id], raw_reaction)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(RawReaction::into_row).collect()
        })
    }
}

fn insert_reaction(conn: &Connection, message_id: i64, emoji: &str, user: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO reactions (message_id, emoji, user, timestamp) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![message_id, emoji, user, format_timestamp(&Utc::now())],
    )?;
    Ok(())
}

fn query_messages_for_viewer(conn: &Connection, viewer: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, receiver, message, timestamp
         FROM messages
         WHERE receiver IS NULL OR sender = ?1 OR receiver = ?1
         ORDER BY timestamp ASC, id ASC",
    )?;

    let raw = stmt
        .query_map([viewer], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, sender, receiver, message, timestamp)| {
            Ok(MessageRow {
                id,
                sender,
                receiver,
                message,
                timestamp: parse_timestamp(&timestamp)?,
                reactions: vec![],
            })
        })
        .collect()
}

/// Reactions on every message the viewer can see, grouped by message id.
/// JOINs messages so the visibility rule lives in one place per query.
fn query_reactions_for_viewer(conn: &Connection, viewer: &str) -> Result<HashMap<i64, Vec<ReactionRow>>> {
    let mut stmt = conn.prepare(
        "SELECT r.id, r.message_id, r.emoji, r.user, r.timestamp
         FROM reactions r
         JOIN messages m ON m.id = r.message_id
         WHERE m.receiver IS NULL OR m.sender = ?1 OR m.receiver = ?1
         ORDER BY r.timestamp ASC, r.id ASC",
    )?;

    let raw = stmt
        .query_map([viewer], raw_reaction)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<i64, Vec<ReactionRow>> = HashMap::new();
    for r in raw {
        let row = r.into_row()?;
        grouped.entry(row.message_id).or_default().push(row);
    }
    Ok(grouped)
}

/// A reaction row with its timestamp still in text form.
struct RawReaction {
    id: i64,
    message_id: i64,
    emoji: String,
    user: String,
    timestamp: String,
}

impl RawReaction {
    fn into_row(self) -> Result<ReactionRow> {
        Ok(ReactionRow {
            id: self.id,
            message_id: self.message_id,
            emoji: self.emoji,
            user: self.user,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

fn raw_reaction(row: &Row<'_>) -> rusqlite::Result<RawReaction> {
    Ok(RawReaction {
        id: row.get(0)?,
        message_id: row.get(1)?,
        emoji: row.get(2)?,
        user: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|ndt| ndt.and_utc())
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{text}': {e}")))
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
