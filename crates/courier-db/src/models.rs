//! Database row types, mapping directly to SQLite rows.
//! Distinct from courier-types wire models to keep the DB layer independent.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub id: i64,
    pub sender: String,
    pub receiver: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Filled by the history query; empty for a freshly inserted message.
    pub reactions: Vec<ReactionRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionRow {
    pub id: i64,
    pub message_id: i64,
    pub emoji: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

/// What a reaction toggle did to the `(message, user)` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Added,
    Removed,
    /// The user had reacted with a different emoji; that row was swapped out.
    Replaced,
}
