//! Durable chat message log.
//!
//! Every routed chat or file message is appended here off the delivery path.
//! Appends are fire-and-forget: a failure is logged and never reaches the client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use crate::db::{self, DbPool, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown message type `{0}`")]
pub struct UnknownMessageKind(String);

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "file" => Ok(Self::File),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sender: String,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(sender: &str, content: &str, kind: MessageKind) -> Self {
        Self {
            sender: sender.to_string(),
            content: content.to_string(),
            kind,
            sent_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError>;

    /// Most recent entries, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError>;
}

/// Append without waiting. Failures are logged and swallowed.
pub fn append_detached(log: Arc<dyn MessageLog>, entry: LogEntry) {
    tokio::spawn(async move {
        let sender = entry.sender.clone();
        if let Err(e) = log.append(entry).await {
            tracing::warn!(sender = %sender, error = %e, "Failed to persist chat message");
        }
    });
}

/// Bounded in-process log keeping the newest `capacity` entries.
#[derive(Debug)]
pub struct InMemoryMessageLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl InMemoryMessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.entries.lock().iter().rev().take(limit).cloned().collect())
    }
}

/// Log backed by the `chat_messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageLog {
    db: DbPool,
}

impl SqliteMessageLog {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageLog for SqliteMessageLog {
    async fn append(&self, entry: LogEntry) -> Result<(), StoreError> {
        db::with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO chat_messages (sender, content, message_type, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    entry.sender,
                    entry.content,
                    entry.kind.as_str(),
                    entry.sent_at.to_rfc3339_opts(SecondsFormat::Micros, true)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEntry>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        db::with_conn(&self.db, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sender, content, message_type, sent_at FROM chat_messages
                 ORDER BY sent_at DESC, id DESC LIMIT ?1",
            )?;
            let entries = stmt
                .query_map(rusqlite::params![limit], |row| {
                    let kind: String = row.get(2)?;
                    let sent_at: String = row.get(3)?;
                    Ok(LogEntry {
                        sender: row.get(0)?,
                        content: row.get(1)?,
                        kind: kind.parse().map_err(|e: UnknownMessageKind| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                        })?,
                        sent_at: DateTime::parse_from_rfc3339(&sent_at)
                            .map(|t| t.with_timezone(&Utc))
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                            })?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}
