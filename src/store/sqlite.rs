//! SQLite-backed [`MailStore`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use super::{MailStore, StoreError};
use crate::model::{Address, Attachment, MailboxStats, Message};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT UNIQUE NOT NULL,
    recipient TEXT NOT NULL,
    sender TEXT NOT NULL,
    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT NOT NULL,
    attachments TEXT NOT NULL,
    received_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS addresses (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT UNIQUE NOT NULL,
    domain TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient);
CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at);
CREATE INDEX IF NOT EXISTS idx_addresses_expires ON addresses(expires_at);
";

const MESSAGE_COLUMNS: &str = "id, recipient, sender, subject, body_text, body_html, \
                               attachments, received_at, expires_at, is_read";

/// A single SQLite connection shared behind a mutex.
///
/// Statements run on the blocking pool so async callers never stall the
/// runtime while SQLite does I/O.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.as_ref().display(), journal_mode = %mode, "opened database");
        Self::with_connection(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

struct MessageRow {
    id: String,
    recipient: String,
    sender: String,
    subject: String,
    body_text: String,
    body_html: String,
    attachments: String,
    received_at: i64,
    expires_at: i64,
    is_read: bool,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            recipient: row.get(1)?,
            sender: row.get(2)?,
            subject: row.get(3)?,
            body_text: row.get(4)?,
            body_html: row.get(5)?,
            attachments: row.get(6)?,
            received_at: row.get(7)?,
            expires_at: row.get(8)?,
            is_read: row.get(9)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        let attachments: Vec<Attachment> = serde_json::from_str(&self.attachments)?;
        Ok(Message {
            received_at: from_millis(self.received_at)?,
            expires_at: from_millis(self.expires_at)?,
            id: self.id,
            recipient: self.recipient,
            sender: self.sender,
            subject: self.subject,
            body_text: self.body_text,
            body_html: self.body_html,
            attachments,
            is_read: self.is_read,
        })
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

#[async_trait]
impl MailStore for SqliteStore {
    async fn create_address(&self, address: &Address) -> Result<(), StoreError> {
        let address = address.clone();
        self.run(move |conn| {
            let result = conn.execute(
                "INSERT INTO addresses (address, domain, created_at, expires_at, last_accessed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    address.value,
                    address.domain,
                    address.created_at.timestamp_millis(),
                    address.expires_at.timestamp_millis(),
                    address.last_accessed_at.timestamp_millis(),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                    Err(StoreError::Duplicate(address.value))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn touch_address_access(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let address = address.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE addresses SET last_accessed_at = ?1 WHERE address = ?2",
                params![now.timestamp_millis(), address],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_expired_addresses(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM addresses WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let message = message.clone();
        self.run(move |conn| {
            let attachments = serde_json::to_string(&message.attachments)?;
            let result = conn.execute(
                "INSERT INTO messages (id, recipient, sender, subject, body_text, body_html,
                                       attachments, received_at, expires_at, is_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.recipient,
                    message.sender,
                    message.subject,
                    message.body_text,
                    message.body_html,
                    attachments,
                    message.received_at.timestamp_millis(),
                    message.expires_at.timestamp_millis(),
                    message.is_read,
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                    Err(StoreError::Duplicate(message.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn messages_for_recipient(
        &self,
        address: &str,
        not_expired_as_of: DateTime<Utc>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let address = address.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE recipient = ?1 AND expires_at > ?2
                 ORDER BY received_at DESC, seq DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt
                .query_map(
                    params![address, not_expired_as_of.timestamp_millis(), limit, offset],
                    MessageRow::read,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(MessageRow::into_message).collect()
        })
        .await
    }

    async fn message_by_id(
        &self,
        address: &str,
        id_prefix: &str,
        not_expired_as_of: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        if id_prefix.is_empty() {
            return Ok(None);
        }
        let address = address.to_owned();
        let id_prefix = id_prefix.to_owned();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE recipient = ?1
                           AND substr(id, 1, length(?2)) = ?2
                           AND expires_at > ?3
                         ORDER BY seq
                         LIMIT 1"
                    ),
                    params![address, id_prefix, not_expired_as_of.timestamp_millis()],
                    MessageRow::read,
                )
                .optional()?;
            row.map(MessageRow::into_message).transpose()
        })
        .await
    }

    async fn mark_message_read(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_owned();
        self.run(move |conn| {
            let changed = conn.execute("UPDATE messages SET is_read = 1 WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_message(&self, address: &str, id_prefix: &str) -> Result<u64, StoreError> {
        if id_prefix.is_empty() {
            return Ok(0);
        }
        let address = address.to_owned();
        let id_prefix = id_prefix.to_owned();
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE recipient = ?1 AND substr(id, 1, length(?2)) = ?2",
                params![address, id_prefix],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn delete_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn stats(
        &self,
        address: &str,
        not_expired_as_of: DateTime<Utc>,
    ) -> Result<MailboxStats, StoreError> {
        let address = address.to_owned();
        self.run(move |conn| {
            let (total, unread, first, last): (i64, i64, Option<i64>, Option<i64>) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END), 0),
                            MIN(received_at),
                            MAX(received_at)
                     FROM messages
                     WHERE recipient = ?1 AND expires_at > ?2",
                    params![address, not_expired_as_of.timestamp_millis()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            Ok(MailboxStats {
                total: total as u64,
                unread: unread as u64,
                first_received_at: first.map(from_millis).transpose()?,
                last_received_at: last.map(from_millis).transpose()?,
            })
        })
        .await
    }
}
