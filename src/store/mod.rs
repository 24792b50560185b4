//! Durable record store shared by SMTP intake, the sweeper and the inbox.
//!
//! Every operation is a single statement, so each insert, update or delete
//! is atomic on its own. Nothing here spans more than one statement.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Address, MailboxStats, Message};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database handle poisoned")]
    Poisoned,

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Operations the mail engine and the query facade need from storage.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Insert a generated address. Fails with [`StoreError::Duplicate`] if the value exists.
    async fn create_address(&self, address: &Address) -> Result<(), StoreError>;

    /// Record an inbox read. Returns `false` when no such address row exists.
    async fn touch_address_access(
        &self,
        address: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete addresses with `expires_at <= now`, returning how many were removed.
    async fn delete_expired_addresses(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Live messages for `address`, newest first.
    async fn messages_for_recipient(
        &self,
        address: &str,
        not_expired_as_of: DateTime<Utc>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// First live message for `address` whose id starts with `id_prefix`.
    async fn message_by_id(
        &self,
        address: &str,
        id_prefix: &str,
        not_expired_as_of: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError>;

    async fn mark_message_read(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete every message for `address` whose id starts with `id_prefix`.
    async fn delete_message(&self, address: &str, id_prefix: &str) -> Result<u64, StoreError>;

    /// Delete messages with `expires_at <= now`, returning how many were removed.
    async fn delete_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn stats(
        &self,
        address: &str,
        not_expired_as_of: DateTime<Utc>,
    ) -> Result<MailboxStats, StoreError>;
}
