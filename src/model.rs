//! Records owned by the store: generated addresses and received messages.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display sender used when neither the `From` header nor the envelope names one.
pub const UNKNOWN_SENDER: &str = "unknown@sender.invalid";

/// Separator between the transaction root and the recipient in a message id.
pub const ID_SEPARATOR: char = '-';

/// A disposable address handed out by the inbox service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    /// Lower-case `local@domain`.
    pub value: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl Address {
    /// Create an address record valid for `window` from `now`.
    pub fn new(local: &str, domain: &str, now: DateTime<Utc>, window: Duration) -> Self {
        let domain = domain.to_ascii_lowercase();
        Self {
            value: format!("{}@{}", local.to_ascii_lowercase(), domain),
            domain,
            created_at: now,
            expires_at: now + window,
            last_accessed_at: now,
        }
    }
}

/// A decoded attachment, stored inline as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub content_base64: String,
}

/// One recipient's copy of an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub recipient: String,
    pub sender: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_read: bool,
}

impl Message {
    /// The transaction root shared by every copy of this message.
    pub fn transaction_root(&self) -> &str {
        self.id
            .split_once(ID_SEPARATOR)
            .map(|(root, _)| root)
            .unwrap_or(&self.id)
    }
}

/// Aggregate counters for one mailbox, computed over live messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub total: u64,
    pub unread: u64,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

/// Identity root generated once per SMTP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphen-less root, so the first separator in a message id always ends it.
    pub fn root(&self) -> String {
        self.0.simple().to_string()
    }

    /// Storage key for the copy delivered to `recipient`.
    pub fn message_id(&self, recipient: &str) -> String {
        format!("{}{}{}", self.root(), ID_SEPARATOR, recipient)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.root())
    }
}

/// Split a lower-cased `local@domain` into its parts.
///
/// Returns `None` unless both parts are non-empty and the domain contains
/// no further `@` or whitespace.
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    if local.chars().any(char::is_whitespace) || domain.chars().any(char::is_whitespace) {
        return None;
    }
    Some((local, domain))
}
