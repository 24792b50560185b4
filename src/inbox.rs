//! Read side of the service: address generation and mailbox queries.

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domains::DomainPolicy;
use crate::model::{split_address, Address, MailboxStats, Message};
use crate::store::{MailStore, StoreError};

/// Length of the random local part of a generated address.
const LOCAL_PART_LEN: usize = 12;

/// Collisions on a 48-bit random local part are rare; retry a few times.
const GENERATE_ATTEMPTS: usize = 3;

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Domain not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("Email not found")]
    NotFound,

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub domains: DomainPolicy,
    /// Lifetime of a generated address record
    pub address_ttl: Duration,
    /// Default and maximum page size for listings
    pub max_messages_per_page: u32,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            domains: DomainPolicy::open(),
            address_ttl: Duration::hours(24),
            max_messages_per_page: 50,
        }
    }
}

/// Query facade over a [`MailStore`].
#[derive(Clone)]
pub struct Inbox {
    store: Arc<dyn MailStore>,
    config: Arc<InboxConfig>,
}

impl Inbox {
    pub fn new(store: Arc<dyn MailStore>, config: InboxConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Domains addresses can be generated for.
    pub fn domains(&self) -> &[String] {
        self.config.domains.domains()
    }

    /// Create and persist a fresh address on `domain`.
    ///
    /// The domain must be on the allow-list; nothing is written otherwise.
    pub async fn generate_address(&self, domain: &str) -> Result<Address, InboxError> {
        let domain = self.generation_domain(domain)?;

        for _ in 0..GENERATE_ATTEMPTS {
            let address = Address::new(
                &random_local_part(),
                &domain,
                Utc::now(),
                self.config.address_ttl,
            );
            match self.store.create_address(&address).await {
                Ok(()) => {
                    info!(address = %address.value, "generated address");
                    return Ok(address);
                }
                Err(StoreError::Duplicate(value)) => {
                    debug!(%value, "generated address collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Duplicate(domain).into())
    }

    /// A random address on `domain` that is not recorded anywhere.
    pub fn random_address(&self, domain: &str) -> Result<String, InboxError> {
        let domain = self.generation_domain(domain)?;
        Ok(format!("{}@{}", random_local_part(), domain))
    }

    /// Live messages for `address`, newest first.
    ///
    /// `limit` defaults to, and is capped at, the configured page size.
    pub async fn list_messages(
        &self,
        address: &str,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<Message>, InboxError> {
        let (address, domain) = normalize_address(address)?;
        if !self.config.domains.accepts(&domain) {
            warn!(%address, "listing refused for domain outside allow-list");
            return Err(InboxError::DomainNotAllowed(domain));
        }

        let now = Utc::now();
        self.store.touch_address_access(&address, now).await?;

        let max = self.config.max_messages_per_page;
        let limit = limit.unwrap_or(max).min(max);
        let messages = self
            .store
            .messages_for_recipient(&address, now, limit, offset)
            .await?;
        debug!(%address, count = messages.len(), "listed messages");
        Ok(messages)
    }

    /// Fetch one live message by id prefix and mark it read.
    pub async fn get_message(&self, address: &str, id_prefix: &str) -> Result<Message, InboxError> {
        let (address, _) = normalize_address(address)?;

        let mut message = self
            .store
            .message_by_id(&address, id_prefix, Utc::now())
            .await?
            .ok_or(InboxError::NotFound)?;

        self.store.mark_message_read(&message.id).await?;
        message.is_read = true;
        Ok(message)
    }

    /// Delete messages of `address` whose id starts with `id_prefix`.
    ///
    /// Returns whether anything was removed.
    pub async fn delete_message(&self, address: &str, id_prefix: &str) -> Result<bool, InboxError> {
        let (address, _) = normalize_address(address)?;
        let deleted = self.store.delete_message(&address, id_prefix).await?;
        debug!(%address, deleted, "deleted messages");
        Ok(deleted > 0)
    }

    pub async fn stats(&self, address: &str) -> Result<MailboxStats, InboxError> {
        let (address, _) = normalize_address(address)?;
        Ok(self.store.stats(&address, Utc::now()).await?)
    }

    fn generation_domain(&self, domain: &str) -> Result<String, InboxError> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() || !self.config.domains.is_listed(&domain) {
            return Err(InboxError::DomainNotAllowed(domain));
        }
        Ok(domain)
    }
}

fn random_local_part() -> String {
    let mut local = Uuid::new_v4().simple().to_string();
    local.truncate(LOCAL_PART_LEN);
    local
}

/// Lower-case `address` and check it looks like `local@host.tld`.
fn normalize_address(address: &str) -> Result<(String, String), InboxError> {
    let lowered = address.trim().to_lowercase();
    let Some((_, domain)) = split_address(&lowered) else {
        return Err(InboxError::InvalidAddress(address.to_string()));
    };
    let dotted = domain
        .split_once('.')
        .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty());
    if !dotted {
        return Err(InboxError::InvalidAddress(address.to_string()));
    }
    let domain = domain.to_string();
    Ok((lowered, domain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionId;
    use crate::store::SqliteStore;

    fn inbox_with(domains: &str) -> (Inbox, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = InboxConfig {
            domains: DomainPolicy::parse(domains),
            address_ttl: Duration::hours(1),
            max_messages_per_page: 2,
        };
        (Inbox::new(store.clone(), config), store)
    }

    async fn deliver(store: &SqliteStore, recipient: &str, subject: &str, age: Duration) -> Message {
        let received_at = Utc::now() - age;
        let message = Message {
            id: TransactionId::generate().message_id(recipient),
            recipient: recipient.to_string(),
            sender: "a@x.com".to_string(),
            subject: subject.to_string(),
            body_text: "hello".to_string(),
            body_html: String::new(),
            attachments: Vec::new(),
            received_at,
            expires_at: received_at + Duration::hours(1),
            is_read: false,
        };
        store.insert_message(&message).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_generate_address_on_allowed_domain() {
        let (inbox, store) = inbox_with("temp.example");

        let address = inbox.generate_address("Temp.Example").await.unwrap();
        let (local, domain) = address.value.split_once('@').unwrap();
        assert_eq!(domain, "temp.example");
        assert_eq!(local.len(), LOCAL_PART_LEN);
        assert!(local.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(address.expires_at - address.created_at, Duration::hours(1));

        assert!(store
            .touch_address_access(&address.value, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_generate_rejects_unlisted_domain_without_writing() {
        let (inbox, store) = inbox_with("temp.example");

        let result = inbox.generate_address("other.com").await;
        assert!(matches!(result, Err(InboxError::DomainNotAllowed(_))));
        assert_eq!(
            store
                .delete_expired_addresses(Utc::now() + Duration::days(365))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_open_mode_allows_no_generation() {
        let (inbox, _store) = inbox_with("");
        assert!(inbox.domains().is_empty());
        assert!(matches!(
            inbox.generate_address("temp.example").await,
            Err(InboxError::DomainNotAllowed(_))
        ));
        assert!(inbox.random_address("temp.example").is_err());
    }

    #[test]
    fn test_random_address() {
        let (inbox, _store) = inbox_with("temp.example");
        let first = inbox.random_address("temp.example").unwrap();
        let second = inbox.random_address("temp.example").unwrap();
        assert!(first.ends_with("@temp.example"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_list_messages_newest_first_with_page_cap() {
        let (inbox, store) = inbox_with("temp.example");
        deliver(&store, "u@temp.example", "oldest", Duration::minutes(3)).await;
        deliver(&store, "u@temp.example", "middle", Duration::minutes(2)).await;
        deliver(&store, "u@temp.example", "newest", Duration::minutes(1)).await;

        let page = inbox
            .list_messages("U@Temp.Example", Some(10), 0)
            .await
            .unwrap();
        let subjects: Vec<_> = page.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, ["newest", "middle"]);

        let rest = inbox
            .list_messages("u@temp.example", None, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].subject, "oldest");
    }

    #[tokio::test]
    async fn test_list_messages_validates_address() {
        let (inbox, _store) = inbox_with("temp.example");

        assert!(matches!(
            inbox.list_messages("not-an-address", None, 0).await,
            Err(InboxError::InvalidAddress(_))
        ));
        assert!(matches!(
            inbox.list_messages("u@localhost", None, 0).await,
            Err(InboxError::InvalidAddress(_))
        ));
        assert!(matches!(
            inbox.list_messages("u@other.com", None, 0).await,
            Err(InboxError::DomainNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_get_message_marks_read() {
        let (inbox, store) = inbox_with("temp.example");
        let stored = deliver(&store, "u@temp.example", "hi", Duration::zero()).await;
        let prefix = &stored.id[..8];

        let message = inbox.get_message("u@temp.example", prefix).await.unwrap();
        assert_eq!(message.id, stored.id);
        assert!(message.is_read);

        let stats = inbox.stats("u@temp.example").await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.unread, 0);
    }

    #[tokio::test]
    async fn test_get_message_not_found_for_expired_or_missing() {
        let (inbox, store) = inbox_with("temp.example");
        let expired = deliver(&store, "u@temp.example", "old", Duration::hours(2)).await;

        assert!(matches!(
            inbox.get_message("u@temp.example", &expired.id).await,
            Err(InboxError::NotFound)
        ));
        assert!(matches!(
            inbox.get_message("u@temp.example", "nope").await,
            Err(InboxError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_message_reports_whether_removed() {
        let (inbox, store) = inbox_with("temp.example");
        let stored = deliver(&store, "u@temp.example", "bye", Duration::zero()).await;

        assert!(!inbox
            .delete_message("other@temp.example", &stored.id)
            .await
            .unwrap());
        assert!(inbox
            .delete_message("u@temp.example", &stored.id)
            .await
            .unwrap());
        assert!(!inbox
            .delete_message("u@temp.example", &stored.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_stats_empty_mailbox() {
        let (inbox, _store) = inbox_with("temp.example");
        let stats = inbox.stats("nobody@temp.example").await.unwrap();
        assert_eq!(stats, MailboxStats::default());
    }
}
