//! Per-recipient fan-out of a completed SMTP transaction

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::ingest::{self, ParsedMail};
use crate::model::{Message, TransactionId, UNKNOWN_SENDER};
use crate::smtp::error::SmtpError;
use crate::store::MailStore;

/// Envelope and raw data of one finished DATA phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// MAIL FROM path, empty for `<>`
    pub sender: String,
    /// Accepted recipients, lower-cased and unique
    pub recipients: Vec<String>,
    pub data: Vec<u8>,
}

/// Outcome of writing every recipient copy of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub transaction: TransactionId,
    pub stored: Vec<String>,
    pub failed: Vec<String>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Map a partial outcome to the transient reply the sender should see.
    pub fn into_result(self) -> Result<DeliveryReport, SmtpError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(SmtpError::DeliveryFailed {
                failed: self.failed.len(),
                total: self.failed.len() + self.stored.len(),
            })
        }
    }
}

/// Parses finished transactions once and stores one copy per recipient
#[derive(Clone)]
pub struct MailDelivery {
    store: Arc<dyn MailStore>,
    message_ttl: Duration,
}

impl MailDelivery {
    pub fn new(store: Arc<dyn MailStore>, message_ttl: Duration) -> Self {
        Self { store, message_ttl }
    }

    /// Parse `envelope.data` and write each recipient's copy concurrently.
    ///
    /// A parse failure stores nothing. Write failures are independent: copies
    /// already written stay written and the report lists who failed.
    pub async fn deliver(&self, envelope: Envelope) -> Result<DeliveryReport, SmtpError> {
        let parsed = ingest::parse_message(&envelope.data).map_err(|e| {
            debug!(error = %e, "rejecting unparseable message");
            SmtpError::MessageUnparseable
        })?;

        let transaction = TransactionId::generate();
        let received_at = Utc::now();
        let sender = display_sender(&parsed, &envelope.sender);
        let parsed = Arc::new(parsed);

        info!(
            transaction = %transaction,
            subject = %parsed.subject,
            recipients = envelope.recipients.len(),
            "delivering message"
        );

        let mut writes = JoinSet::new();
        for recipient in &envelope.recipients {
            let message = Message {
                id: transaction.message_id(recipient),
                recipient: recipient.clone(),
                sender: sender.clone(),
                subject: parsed.subject.clone(),
                body_text: parsed.text_body.clone(),
                body_html: parsed.html_body.clone(),
                attachments: parsed.attachments.clone(),
                received_at,
                expires_at: received_at + self.message_ttl,
                is_read: false,
            };
            let store = Arc::clone(&self.store);
            writes.spawn(async move {
                let result = store.insert_message(&message).await;
                (message.recipient, result)
            });
        }

        let mut stored = Vec::with_capacity(envelope.recipients.len());
        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((recipient, Ok(()))) => {
                    debug!(transaction = %transaction, %recipient, "stored copy");
                    stored.push(recipient);
                }
                Ok((recipient, Err(e))) => {
                    error!(transaction = %transaction, %recipient, error = %e, "failed to store copy");
                }
                Err(e) => {
                    error!(transaction = %transaction, error = %e, "store task aborted");
                }
            }
        }

        let failed = envelope
            .recipients
            .into_iter()
            .filter(|r| !stored.contains(r))
            .collect();

        Ok(DeliveryReport {
            transaction,
            stored,
            failed,
        })
    }
}

fn display_sender(parsed: &ParsedMail, envelope_sender: &str) -> String {
    if !parsed.from.is_empty() {
        parsed.from.clone()
    } else if !envelope_sender.is_empty() {
        envelope_sender.to_string()
    } else {
        UNKNOWN_SENDER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, MailboxStats};
    use crate::store::{SqliteStore, StoreError};
    use async_trait::async_trait;
    use chrono::DateTime;

    fn envelope(recipients: &[&str], data: &str) -> Envelope {
        Envelope {
            sender: "a@x.com".to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            data: data.as_bytes().to_vec(),
        }
    }

    /// Delegates to SQLite but refuses to store copies for one recipient.
    struct FailingFor {
        inner: SqliteStore,
        recipient: &'static str,
    }

    #[async_trait]
    impl MailStore for FailingFor {
        async fn create_address(&self, address: &Address) -> Result<(), StoreError> {
            self.inner.create_address(address).await
        }
        async fn touch_address_access(
            &self,
            address: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.touch_address_access(address, now).await
        }
        async fn delete_expired_addresses(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_expired_addresses(now).await
        }
        async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
            if message.recipient == self.recipient {
                return Err(StoreError::Corrupt("disk full".to_string()));
            }
            self.inner.insert_message(message).await
        }
        async fn messages_for_recipient(
            &self,
            address: &str,
            not_expired_as_of: DateTime<Utc>,
            limit: u32,
            offset: u32,
        ) -> Result<Vec<Message>, StoreError> {
            self.inner
                .messages_for_recipient(address, not_expired_as_of, limit, offset)
                .await
        }
        async fn message_by_id(
            &self,
            address: &str,
            id_prefix: &str,
            not_expired_as_of: DateTime<Utc>,
        ) -> Result<Option<Message>, StoreError> {
            self.inner
                .message_by_id(address, id_prefix, not_expired_as_of)
                .await
        }
        async fn mark_message_read(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.mark_message_read(id).await
        }
        async fn delete_message(&self, address: &str, id_prefix: &str) -> Result<u64, StoreError> {
            self.inner.delete_message(address, id_prefix).await
        }
        async fn delete_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_expired_messages(now).await
        }
        async fn stats(
            &self,
            address: &str,
            not_expired_as_of: DateTime<Utc>,
        ) -> Result<MailboxStats, StoreError> {
            self.inner.stats(address, not_expired_as_of).await
        }
    }

    #[tokio::test]
    async fn test_fan_out_shares_transaction_root() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let delivery = MailDelivery::new(store.clone(), Duration::hours(1));
        let recipients = ["u1@temp.example", "u2@temp.example", "u3@temp.example"];

        let report = delivery
            .deliver(envelope(&recipients, "Subject: Hi\r\n\r\nhello\r\n"))
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.stored.len(), 3);

        let now = Utc::now();
        let mut ids = Vec::new();
        for recipient in recipients {
            let messages = store
                .messages_for_recipient(recipient, now, 10, 0)
                .await
                .unwrap();
            assert_eq!(messages.len(), 1);
            let message = &messages[0];
            assert_eq!(message.transaction_root(), report.transaction.root());
            assert_eq!(message.subject, "Hi");
            assert_eq!(message.sender, "a@x.com");
            ids.push(message.id.clone());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_message_stores_nothing() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let delivery = MailDelivery::new(store.clone(), Duration::hours(1));

        let result = delivery
            .deliver(envelope(&["u1@temp.example"], "no headers at all\r\n"))
            .await;
        assert!(matches!(result, Err(SmtpError::MessageUnparseable)));

        let stats = store.stats("u1@temp.example", Utc::now()).await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_copies() {
        let store = Arc::new(FailingFor {
            inner: SqliteStore::open_in_memory().unwrap(),
            recipient: "u2@temp.example",
        });
        let delivery = MailDelivery::new(store.clone(), Duration::hours(1));

        let report = delivery
            .deliver(envelope(
                &["u1@temp.example", "u2@temp.example", "u3@temp.example"],
                "Subject: partial\r\n\r\nbody\r\n",
            ))
            .await
            .unwrap();

        assert_eq!(report.failed, vec!["u2@temp.example".to_string()]);
        assert_eq!(report.stored.len(), 2);

        let now = Utc::now();
        assert_eq!(store.stats("u1@temp.example", now).await.unwrap().total, 1);
        assert_eq!(store.stats("u3@temp.example", now).await.unwrap().total, 1);

        assert!(matches!(
            report.into_result(),
            Err(SmtpError::DeliveryFailed { failed: 1, total: 3 })
        ));
    }

    #[test]
    fn test_display_sender_fallbacks() {
        let mut parsed = ParsedMail::default();
        assert_eq!(display_sender(&parsed, ""), UNKNOWN_SENDER);
        assert_eq!(display_sender(&parsed, "env@x.com"), "env@x.com");

        parsed.from = "Header <h@x.com>".to_string();
        assert_eq!(display_sender(&parsed, "env@x.com"), "Header <h@x.com>");
    }
}
