//! # tempinbox
//!
//! A disposable mailbox service. Mail arrives over SMTP, is parsed once and
//! stored as one copy per accepted recipient, stays visible until its expiry
//! and is read back through a small JSON API.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tempinbox::{DomainPolicy, SmtpConfig, SmtpServer, SqliteStore};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteStore::open_in_memory()?);
//! let mut config = SmtpConfig::new("mx.temp.example");
//! config.domains = DomainPolicy::parse("temp.example");
//!
//! let server = SmtpServer::new(config, store);
//! server.start("127.0.0.1:2525", CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the client (`EHLO` lists extensions)
//! - `AUTH PLAIN` / `AUTH LOGIN` - Authenticate when auth is enabled
//! - `MAIL FROM` - Specify the sender's address (`<>` accepted)
//! - `RCPT TO` - Specify a destination; only allow-listed domains are accepted
//! - `DATA` - Send the message
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! ## Notes
//!
//! - SSL/TLS connection is not supported.
//! - Mail relay is not supported; every accepted message is stored locally.
//! - Expired messages are invisible as soon as their expiry passes; the
//!   sweeper only reclaims space.
//!
//! ## Size Limits
//!
//! The SMTP listener enforces RFC 5321 size limits:
//! - User names: 64 characters max
//! - Domain names: 255 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Text lines: 1000 characters max
//! - Recipients: 100 max per message
//! - Message data: 10 MiB max

pub mod api;
pub mod config;
pub mod domains;
pub mod inbox;
pub mod ingest;
pub mod model;
pub mod smtp;
pub mod store;
pub mod sweeper;

pub use domains::DomainPolicy;
pub use inbox::{Inbox, InboxConfig, InboxError};
pub use model::{Address, Attachment, MailboxStats, Message, TransactionId};
pub use smtp::{AuthConfig, SmtpConfig, SmtpError, SmtpLimits, SmtpResponse, SmtpServer};
pub use store::{MailStore, SqliteStore, StoreError};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
