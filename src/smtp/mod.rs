//! SMTP intake: protocol handling, authentication and delivery into the store

pub mod auth;
pub mod commands;
pub mod delivery;
pub mod error;
pub mod response;
pub mod server;
pub mod session;

pub use auth::AuthConfig;
pub use delivery::{DeliveryReport, Envelope, MailDelivery};
pub use error::{SmtpError, SmtpLimits};
pub use response::SmtpResponse;
pub use server::{SmtpConfig, SmtpServer};
pub use session::{SmtpSession, SmtpState};
