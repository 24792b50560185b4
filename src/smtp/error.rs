//! Error types for the SMTP intake service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid command")]
    InvalidCommand,

    #[error("Invalid state for command")]
    InvalidState(String),

    #[error("Invalid syntax")]
    InvalidSyntax(String),

    #[error("Line too long (max {max} characters)")]
    LineTooLong { max: usize },

    #[error("Path too long (max {max} characters)")]
    PathTooLong { max: usize },

    #[error("Too many recipients (max {max})")]
    TooManyRecipients { max: usize },

    #[error("Too much mail data (max {max} bytes)")]
    TooMuchData { max: usize },

    #[error("Domain name too long (max {max} characters)")]
    DomainTooLong { max: usize },

    #[error("User name too long (max {max} characters)")]
    UserTooLong { max: usize },

    #[error("Recipient domain not accepted: {0}")]
    RecipientRejected(String),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported authentication mechanism: {0}")]
    UnsupportedMechanism(String),

    #[error("Message could not be parsed")]
    MessageUnparseable,

    #[error("Delivery failed for {failed} of {total} recipients")]
    DeliveryFailed { failed: usize, total: usize },

    #[error("Connection timed out")]
    Timeout,

    #[error("Service shutting down")]
    ShuttingDown,
}

/// SMTP size limits (RFC 5321 section 4.5.3.1)
pub struct SmtpLimits;

impl SmtpLimits {
    /// Maximum length of a user name
    pub const USER_MAX_LENGTH: usize = 64;

    /// Maximum length of a domain name
    pub const DOMAIN_MAX_LENGTH: usize = 255;

    /// Maximum length of a path (reverse-path or forward-path)
    pub const PATH_MAX_LENGTH: usize = 256;

    /// Maximum length of a command line including CRLF
    pub const COMMAND_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a reply line including CRLF
    pub const REPLY_LINE_MAX_LENGTH: usize = 512;

    /// Maximum length of a text line including CRLF
    pub const TEXT_LINE_MAX_LENGTH: usize = 1000;

    /// Maximum number of recipients per message
    pub const MAX_RECIPIENTS: usize = 100;

    /// Maximum total size of message data
    pub const MAX_DATA_SIZE: usize = 10 * 1024 * 1024;

    /// Hard cap on a single read; longer lines are treated as a broken stream
    pub const READ_LINE_HARD_LIMIT: usize = 64 * 1024;
}

impl SmtpError {
    pub fn to_response_code(&self) -> &'static str {
        match self {
            SmtpError::Io(_) => "421",
            SmtpError::InvalidCommand => "500",
            SmtpError::InvalidState(_) => "503",
            SmtpError::InvalidSyntax(_) => "501",
            SmtpError::LineTooLong { .. } => "500",
            SmtpError::PathTooLong { .. } => "501",
            SmtpError::TooManyRecipients { .. } => "452",
            SmtpError::TooMuchData { .. } => "552",
            SmtpError::DomainTooLong { .. } => "501",
            SmtpError::UserTooLong { .. } => "501",
            SmtpError::RecipientRejected(_) => "550",
            SmtpError::AuthRequired => "530",
            SmtpError::AuthFailed => "535",
            SmtpError::UnsupportedMechanism(_) => "504",
            SmtpError::MessageUnparseable => "451",
            SmtpError::DeliveryFailed { .. } => "451",
            SmtpError::Timeout => "421",
            SmtpError::ShuttingDown => "421",
        }
    }

    pub fn to_response_message(&self) -> String {
        match self {
            SmtpError::Io(_) => "Service not available".to_string(),
            SmtpError::InvalidCommand => "Syntax error, command unrecognized".to_string(),
            SmtpError::InvalidState(msg) => format!("Bad sequence of commands: {msg}"),
            SmtpError::InvalidSyntax(msg) => format!("Syntax error: {msg}"),
            SmtpError::LineTooLong { max } => format!("Line too long (max {max} characters)"),
            SmtpError::PathTooLong { max } => format!("Path too long (max {max} characters)"),
            SmtpError::TooManyRecipients { max } => format!("Too many recipients (max {max})"),
            SmtpError::TooMuchData { max } => format!("Too much mail data (max {max} bytes)"),
            SmtpError::DomainTooLong { max } => {
                format!("Domain name too long (max {max} characters)")
            }
            SmtpError::UserTooLong { max } => {
                format!("User name too long (max {max} characters)")
            }
            SmtpError::RecipientRejected(domain) => {
                format!("Recipient not accepted: domain {domain} is not served here")
            }
            SmtpError::AuthRequired => "Authentication required".to_string(),
            SmtpError::AuthFailed => "Authentication credentials invalid".to_string(),
            SmtpError::UnsupportedMechanism(mech) => {
                format!("Unrecognized authentication type {mech}")
            }
            SmtpError::MessageUnparseable => {
                "Requested action aborted: message could not be parsed".to_string()
            }
            SmtpError::DeliveryFailed { .. } => {
                "Requested action aborted: local error in processing".to_string()
            }
            SmtpError::Timeout => "Idle timeout, closing connection".to_string(),
            SmtpError::ShuttingDown => "Service shutting down, closing connection".to_string(),
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmtpError::Io(_)
                | SmtpError::Timeout
                | SmtpError::ShuttingDown
        )
    }
}
