//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::domains::DomainPolicy;
use crate::inbox::InboxConfig;
use crate::smtp::{AuthConfig, SmtpConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SMTP auth is enabled but no username is configured")]
    AuthWithoutUser,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Every flag can also be set through the environment variable named in its help.
#[derive(Parser, Debug, Clone)]
#[command(name = "tempinbox", version, about = "Disposable mailbox service")]
pub struct Settings {
    /// HTTP API port
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub api_port: u16,

    /// Address both listeners bind to
    #[arg(long = "bind", env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// SMTP intake port
    #[arg(long, env = "SMTP_PORT", default_value_t = 25)]
    pub smtp_port: u16,

    /// Name announced in SMTP greetings
    #[arg(long, env = "SMTP_HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Comma-separated domains this service accepts mail for; empty accepts all
    #[arg(long, env = "ALLOWED_DOMAINS", default_value = "")]
    pub allowed_domains: String,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "./emails.db")]
    pub database_path: PathBuf,

    /// Hours a received message stays visible
    #[arg(long, env = "EMAIL_EXPIRATION_HOURS", default_value_t = 24)]
    pub email_expiration_hours: u32,

    /// Hours a generated address is kept; defaults to the message window
    #[arg(long, env = "ADDRESS_EXPIRATION_HOURS")]
    pub address_expiration_hours: Option<u32>,

    /// Minutes between retention sweeps
    #[arg(long, env = "CLEANUP_INTERVAL_MINUTES", default_value_t = 60)]
    pub cleanup_interval_minutes: u32,

    /// Default and maximum page size when listing a mailbox
    #[arg(long, env = "MAX_EMAILS_PER_ADDRESS", default_value_t = 50)]
    pub max_emails_per_address: u32,

    /// Require AUTH PLAIN/LOGIN before MAIL FROM
    #[arg(long, env = "SMTP_AUTH_ENABLED")]
    pub smtp_auth_enabled: bool,

    #[arg(long, env = "SMTP_AUTH_USER", default_value = "")]
    pub smtp_auth_user: String,

    #[arg(long, env = "SMTP_AUTH_PASS", default_value = "", hide_env_values = true)]
    pub smtp_auth_pass: String,

    /// Seconds an SMTP client may stay silent before it is disconnected
    #[arg(long, env = "SMTP_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub smtp_idle_timeout_secs: u64,

    /// Verbose logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp_auth_enabled && self.smtp_auth_user.is_empty() {
            return Err(ConfigError::AuthWithoutUser);
        }
        if self.email_expiration_hours == 0 {
            return Err(ConfigError::Zero("email expiration"));
        }
        if self.address_expiration_hours == Some(0) {
            return Err(ConfigError::Zero("address expiration"));
        }
        if self.cleanup_interval_minutes == 0 {
            return Err(ConfigError::Zero("cleanup interval"));
        }
        if self.max_emails_per_address == 0 {
            return Err(ConfigError::Zero("max emails per address"));
        }
        Ok(())
    }

    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn domain_policy(&self) -> DomainPolicy {
        DomainPolicy::parse(&self.allowed_domains)
    }

    pub fn message_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.email_expiration_hours))
    }

    pub fn address_ttl(&self) -> chrono::Duration {
        self.address_expiration_hours
            .map(|hours| chrono::Duration::hours(i64::from(hours)))
            .unwrap_or_else(|| self.message_ttl())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.cleanup_interval_minutes) * 60)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.api_port)
    }

    pub fn smtp_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.smtp_port)
    }

    pub fn auth(&self) -> AuthConfig {
        if self.smtp_auth_enabled {
            AuthConfig::required(&self.smtp_auth_user, &self.smtp_auth_pass)
        } else {
            AuthConfig::disabled()
        }
    }

    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            hostname: self.hostname.clone(),
            domains: self.domain_policy(),
            auth: self.auth(),
            message_ttl: self.message_ttl(),
            idle_timeout: Duration::from_secs(self.smtp_idle_timeout_secs),
        }
    }

    pub fn inbox_config(&self) -> InboxConfig {
        InboxConfig {
            domains: self.domain_policy(),
            address_ttl: self.address_ttl(),
            max_messages_per_page: self.max_emails_per_address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["tempinbox"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_flags_override_defaults() {
        let settings = parse(&[
            "--api-port",
            "8080",
            "--smtp-port",
            "2525",
            "--allowed-domains",
            "Temp.Example, other.test",
            "--email-expiration-hours",
            "2",
            "--cleanup-interval-minutes",
            "5",
            "-vv",
        ]);

        assert_eq!(settings.api_port, 8080);
        assert_eq!(settings.smtp_addr(), format!("{}:2525", settings.bind_address));
        assert_eq!(settings.domain_policy().domains(), ["temp.example", "other.test"]);
        assert_eq!(settings.message_ttl(), chrono::Duration::hours(2));
        assert_eq!(settings.address_ttl(), chrono::Duration::hours(2));
        assert_eq!(settings.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(settings.log_level(), "trace");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_address_window_independent_of_messages() {
        let settings = parse(&[
            "--email-expiration-hours",
            "1",
            "--address-expiration-hours",
            "48",
        ]);
        assert_eq!(settings.message_ttl(), chrono::Duration::hours(1));
        assert_eq!(settings.address_ttl(), chrono::Duration::hours(48));
        assert_eq!(settings.inbox_config().address_ttl, chrono::Duration::hours(48));
    }

    #[test]
    fn test_auth_requires_user() {
        let settings = parse(&["--smtp-auth-enabled", "--smtp-auth-user", ""]);
        assert_eq!(settings.validate(), Err(ConfigError::AuthWithoutUser));

        let settings = parse(&[
            "--smtp-auth-enabled",
            "--smtp-auth-user",
            "alice",
            "--smtp-auth-pass",
            "secret",
        ]);
        assert!(settings.validate().is_ok());
        assert_eq!(settings.smtp_config().auth, AuthConfig::required("alice", "secret"));
    }

    #[test]
    fn test_zero_windows_rejected() {
        let settings = parse(&["--cleanup-interval-minutes", "0"]);
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Zero("cleanup interval"))
        );
    }
}
