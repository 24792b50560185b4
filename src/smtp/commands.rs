//! Implementation of SMTP commands

use tracing::{debug, warn};

use crate::domains::DomainPolicy;
use crate::smtp::auth::{self, AuthConfig, AuthExchange};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

/// Handles SMTP commands and returns appropriate responses
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
    auth: &'a AuthConfig,
    domains: &'a DomainPolicy,
}

impl<'a> SmtpCommandHandler<'a> {
    pub fn new(hostname: &'a str, auth: &'a AuthConfig, domains: &'a DomainPolicy) -> Self {
        Self {
            hostname,
            auth,
            domains,
        }
    }

    /// Process a command line (without line ending) and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if let Some(exchange) = session.pending_auth.take() {
            return self.continue_auth(exchange, command_line, session);
        }

        if command_line.len() + 2 > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();
        debug!(command = %cmd, "processing command");

        match cmd.as_str() {
            "HELO" => self.handle_helo(parts, session),
            "EHLO" => self.handle_ehlo(parts, session),
            "AUTH" => self.handle_auth(parts, session),
            "MAIL" => self.handle_mail(parts, session),
            "RCPT" => self.handle_rcpt(parts, session),
            "DATA" => self.handle_data(parts, session),
            "RSET" => self.handle_rset(session),
            "NOOP" => Ok(SmtpResponse::ok()),
            "QUIT" => Ok(SmtpResponse::quit()),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    fn handle_helo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = greeting_argument(&parts, "HELO")?;
        session.set_client_domain(client_domain.clone())?;
        Ok(SmtpResponse::helo(self.hostname, &client_domain))
    }

    fn handle_ehlo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let client_domain = greeting_argument(&parts, "EHLO")?;
        session.set_client_domain(client_domain.clone())?;
        Ok(SmtpResponse::ehlo(
            self.hostname,
            &client_domain,
            self.auth.enabled,
        ))
    }

    /// Handle `AUTH <mechanism> [initial-response]`
    fn handle_auth(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if session.is_authenticated() {
            return Err(SmtpError::InvalidState("already authenticated".to_string()));
        }
        if !session.can_execute_command("AUTH") {
            return Err(SmtpError::InvalidState(
                "AUTH requires EHLO and no transaction in progress".to_string(),
            ));
        }

        let mechanism = parts
            .get(1)
            .map(|m| m.to_uppercase())
            .ok_or_else(|| SmtpError::InvalidSyntax("AUTH requires a mechanism".to_string()))?;
        let initial = parts.get(2).copied();

        match (mechanism.as_str(), initial) {
            ("PLAIN", None) => {
                session.pending_auth = Some(AuthExchange::AwaitingPlain);
                Ok(SmtpResponse::auth_challenge(""))
            }
            ("PLAIN", Some(payload)) => {
                let (user, pass) = auth::decode_plain(payload)?;
                self.complete_auth(&user, &pass, session)
            }
            ("LOGIN", None) => {
                session.pending_auth = Some(AuthExchange::AwaitingLoginUsername);
                Ok(SmtpResponse::auth_challenge(auth::LOGIN_USERNAME_PROMPT))
            }
            ("LOGIN", Some(encoded_user)) => {
                let username = auth::decode_base64(encoded_user)?;
                session.pending_auth = Some(AuthExchange::AwaitingLoginPassword { username });
                Ok(SmtpResponse::auth_challenge(auth::LOGIN_PASSWORD_PROMPT))
            }
            _ => Err(SmtpError::UnsupportedMechanism(mechanism)),
        }
    }

    /// Handle the client's reply to a 334 challenge
    fn continue_auth(
        &self,
        exchange: AuthExchange,
        line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        let line = line.trim();
        if line == "*" {
            return Err(SmtpError::InvalidSyntax(
                "AUTH exchange cancelled".to_string(),
            ));
        }

        match exchange {
            AuthExchange::AwaitingPlain => {
                let (user, pass) = auth::decode_plain(line)?;
                self.complete_auth(&user, &pass, session)
            }
            AuthExchange::AwaitingLoginUsername => {
                let username = auth::decode_base64(line)?;
                session.pending_auth = Some(AuthExchange::AwaitingLoginPassword { username });
                Ok(SmtpResponse::auth_challenge(auth::LOGIN_PASSWORD_PROMPT))
            }
            AuthExchange::AwaitingLoginPassword { username } => {
                let password = auth::decode_base64(line)?;
                self.complete_auth(&username, &password, session)
            }
        }
    }

    fn complete_auth(
        &self,
        username: &str,
        password: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        match self.auth.verify(username, password) {
            Ok(identity) => {
                debug!(user = %identity, "authenticated");
                session.set_authenticated(identity);
                Ok(SmtpResponse::auth_success())
            }
            Err(e) => {
                warn!(user = %username, "authentication failed");
                Err(e)
            }
        }
    }

    /// Handle `MAIL FROM:<path> [params]`; the sender itself is not validated
    fn handle_mail(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO/EHLO and no transaction in progress".to_string(),
            ));
        }

        if self.auth.enabled && !session.is_authenticated() {
            return Err(SmtpError::AuthRequired);
        }

        let (addr, params) = parse_path_argument(&parts, "FROM:")?;

        for param in params {
            if let Some(size) = param.to_uppercase().strip_prefix("SIZE=") {
                let declared: usize = size.parse().map_err(|_| {
                    SmtpError::InvalidSyntax("SIZE parameter must be numeric".to_string())
                })?;
                if declared > SmtpLimits::MAX_DATA_SIZE {
                    return Err(SmtpError::TooMuchData {
                        max: SmtpLimits::MAX_DATA_SIZE,
                    });
                }
            }
        }

        debug!(sender = %addr, "MAIL FROM");
        session.set_sender(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle `RCPT TO:<path>`, enforcing the domain allow-list per recipient
    fn handle_rcpt(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        let (addr, _params) = parse_path_argument(&parts, "TO:")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        let addr = addr.to_lowercase();
        let domain = validate_email_address(&addr)?;

        if !self.domains.accepts(domain) {
            warn!(recipient = %addr, %domain, "rejected recipient outside allowed domains");
            return Err(SmtpError::RecipientRejected(domain.to_string()));
        }

        debug!(recipient = %addr, "RCPT TO");
        session.add_recipient(addr.clone())?;

        Ok(SmtpResponse::recipient_ok(&addr))
    }

    fn handle_data(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires an accepted recipient first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.start_data_mode()?;

        Ok(SmtpResponse::data_start())
    }

    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        session.reset();
        Ok(SmtpResponse::ok())
    }
}

fn greeting_argument(parts: &[&str], command: &str) -> Result<String, SmtpError> {
    parts
        .get(1)
        .map(|d| d.to_string())
        .ok_or_else(|| SmtpError::InvalidSyntax(format!("{command} requires domain argument")))
}

/// Split `FROM:<path> PARAM=...` into the bare path and trailing parameters.
fn parse_path_argument<'p>(
    parts: &[&'p str],
    keyword: &str,
) -> Result<(String, Vec<&'p str>), SmtpError> {
    let command = parts[0].to_uppercase();
    if parts.len() < 2 {
        return Err(SmtpError::InvalidSyntax(format!(
            "{command} requires {keyword}<address>"
        )));
    }

    let head = parts[1];
    let glued = match head.get(..keyword.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(keyword) => &head[keyword.len()..],
        _ => {
            return Err(SmtpError::InvalidSyntax(format!(
                "{command} command must be '{command} {keyword}<address>'"
            )));
        }
    };

    // The path may be glued to the keyword or separated by a space.
    let (first, rest) = if glued.is_empty() {
        (parts.get(2).copied().unwrap_or(""), parts.get(3..).unwrap_or_default())
    } else {
        (glued, &parts[2..])
    };

    let path = first
        .strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .ok_or_else(|| {
            SmtpError::InvalidSyntax("address must be enclosed in angle brackets".to_string())
        })?;

    if path.len() > SmtpLimits::PATH_MAX_LENGTH {
        return Err(SmtpError::PathTooLong {
            max: SmtpLimits::PATH_MAX_LENGTH,
        });
    }

    Ok((path.to_string(), rest.to_vec()))
}

/// Check the shape and RFC size limits of a mailbox, returning its domain
fn validate_email_address(addr: &str) -> Result<&str, SmtpError> {
    let Some((user_part, domain_part)) = addr.rsplit_once('@') else {
        return Err(SmtpError::InvalidSyntax(
            "Email address must contain @ symbol".to_string(),
        ));
    };

    if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
        return Err(SmtpError::UserTooLong {
            max: SmtpLimits::USER_MAX_LENGTH,
        });
    }

    if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
        return Err(SmtpError::DomainTooLong {
            max: SmtpLimits::DOMAIN_MAX_LENGTH,
        });
    }

    if user_part.is_empty() || domain_part.is_empty() {
        return Err(SmtpError::InvalidSyntax(
            "Invalid email address format".to_string(),
        ));
    }

    Ok(domain_part)
}
