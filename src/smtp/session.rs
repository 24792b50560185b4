//! SMTP session state management

use crate::smtp::auth::AuthExchange;
use crate::smtp::delivery::Envelope;
use crate::smtp::error::{SmtpError, SmtpLimits};

/// Represents the current state of an SMTP session
#[derive(Debug, Clone, PartialEq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO/EHLO
    Initial,
    /// HELO/EHLO received - ready for AUTH or MAIL
    GreetingReceived,
    /// MAIL FROM received - ready for RCPT commands
    MailReceived,
    /// At least one recipient accepted - ready for DATA or more RCPT commands
    RecipientsReceived,
    /// DATA command received - collecting message data
    DataMode,
}

/// State and envelope for a single SMTP connection
#[derive(Debug)]
pub struct SmtpSession {
    pub state: SmtpState,
    /// Envelope sender; empty for the null reverse-path `<>`
    pub from: Option<String>,
    /// Accepted, lower-cased recipients
    pub to: Vec<String>,
    /// Raw message bytes, CRLF line endings, dot-unstuffed
    pub data: Vec<u8>,
    pub in_data_mode: bool,
    /// First limit violation seen during DATA; reported once the terminator arrives
    pub data_error: Option<SmtpError>,
    /// Client domain from HELO/EHLO
    pub client_domain: Option<String>,
    /// Identity established by AUTH, survives transaction resets
    pub authenticated_user: Option<String>,
    /// Set while an AUTH exchange waits for a continuation line
    pub pending_auth: Option<AuthExchange>,
}

impl SmtpSession {
    pub fn new() -> Self {
        Self {
            state: SmtpState::Initial,
            from: None,
            to: Vec::new(),
            data: Vec::new(),
            in_data_mode: false,
            data_error: None,
            client_domain: None,
            authenticated_user: None,
            pending_auth: None,
        }
    }

    /// Reset the transaction, keeping the greeting and authentication
    pub fn reset(&mut self) {
        if self.state != SmtpState::Initial {
            self.state = SmtpState::GreetingReceived;
        }
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.in_data_mode = false;
        self.data_error = None;
    }

    pub fn set_client_domain(&mut self, domain: String) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain);
        self.state = SmtpState::GreetingReceived;
        self.reset();
        Ok(())
    }

    pub fn set_authenticated(&mut self, user: String) {
        self.authenticated_user = Some(user);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated_user.is_some()
    }

    pub fn set_sender(&mut self, sender: String) -> Result<(), SmtpError> {
        if sender.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.from = Some(sender);
        self.to.clear();
        self.data.clear();
        self.data_error = None;
        self.state = SmtpState::MailReceived;
        Ok(())
    }

    /// Add an accepted recipient; repeats of the same address are absorbed
    pub fn add_recipient(&mut self, recipient: String) -> Result<(), SmtpError> {
        if recipient.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        if self.to.contains(&recipient) {
            self.state = SmtpState::RecipientsReceived;
            return Ok(());
        }

        if self.to.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        self.to.push(recipient);
        self.state = SmtpState::RecipientsReceived;
        Ok(())
    }

    pub fn start_data_mode(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsReceived {
            return Err(SmtpError::InvalidState(
                "DATA command requires an accepted recipient first".to_string(),
            ));
        }

        self.in_data_mode = true;
        self.data.clear();
        self.data_error = None;
        self.state = SmtpState::DataMode;
        Ok(())
    }

    /// Append one DATA line (without its line ending).
    ///
    /// Limit violations do not abort the read: the line is dropped, the
    /// violation is remembered, and the client keeps streaming until `.`.
    pub fn add_data_line(&mut self, line: &[u8]) {
        if self.data_error.is_some() {
            return;
        }

        let line = match line.strip_prefix(b".") {
            Some(rest) => rest,
            None => line,
        };
        let line_size = line.len() + 2;

        if line_size > SmtpLimits::TEXT_LINE_MAX_LENGTH {
            self.data_error = Some(SmtpError::LineTooLong {
                max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
            });
            self.data.clear();
            return;
        }

        if self.data.len() + line_size > SmtpLimits::MAX_DATA_SIZE {
            self.data_error = Some(SmtpError::TooMuchData {
                max: SmtpLimits::MAX_DATA_SIZE,
            });
            self.data.clear();
            return;
        }

        self.data.extend_from_slice(line);
        self.data.extend_from_slice(b"\r\n");
    }

    /// Close the DATA phase and hand the envelope over for delivery.
    ///
    /// The session returns to the post-greeting state either way.
    pub fn finish_data_collection(&mut self) -> Result<Envelope, SmtpError> {
        if !self.in_data_mode {
            return Err(SmtpError::InvalidState(
                "Not in data collection mode".to_string(),
            ));
        }

        if let Some(err) = self.data_error.take() {
            self.reset();
            return Err(err);
        }

        let Some(sender) = self.from.take() else {
            self.reset();
            return Err(SmtpError::InvalidState("No sender specified".to_string()));
        };

        if self.to.is_empty() {
            self.reset();
            return Err(SmtpError::InvalidState(
                "No recipients specified".to_string(),
            ));
        }

        let envelope = Envelope {
            sender,
            recipients: std::mem::take(&mut self.to),
            data: std::mem::take(&mut self.data),
        };

        self.reset();
        Ok(envelope)
    }

    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            "EHLO" | "HELO" => true,
            "AUTH" => self.state == SmtpState::GreetingReceived,
            "MAIL" => self.state == SmtpState::GreetingReceived,
            "RCPT" => {
                self.state == SmtpState::MailReceived || self.state == SmtpState::RecipientsReceived
            }
            "DATA" => self.state == SmtpState::RecipientsReceived,
            "RSET" | "NOOP" | "QUIT" => true,
            _ => false,
        }
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len()
    }

    pub fn current_data_size(&self) -> usize {
        self.data.len()
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new()
    }
}
