//! SMTP reply construction

use crate::smtp::error::{SmtpError, SmtpLimits};

/// One SMTP reply, possibly multiline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Three digit reply code
    pub code: String,
    /// Text of the first (or only) line
    pub message: String,
    /// Further lines for multiline replies such as EHLO
    pub multiline: Option<Vec<String>>,
}

impl SmtpResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            multiline: None,
        }
    }

    pub fn new_multiline(code: &str, message: &str, lines: Vec<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.to_owned(),
            multiline: Some(lines),
        }
    }

    pub fn ok() -> Self {
        Self::new("250", "OK")
    }

    /// 220 banner sent on connect
    pub fn greeting(hostname: &str) -> Self {
        Self::new("220", &format!("{hostname} ESMTP tempinbox ready"))
    }

    pub fn helo(hostname: &str, client_domain: &str) -> Self {
        Self::new("250", &format!("{hostname} Hello {client_domain}"))
    }

    /// EHLO reply listing extensions; AUTH is only advertised when it is enforced
    pub fn ehlo(hostname: &str, client_domain: &str, advertise_auth: bool) -> Self {
        let mut capabilities = vec![
            "PIPELINING".to_owned(),
            format!("SIZE {}", SmtpLimits::MAX_DATA_SIZE),
            "8BITMIME".to_owned(),
        ];
        if advertise_auth {
            capabilities.push("AUTH PLAIN LOGIN".to_owned());
        }
        Self::new_multiline(
            "250",
            &format!("{hostname} Hello {client_domain}"),
            capabilities,
        )
    }

    /// 334 continuation carrying a base64 challenge (may be empty)
    pub fn auth_challenge(challenge: &str) -> Self {
        Self::new("334", challenge)
    }

    pub fn auth_success() -> Self {
        Self::new("235", "Authentication successful")
    }

    pub fn recipient_ok(recipient: &str) -> Self {
        Self::new("250", &format!("Recipient <{recipient}> OK"))
    }

    pub fn data_start() -> Self {
        Self::new("354", "End data with <CR><LF>.<CR><LF>")
    }

    /// Final DATA reply after every recipient copy was written
    pub fn delivered(transaction: &str) -> Self {
        Self::new("250", &format!("OK: queued as {transaction}"))
    }

    pub fn quit() -> Self {
        Self::new("221", "Bye")
    }

    pub fn from_error(err: &SmtpError) -> Self {
        Self::new(err.to_response_code(), &err.to_response_message())
    }

    /// Format the response for sending over the wire
    pub fn format(&self) -> String {
        if let Some(ref lines) = self.multiline {
            let mut result = format!("{}-{}\r\n", self.code, self.message);
            for (i, line) in lines.iter().enumerate() {
                let sep = if i == lines.len() - 1 { ' ' } else { '-' };
                result.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
            }
            result
        } else {
            format!("{} {}\r\n", self.code, self.message)
        }
    }
}
