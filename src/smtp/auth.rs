//! AUTH PLAIN / AUTH LOGIN against a single configured credential pair

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::smtp::error::SmtpError;

/// "Username:" and "Password:" prompts for AUTH LOGIN
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// Server-side authentication policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    /// Anonymous mode: AUTH is not advertised and any attempt succeeds.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn required(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            enabled: true,
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check a credential pair, returning the identity to record on the session.
    pub fn verify(&self, username: &str, password: &str) -> Result<String, SmtpError> {
        if !self.enabled {
            return Ok("anonymous".to_string());
        }
        if username == self.username && password == self.password {
            Ok(username.to_string())
        } else {
            Err(SmtpError::AuthFailed)
        }
    }
}

/// A multi-line AUTH exchange waiting for the client's next line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthExchange {
    AwaitingPlain,
    AwaitingLoginUsername,
    AwaitingLoginPassword { username: String },
}

/// Decode a PLAIN payload: `[authzid] NUL authcid NUL passwd`.
///
/// A zero-length response carries no credentials; it decodes to an empty
/// pair that only anonymous mode accepts.
pub fn decode_plain(encoded: &str) -> Result<(String, String), SmtpError> {
    let decoded = decode_base64(encoded)?;
    if decoded.is_empty() {
        return Ok((String::new(), String::new()));
    }
    let mut fields = decoded.split('\0');
    match (fields.next(), fields.next(), fields.next(), fields.next()) {
        (Some(_authzid), Some(user), Some(pass), None) if !user.is_empty() => {
            Ok((user.to_string(), pass.to_string()))
        }
        _ => Err(SmtpError::InvalidSyntax(
            "AUTH PLAIN payload must be authzid\\0user\\0password".to_string(),
        )),
    }
}

/// Decode one base64 AUTH line; a lone `=` is the zero-length response (RFC 4954).
pub fn decode_base64(encoded: &str) -> Result<String, SmtpError> {
    let encoded = encoded.trim();
    if encoded == "=" {
        return Ok(String::new());
    }
    let bytes = B64
        .decode(encoded.as_bytes())
        .map_err(|_| SmtpError::InvalidSyntax("invalid base64 in AUTH exchange".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| SmtpError::InvalidSyntax("AUTH credentials must be UTF-8".to_string()))
}
