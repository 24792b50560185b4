//! MIME ingestion: turns a raw DATA buffer into the fields we store.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use mail_parser::{Addr, MessageParser, MimeHeaders, PartType};
use thiserror::Error;
use tracing::debug;

use crate::model::Attachment;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("Malformed message: {0}")]
    Malformed(&'static str),
}

/// Structured view of one inbound message, shared by all recipients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMail {
    /// Rendered header `From`, empty when the header is absent.
    pub from: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
}

/// Parse an RFC 5322 message.
///
/// Absent optional headers and body parts become empty strings. Only a
/// stream without a recognizable header block is an error.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMail, IngestError> {
    if !starts_with_header(raw) {
        return Err(IngestError::Malformed("no header block"));
    }

    let msg = MessageParser::default()
        .parse(raw)
        .ok_or(IngestError::Malformed("unparseable message"))?;

    let from = msg
        .from()
        .and_then(|address| address.first())
        .map(render_addr)
        .unwrap_or_default();

    let subject = msg.subject().unwrap_or_default().to_string();

    // mail-parser derives text from HTML when no plain part exists, which is
    // what readers expect. The reverse conversion is not wanted.
    let text_body = msg.body_text(0).map(|s| s.into_owned()).unwrap_or_default();

    let html_body = msg
        .html_bodies()
        .find_map(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    let attachments = msg
        .attachments()
        .enumerate()
        .map(|(idx, part)| {
            let contents = part.contents();
            Attachment {
                filename: part
                    .attachment_name()
                    .map(String::from)
                    .unwrap_or_else(|| format!("attachment-{}", idx + 1)),
                content_type: part
                    .content_type()
                    .map(|ct| match ct.subtype() {
                        Some(sub) => format!("{}/{}", ct.ctype(), sub),
                        None => ct.ctype().to_string(),
                    })
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                size_bytes: contents.len() as u64,
                content_base64: B64.encode(contents),
            }
        })
        .collect::<Vec<_>>();

    debug!(
        subject = %subject,
        attachments = attachments.len(),
        has_html = !html_body.is_empty(),
        "parsed message"
    );

    Ok(ParsedMail {
        from,
        subject,
        text_body,
        html_body,
        attachments,
    })
}

fn render_addr(addr: &Addr<'_>) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(email)) => format!("{name} <{email}>"),
        (None, Some(email)) => email.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// The stream opens with a header block: either a field (a printable ASCII
/// name, optional obs-syntax WSP, then `:`) or the blank line of an empty block.
fn starts_with_header(raw: &[u8]) -> bool {
    if raw.is_empty() {
        return false;
    }
    let first_line = raw.split(|&b| b == b'\n').next().unwrap_or_default();
    let first_line = first_line.strip_suffix(b"\r").unwrap_or(first_line);
    if first_line.is_empty() {
        return true;
    }
    let Some(colon) = first_line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = first_line[..colon].trim_ascii_end();
    !name.is_empty() && name.iter().all(u8::is_ascii_graphic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message() {
        let raw = b"From: Alice <alice@x.com>\r\n\
                    To: u1@temp.example\r\n\
                    Subject: Hi\r\n\
                    \r\n\
                    Hello there\r\n";

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.from, "Alice <alice@x.com>");
        assert_eq!(parsed.subject, "Hi");
        assert!(parsed.text_body.contains("Hello there"));
        assert_eq!(parsed.html_body, "");
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn test_missing_subject_and_from() {
        let raw = b"To: u1@temp.example\r\n\r\nbody only\r\n";

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.from, "");
        assert_eq!(parsed.html_body, "");
    }

    #[test]
    fn test_headers_without_body() {
        let raw = b"Subject: nothing\r\n\r\n";

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.subject, "nothing");
        assert_eq!(parsed.text_body.trim(), "");
        assert_eq!(parsed.html_body, "");
    }

    #[test]
    fn test_multipart_alternative_with_attachment() {
        let raw = concat!(
            "From: sender@x.com\r\n",
            "Subject: Report\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain version\r\n",
            "--inner\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<p>html version</p>\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"data.bin\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "AAEC/w==\r\n",
            "--outer--\r\n",
        );

        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(parsed.subject, "Report");
        assert!(parsed.text_body.contains("plain version"));
        assert!(parsed.html_body.contains("<p>html version</p>"));

        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "data.bin");
        assert_eq!(attachment.content_type, "application/octet-stream");
        assert_eq!(attachment.size_bytes, 4);
        assert_eq!(attachment.content_base64, "AAEC/w==");
    }

    #[test]
    fn test_html_only_message_keeps_html() {
        let raw = concat!(
            "Subject: html\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<b>bold</b>\r\n",
        );

        let parsed = parse_message(raw.as_bytes()).unwrap();
        assert!(parsed.html_body.contains("<b>bold</b>"));
        assert!(parsed.text_body.contains("bold"));
    }

    #[test]
    fn test_encoded_subject_is_decoded() {
        let raw = b"Subject: =?UTF-8?B?5Lu25ZCN?=\r\n\r\nbody\r\n";

        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.subject, "件名");
    }

    #[test]
    fn test_malformed_streams_rejected() {
        assert_eq!(
            parse_message(b""),
            Err(IngestError::Malformed("no header block"))
        );
        assert!(parse_message(b"just some text without headers\r\n").is_err());
        assert!(parse_message(b": no name\r\n\r\nbody").is_err());
        assert!(parse_message(b" : blank name\r\n\r\nbody").is_err());
    }

    #[test]
    fn test_empty_header_block() {
        let parsed = parse_message(b"\r\nbody only\r\n").unwrap();
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.from, "");
        assert!(parsed.text_body.contains("body only"));
    }

    #[test]
    fn test_whitespace_before_colon() {
        let parsed = parse_message(b"Subject : hi\r\n\r\nb\r\n").unwrap();
        assert_eq!(parsed.subject, "hi");
        assert!(parsed.text_body.contains('b'));
    }
}
