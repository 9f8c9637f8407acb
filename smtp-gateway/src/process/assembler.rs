//! Builds the outbound message from a raw email.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use tracing::debug;

use crate::error::GatewayError;
use crate::process::email_parser::read_plain_text_body;
use crate::queue::OutboundMessage;

/// Assemble the message for `topic` from raw email bytes.
///
/// The plain text body is trimmed and cut to `message_limit` characters, the
/// subject becomes the title. A message with a title but no body is published
/// with the subject as its body instead.
pub fn assemble(
    topic: &str,
    raw: &[u8],
    message_limit: usize,
) -> Result<OutboundMessage, GatewayError> {
    let mail = parse_mail(raw)?;

    let body = read_plain_text_body(&mail)?;
    let body = truncate_chars(body.trim(), message_limit);

    let mut message = OutboundMessage::new(topic.to_string(), body);
    message.title = decode_subject(&mail)?;

    if !message.title.is_empty() && message.message.is_empty() {
        message.message = std::mem::take(&mut message.title);
    }

    debug!(
        topic = %message.topic,
        has_title = !message.title.is_empty(),
        message_length = message.message.chars().count(),
        "message_assembled"
    );

    Ok(message)
}

/// Cut `text` to at most `limit` characters.
fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

/// Read and decode the `Subject` header, or an empty string if there is none.
fn decode_subject(mail: &ParsedMail) -> Result<String, GatewayError> {
    let header = match mail.headers.get_first_header("Subject") {
        Some(header) => header,
        None => return Ok(String::new()),
    };

    let raw = String::from_utf8_lossy(header.get_value_raw());
    if raw.trim().is_empty() {
        return Ok(String::new());
    }

    check_encoded_words(&raw)?;

    // Only whitespace around the raw value is dropped; decoded text keeps its own.
    let leading = &raw[..raw.len() - raw.trim_start().len()];
    let trailing = &raw[raw.trim_end().len()..];
    let value = header.get_value();
    let value = value.strip_prefix(leading).unwrap_or(&value);
    let value = value.strip_suffix(trailing).unwrap_or(value);
    Ok(value.to_string())
}

/// Reject RFC 2047 encoded words whose payload cannot be decoded.
///
/// Only complete `=?charset?E?text?=` sequences are checked; anything else is
/// plain header text.
fn check_encoded_words(value: &str) -> Result<(), GatewayError> {
    let mut rest = value;

    while let Some(start) = rest.find("=?") {
        let word = &rest[start + 2..];

        let (charset, after_charset) = match word.split_once('?') {
            Some(split) => split,
            None => break,
        };

        let bytes = after_charset.as_bytes();
        if bytes.len() < 2 || !bytes[0].is_ascii() || bytes[1] != b'?' {
            break;
        }
        let encoding = bytes[0];

        let (text, after_word) = match after_charset[2..].split_once("?=") {
            Some(split) => split,
            None => break,
        };

        if charset.is_empty() {
            return Err(GatewayError::HeaderDecode("missing charset".to_string()));
        }

        match encoding {
            b'B' | b'b' => {
                STANDARD
                    .decode(text)
                    .map_err(|e| GatewayError::HeaderDecode(e.to_string()))?;
            }
            b'Q' | b'q' => check_q_encoding(text)?,
            other => {
                return Err(GatewayError::HeaderDecode(format!(
                    "unknown encoding '{}'",
                    other as char
                )))
            }
        }

        rest = after_word;
    }

    Ok(())
}

fn check_q_encoding(text: &str) -> Result<(), GatewayError> {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'=' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(GatewayError::HeaderDecode(
                    "invalid quoted-printable escape".to_string(),
                ));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    Ok(())
}
