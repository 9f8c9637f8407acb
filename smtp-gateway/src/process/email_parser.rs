//! RFC 5322 email body extraction using mailparse.
//!
//! Finds the single `text/plain` payload of a message. Multipart messages are
//! scanned one level deep only: a `text/plain` part hidden inside a nested
//! multipart is not found.

use std::collections::BTreeMap;

use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use tracing::{debug, warn};

use crate::error::GatewayError;

const TSPECIALS: &str = "()<>@,;:\\\"/[]?=";

/// A parsed `Content-Type` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    /// Lowercased `type/subtype`
    pub essence: String,
    /// Parameters keyed by lowercased name
    pub params: BTreeMap<String, String>,
}

/// Parse raw email bytes and return the plain text body.
pub fn extract_plain_text_body(raw: &[u8]) -> Result<String, GatewayError> {
    let mail = parse_mail(raw)?;
    read_plain_text_body(&mail)
}

/// Return the plain text body of an already parsed message.
pub fn read_plain_text_body(mail: &ParsedMail) -> Result<String, GatewayError> {
    let content_type = media_type_of(mail)?;

    debug!(
        content_type = %content_type.essence,
        subparts_count = mail.subparts.len(),
        "email_extract_text_start"
    );

    if content_type.essence == "text/plain" {
        return Ok(mail.get_body()?);
    }

    if content_type.essence.starts_with("multipart/") {
        if !content_type.params.contains_key("boundary") {
            warn!(content_type = %content_type.essence, "email_multipart_without_boundary");
            return Err(GatewayError::EndOfParts);
        }

        for (index, part) in mail.subparts.iter().enumerate() {
            let part_type = media_type_of(part)?;

            debug!(
                part_index = index,
                part_type = %part_type.essence,
                "email_examining_part"
            );

            if part_type.essence != "text/plain" {
                continue;
            }
            return Ok(part.get_body()?);
        }

        warn!(
            subparts_count = mail.subparts.len(),
            "email_no_plain_text_part"
        );
        return Err(GatewayError::EndOfParts);
    }

    Err(GatewayError::UnsupportedContentType(content_type.essence))
}

/// Parse the `Content-Type` header of a message or part. A missing header is an error.
fn media_type_of(mail: &ParsedMail) -> Result<MediaType, GatewayError> {
    let value = mail
        .headers
        .get_first_header("Content-Type")
        .map(|header| String::from_utf8_lossy(header.get_value_raw()).into_owned())
        .unwrap_or_default();

    parse_media_type(&value)
}

/// Strictly parse a `Content-Type` value (RFC 2045 syntax).
pub fn parse_media_type(value: &str) -> Result<MediaType, GatewayError> {
    let (essence, mut rest) = match value.find(';') {
        Some(index) => value.split_at(index),
        None => (value, ""),
    };

    let essence = essence.trim().to_ascii_lowercase();
    if essence.is_empty() {
        return Err(invalid("no media type"));
    }
    match essence.split_once('/') {
        Some((kind, subtype)) if is_token(kind) && is_token(subtype) => {}
        _ => return Err(invalid("expected token/token")),
    }

    let mut params = BTreeMap::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest
            .strip_prefix(';')
            .ok_or_else(|| invalid("expected ';' between parameters"))?
            .trim_start();
        if rest.is_empty() {
            // trailing semicolon
            break;
        }

        let key_end = rest.find(|c: char| !is_token_char(c)).unwrap_or(rest.len());
        let key = &rest[..key_end];
        if key.is_empty() {
            return Err(invalid("invalid parameter name"));
        }

        rest = rest[key_end..]
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(|| invalid("missing parameter value"))?
            .trim_start();

        let (param_value, remainder) = match rest.strip_prefix('"') {
            Some(quoted) => consume_quoted(quoted)?,
            None => {
                let end = rest.find(|c: char| !is_token_char(c)).unwrap_or(rest.len());
                if end == 0 {
                    return Err(invalid("invalid parameter value"));
                }
                (rest[..end].to_string(), &rest[end..])
            }
        };

        if params.insert(key.to_ascii_lowercase(), param_value).is_some() {
            return Err(invalid("duplicate parameter name"));
        }
        rest = remainder;
    }

    Ok(MediaType { essence, params })
}

/// Consume a quoted-string body (opening quote already stripped).
fn consume_quoted(input: &str) -> Result<(String, &str), GatewayError> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((index, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[index + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            _ => value.push(c),
        }
    }

    Err(invalid("unterminated quoted string"))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii() && !c.is_ascii_control() && c != ' ' && !TSPECIALS.contains(c)
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_token_char)
}

fn invalid(reason: &str) -> GatewayError {
    GatewayError::ContentTypeParse(reason.to_string())
}
