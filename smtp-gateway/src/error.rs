//! Error type shared by the resolver, extractor, assembler and session.

use thiserror::Error;

/// Every reason a `RCPT` or `DATA` step can abort a transaction.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid address: {0}")]
    AddressParse(#[source] mailparse::MailParseError),

    #[error("too many recipients")]
    TooManyRecipients,

    #[error("invalid domain")]
    InvalidDomain,

    #[error("invalid address")]
    InvalidAddress,

    #[error("invalid topic")]
    InvalidTopic,

    #[error("invalid content type: {0}")]
    ContentTypeParse(String),

    #[error("unsupported content type")]
    UnsupportedContentType(String),

    #[error("malformed message: {0}")]
    MailParse(#[from] mailparse::MailParseError),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no text/plain part found")]
    EndOfParts,

    #[error("invalid encoded header: {0}")]
    HeaderDecode(String),

    #[error("publish failed: {0}")]
    Publish(#[source] anyhow::Error),

    #[error("no valid recipient")]
    NoRecipient,
}

/// Maps gateway errors to SMTP reply codes
impl GatewayError {
    pub fn reply_code(&self) -> u16 {
        match self {
            GatewayError::AddressParse(_) => 501,
            GatewayError::TooManyRecipients => 452,
            GatewayError::InvalidDomain
            | GatewayError::InvalidAddress
            | GatewayError::InvalidTopic => 550,
            GatewayError::ContentTypeParse(_)
            | GatewayError::UnsupportedContentType(_)
            | GatewayError::MailParse(_)
            | GatewayError::EndOfParts
            | GatewayError::HeaderDecode(_) => 554,
            GatewayError::Io(_) | GatewayError::Publish(_) => 451,
            GatewayError::NoRecipient => 503,
        }
    }

    pub fn reply_text(&self) -> String {
        match self {
            GatewayError::Publish(_) => "Requested action aborted: local error".to_string(),
            GatewayError::NoRecipient => "Bad sequence of commands: RCPT first".to_string(),
            other => {
                let text = other.to_string();
                let mut chars = text.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        }
    }
}
