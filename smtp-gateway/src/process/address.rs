//! Recipient address to topic resolution.
//!
//! A recipient is accepted only if it is a single address under the configured
//! domain, carries the configured local-part prefix (if any), and what remains
//! is a valid topic name.

use mailparse::{addrparse, MailAddr};
use regex::Regex;
use tracing::debug;

use crate::error::GatewayError;

/// Resolves `RCPT TO` values into topic names.
#[derive(Debug, Clone)]
pub struct TopicResolver {
    domain_suffix: String,
    prefix: String,
    topic_regex: Regex,
}

impl TopicResolver {
    /// Create a resolver for `domain`, an optional local-part `prefix` and a topic pattern.
    pub fn new(domain: &str, prefix: &str, topic_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            domain_suffix: format!("@{}", domain),
            prefix: prefix.to_string(),
            topic_regex: Regex::new(topic_pattern)?,
        })
    }

    /// Resolve a raw recipient value into a topic name.
    pub fn resolve(&self, recipient: &str) -> Result<String, GatewayError> {
        let list = addrparse(recipient).map_err(GatewayError::AddressParse)?;

        let mut addresses = list.iter().flat_map(|addr| match addr {
            MailAddr::Single(info) => vec![info.addr.as_str()],
            MailAddr::Group(group) => group.addrs.iter().map(|info| info.addr.as_str()).collect(),
        });

        let address = match (addresses.next(), addresses.next()) {
            (Some(address), None) => address,
            _ => return Err(GatewayError::TooManyRecipients),
        };

        let local = address
            .strip_suffix(self.domain_suffix.as_str())
            .ok_or(GatewayError::InvalidDomain)?;

        let topic = if self.prefix.is_empty() {
            local
        } else {
            local
                .strip_prefix(self.prefix.as_str())
                .ok_or(GatewayError::InvalidAddress)?
        };

        if !self.topic_regex.is_match(topic) {
            return Err(GatewayError::InvalidTopic);
        }

        debug!(address = %address, topic = %topic, "recipient_resolved");
        Ok(topic.to_string())
    }
}
