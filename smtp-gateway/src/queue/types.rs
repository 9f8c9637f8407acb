//! Message types published to the topic bus.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

/// Length of generated message identifiers.
pub const MESSAGE_ID_LENGTH: usize = 12;

/// Event name carried by every published message.
pub const MESSAGE_EVENT: &str = "message";

/// A message ready to be published to a topic.
///
/// Built once per accepted email and discarded after publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Random message identifier
    pub id: String,
    /// Unix timestamp (seconds) the message was created
    pub time: i64,
    /// Event type, always `message`
    pub event: String,
    /// Destination topic
    pub topic: String,
    /// Optional title, taken from the email subject
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Message body
    pub message: String,
}

impl OutboundMessage {
    /// Create a message for `topic` with a fresh id and timestamp.
    pub fn new(topic: String, message: String) -> Self {
        let id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(MESSAGE_ID_LENGTH)
            .map(char::from)
            .collect();

        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        Self {
            id,
            time,
            event: MESSAGE_EVENT.to_string(),
            topic,
            title: String::new(),
            message,
        }
    }
}
