//! Queue module for publishing to the topic bus.
//!
//! This module provides:
//! - The outbound message format
//! - The `Publisher` seam and its RabbitMQ implementation
//!
//! ## Routing
//!
//! ```text
//! OutboundMessage → topic exchange (routing key = topic) → subscribers
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{AmqpPublisher, Publisher};
pub use types::{OutboundMessage, MESSAGE_EVENT, MESSAGE_ID_LENGTH};
