//! Topicmail - SMTP to topic gateway.
//!
//! Accepts email over SMTP and publishes each message to a topic on a
//! RabbitMQ topic exchange. The recipient address selects the topic, the
//! plain text body becomes the message and the subject becomes its title.
//!
//! ## Architecture
//!
//! ```text
//! SMTP client → smtp::listener → Session (rcpt → topic, data → OutboundMessage) → Publisher
//!                                   ↓
//!                           DeliveryCounters → GET /stats
//! ```

pub mod config;
pub mod error;
pub mod process;
pub mod queue;
pub mod session;
pub mod smtp;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use error::GatewayError;
pub use process::{assemble, extract_plain_text_body, TopicResolver};
pub use queue::{AmqpPublisher, OutboundMessage, Publisher};
pub use session::{Backend, Counts, DeliveryCounters, Session, SessionState};
pub use web::AppState;
