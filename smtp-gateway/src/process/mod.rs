//! Inbound email processing.
//!
//! Turns the untrusted parts of an SMTP transaction into a publishable message.
//!
//! ## Processing Flow
//!
//! ```text
//! RCPT TO value → TopicResolver::resolve() → topic
//! DATA bytes    → extract_plain_text_body() + Subject → assemble() → OutboundMessage
//! ```

pub mod address;
pub mod assembler;
pub mod email_parser;

pub use address::TopicResolver;
pub use assembler::assemble;
pub use email_parser::{extract_plain_text_body, parse_media_type, MediaType};
