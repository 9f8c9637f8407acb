//! SMTP front end.
//!
//! The listener owns the wire protocol; the gateway logic lives in
//! [`crate::session`].

pub mod listener;

pub use listener::{serve, ListenerSettings};
