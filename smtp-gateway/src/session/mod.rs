//! SMTP backend and per-connection sessions.
//!
//! The SMTP engine calls [`Backend::login`] or [`Backend::anonymous_login`] once
//! per connection and then drives the returned [`Session`]:
//!
//! ```text
//! mail → rcpt (one or more) → data → (reset | logout)
//! ```
//!
//! `rcpt` resolves the recipient into a topic, `data` turns the message into an
//! [`OutboundMessage`](crate::queue::OutboundMessage) and publishes it. Every
//! failed `rcpt` or `data` is counted in the backend's [`DeliveryCounters`].

pub mod counters;

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::process::{assemble, TopicResolver};
use crate::queue::Publisher;

pub use counters::{Counts, DeliveryCounters};

/// Shared state behind every session of one gateway.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    resolver: TopicResolver,
    message_limit: usize,
    publisher: Arc<dyn Publisher>,
    counters: Arc<DeliveryCounters>,
}

impl Backend {
    pub fn new(
        resolver: TopicResolver,
        message_limit: usize,
        publisher: Arc<dyn Publisher>,
        counters: Arc<DeliveryCounters>,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                resolver,
                message_limit,
                publisher,
                counters,
            }),
        }
    }

    /// Build a backend from configuration with fresh counters.
    pub fn from_config(config: &Config, publisher: Arc<dyn Publisher>) -> Result<Self> {
        let resolver = TopicResolver::new(
            &config.smtp_domain,
            &config.smtp_addr_prefix,
            &config.topic_pattern,
        )
        .context("Invalid topic pattern")?;

        Ok(Self::new(
            resolver,
            config.message_limit,
            publisher,
            Arc::new(DeliveryCounters::new()),
        ))
    }

    /// Start a session for an authenticated client. Credentials are not checked.
    pub fn login(&self, username: &str, _password: &str) -> Session {
        debug!(username = %username, "smtp_login");
        Session::new(self.clone())
    }

    /// Start a session for an anonymous client.
    pub fn anonymous_login(&self) -> Session {
        debug!("smtp_anonymous_login");
        Session::new(self.clone())
    }

    /// Current delivery counts.
    pub async fn counters(&self) -> Counts {
        self.inner.counters.snapshot().await
    }
}

/// Transaction state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No recipient accepted yet
    #[default]
    Idle,
    /// A recipient was resolved to this topic and data is expected
    RecipientAccepted(String),
}

/// One client connection.
pub struct Session {
    backend: Backend,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Mutex::new(SessionState::Idle),
        }
    }

    /// The sender is not validated; topics are authorized by recipient only.
    pub fn mail(&self, from: &str) -> Result<(), GatewayError> {
        debug!(from = %from, "smtp_mail_from");
        Ok(())
    }

    /// Resolve the recipient into the topic for this transaction.
    pub async fn rcpt(&self, to: &str) -> Result<(), GatewayError> {
        match self.backend.inner.resolver.resolve(to) {
            Ok(topic) => {
                info!(to = %to, topic = %topic, "smtp_rcpt_accepted");
                *self.state.lock().await = SessionState::RecipientAccepted(topic);
                Ok(())
            }
            Err(e) => {
                warn!(to = %to, error = %e, "smtp_rcpt_rejected");
                self.backend.inner.counters.record_failure().await;
                Err(e)
            }
        }
    }

    /// Read the message, publish it to the accepted topic and count the outcome.
    ///
    /// The session is back in [`SessionState::Idle`] afterwards, whether or not
    /// delivery succeeded.
    pub async fn data<R>(&self, reader: R) -> Result<(), GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.deliver(reader).await;
        self.backend.inner.counters.record_outcome(&result).await;

        if let Err(e) = &result {
            warn!(error = %e, "smtp_data_rejected");
        }
        result
    }

    async fn deliver<R>(&self, mut reader: R) -> Result<(), GatewayError>
    where
        R: AsyncRead + Unpin,
    {
        let state = std::mem::take(&mut *self.state.lock().await);
        let topic = match state {
            SessionState::RecipientAccepted(topic) => topic,
            SessionState::Idle => return Err(GatewayError::NoRecipient),
        };

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;

        let message = assemble(&topic, &raw, self.backend.inner.message_limit)?;

        self.backend
            .inner
            .publisher
            .publish(&message)
            .await
            .map_err(GatewayError::Publish)?;

        info!(
            topic = %message.topic,
            message_id = %message.id,
            raw_length = raw.len(),
            has_title = !message.title.is_empty(),
            "smtp_data_published"
        );

        Ok(())
    }

    /// Fail a transaction whose message never fully arrived.
    ///
    /// Counted like any other failed `data`; the session returns to
    /// [`SessionState::Idle`].
    pub async fn abort_data(&self, cause: io::Error) -> GatewayError {
        self.reset().await;

        let err = GatewayError::Io(cause);
        self.backend.inner.counters.record_failure().await;
        warn!(error = %err, "smtp_data_aborted");
        err
    }

    /// Forget the current transaction.
    pub async fn reset(&self) {
        *self.state.lock().await = SessionState::Idle;
    }

    pub async fn logout(&self) -> Result<(), GatewayError> {
        self.reset().await;
        Ok(())
    }

    /// Current transaction state.
    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }
}
