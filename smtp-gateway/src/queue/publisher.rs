//! Async RabbitMQ publisher for outbound topic messages.
//!
//! The gateway core only sees the [`Publisher`] trait; [`AmqpPublisher`] is the
//! production implementation that routes each message to a topic exchange with
//! the topic name as routing key.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::OutboundMessage;

/// Destination for assembled messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a message. Returning an error aborts the SMTP transaction.
    async fn publish(&self, message: &OutboundMessage) -> Result<()>;
}

/// Async RabbitMQ publisher with connection management.
///
/// The publisher maintains a persistent connection and channel to RabbitMQ,
/// automatically reconnecting on failure.
#[derive(Clone)]
pub struct AmqpPublisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    exchange: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl AmqpPublisher {
    /// Create a new publisher for the given RabbitMQ URL and topic exchange.
    pub fn new(url: String, exchange: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                exchange,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Ensure we have a valid connection and channel.
    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        info!("rabbitmq_publisher_connected");

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        ch.exchange_declare(
            &self.inner.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare topic exchange")?;

        info!(exchange = %self.inner.exchange, "rabbitmq_exchange_declared");

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

/// Only a broker ack counts as delivered.
fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => anyhow::bail!("Broker rejected message"),
        Confirmation::NotRequested => anyhow::bail!("Publisher confirms not enabled on channel"),
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let body = serde_json::to_vec(message).context("Failed to serialize message")?;

        let confirmation = channel
            .basic_publish(
                &self.inner.exchange,
                &message.topic,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message.id.clone().into()),
            )
            .await
            .context("Failed to publish message")?
            .await
            .context("Failed to confirm publish")?;
        check_confirmation(confirmation)?;

        info!(
            exchange = %self.inner.exchange,
            topic = %message.topic,
            message_id = %message.id,
            body_length = body.len(),
            "rabbitmq_message_published"
        );

        Ok(())
    }
}
