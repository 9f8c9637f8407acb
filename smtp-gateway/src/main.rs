//! Topicmail Gateway - SMTP listener publishing inbound email to topics.
//!
//! Runs the SMTP listener and the monitoring web server side by side until
//! SIGINT/SIGTERM, then closes the RabbitMQ connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use topicmail::smtp::{self, ListenerSettings};
use topicmail::web::{self, AppState};
use topicmail::{AmqpPublisher, Backend, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("gateway_starting");

    let config = Config::from_env();
    info!(
        smtp_listen = %config.smtp_listen,
        smtp_domain = %config.smtp_domain,
        addr_prefix_set = !config.smtp_addr_prefix.is_empty(),
        message_limit = config.message_limit,
        max_message_bytes = config.max_message_bytes,
        amqp_url_set = !config.amqp_url.is_empty(),
        amqp_exchange = %config.amqp_exchange,
        port = config.port,
        "config_loaded"
    );

    let publisher = AmqpPublisher::new(config.amqp_url.clone(), config.amqp_exchange.clone());
    let backend = Backend::from_config(&config, Arc::new(publisher.clone()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let smtp_listener = TcpListener::bind(&config.smtp_listen)
        .await
        .context("Failed to bind SMTP address")?;
    let smtp_task = tokio::spawn(smtp::serve(
        smtp_listener,
        backend.clone(),
        ListenerSettings::from_config(&config),
        wait_for_shutdown(shutdown_rx.clone()),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let web_listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind monitoring address")?;
    info!(address = %addr, "web_server_listening");

    let app = web::router(AppState::new(backend));
    let web_task = tokio::spawn(async move {
        axum::serve(web_listener, app)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    smtp_task.await.context("SMTP task panicked")??;
    web_task
        .await
        .context("Web task panicked")?
        .context("Web server error")?;

    publisher.close().await;

    info!("gateway_shutdown_complete");

    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow();
        if stopping || rx.changed().await.is_err() {
            break;
        }
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("gateway_shutting_down");
}
