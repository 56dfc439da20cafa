//! Rollup Sender - delivers rollup protocol transactions to the target chain
//!
//! Runs one sender per enabled `[senders.*]` entry and routes their
//! confirmations into rollup status transitions.

use anyhow::{Context, Result};
use prometheus::Registry;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rollup_sender::chain::{ChainClient, ChainProvider};
use rollup_sender::config::Settings;
use rollup_sender::coordination::{ConfirmationRouter, LoggingStatusSink};
use rollup_sender::metrics::{
    MetricsServer, NoopSenderMetrics, PrometheusSenderMetrics, SenderMetrics,
};
use rollup_sender::state::{PendingTxStore, PgPendingTxStore};
use rollup_sender::Sender;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Rollup Sender v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} senders",
        settings.enabled_senders().len()
    );

    let store = PgPendingTxStore::new(&settings.database)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection established");

    store.run_migrations().await?;
    let store: Arc<dyn PendingTxStore> = Arc::new(store);

    let shutdown = CancellationToken::new();

    let registry = Registry::new();
    let metrics: Arc<dyn SenderMetrics> = if settings.metrics.enabled {
        Arc::new(PrometheusSenderMetrics::new(&registry)?)
    } else {
        Arc::new(NoopSenderMetrics)
    };

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port, registry.clone());
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(async move { stop.cancelled().await }).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let mut senders = Vec::new();
    let mut confirmations = Vec::new();
    for (name, sender_settings) in settings.enabled_senders() {
        let client: Arc<dyn ChainClient> =
            Arc::new(ChainProvider::new(&sender_settings.sender.endpoint)?);

        let sender = Sender::new(
            sender_settings.sender.clone(),
            &sender_settings.signer,
            &sender_settings.service,
            name,
            sender_settings.sender_type,
            client,
            store.clone(),
            metrics.clone(),
            &shutdown,
        )
        .await
        .with_context(|| format!("Failed to start sender {}", name))?;

        if let Some(rx) = sender.confirm_chan() {
            confirmations.push(rx);
        }
        senders.push(sender);
    }
    info!("{} senders running", senders.len());

    let router_handle = tokio::spawn(
        ConfirmationRouter::new(Arc::new(LoggingStatusSink)).run(confirmations, shutdown.clone()),
    );

    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    for sender in &senders {
        sender.stop();
    }
    shutdown.cancel();

    if let Err(e) = router_handle.await {
        error!("Confirmation router task failed: {}", e);
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    info!("Rollup Sender stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollup_sender=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
