use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fwd::collector::{GitHubFeed, IncrementalCollector};
use fwd::config::{BusTarget, Config};
use fwd::cursor::CursorStore;
use fwd::pipeline::bus::{DryRunBus, PubSubBus};
use fwd::pipeline::{MessageBus, Pipeline};
use fwd::push::{KubeEventFeed, WatchSource};
use fwd::server::WebhookServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fwd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(topic = %config.topic(), "Starting fwd");

    match config.bus.clone() {
        BusTarget::DryRun => {
            tracing::warn!("Dry run: messages are logged, not published");
            run(Arc::new(DryRunBus::new()), config).await
        }
        BusTarget::PubSub(pubsub) => {
            let bus = PubSubBus::new(pubsub).context("failed to create Pub/Sub client")?;
            bus.ensure_topic(config.topic())
                .await
                .with_context(|| format!("topic {} is not usable", config.topic()))?;
            run(Arc::new(bus), config).await
        }
    }
}

async fn run<B: MessageBus + 'static>(bus: Arc<B>, config: Config) -> anyhow::Result<()> {
    let mut pipeline = Pipeline::new(bus, config.publisher.clone())
        .with_queue_capacity(config.queue_capacity)
        .with_source(
            WebhookServer::new(config.listen_addr)
                .with_github_secret(config.github_webhook_secret.clone())
                .with_tfc_secret(config.tfc_webhook_secret.clone()),
        );

    if let Some(collector) = config.collector.clone() {
        let feed = GitHubFeed::from_token(config.github_token.clone())
            .context("failed to create GitHub client")?;
        pipeline = pipeline.with_source(IncrementalCollector::new(
            Arc::new(feed),
            Arc::new(CursorStore::new()),
            collector,
        ));
    }

    if let Some(kubernetes) = config.kubernetes.clone() {
        let feed = KubeEventFeed::new(kubernetes).context("failed to create Kubernetes client")?;
        pipeline = pipeline.with_source(WatchSource::new(feed));
    }

    tracing::info!(sources = ?pipeline.source_names(), "Starting pipeline");

    let shutdown = CancellationToken::new();
    let running = pipeline
        .start(&shutdown)
        .await
        .context("failed to start pipeline")?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining");
    shutdown.cancel();

    let report = running.shutdown().await;
    tracing::info!(
        batches = report.batches,
        published = report.events_published,
        failed = report.events_failed,
        dropped = report.events_dropped,
        "Shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
