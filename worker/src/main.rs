//! Hound service binary.
//!
//! Startup order: configuration, tracing, metrics, database (with
//! migrations), broker (with topic declaration), workers, HTTP ingress.
//! Ctrl+C or SIGTERM stops the ingress first, then signals both workers,
//! which finish the message in hand before exiting.

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use hound_core::environment::{Clock, SystemClock};
use hound_core::queue::{DurableQueue, QueueError};
use hound_postgres::PostgresTodoRepository;
use hound_redpanda::RedpandaQueue;
use hound_runtime::metrics::MetricsServer;
use hound_runtime::{CommandProducer, ConsumerStats, DomainStore, shutdown};
use hound_worker::service::{self, PipelineSettings};
use hound_worker::{LlmIntentClassifier, LoggingNotifier, WorkerConfig, ingress};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "hound=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    info!(
        brokers = %config.broker.brokers,
        http_addr = %config.server.http_addr,
        max_attempts = config.retry.max_attempts,
        "Configuration loaded"
    );

    if let Some(addr) = config.server.metrics_addr {
        start_metrics(addr).await?;
    }

    let repo = PostgresTodoRepository::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    repo.migrate().await?;

    let broker = RedpandaQueue::builder()
        .brokers(&config.broker.brokers)
        .consumer_group(&config.broker.consumer_group)
        .timeout(config.broker.publish_timeout)
        .build()?;
    let queues = service::queues();
    let names: Vec<&str> = queues.iter().map(String::as_str).collect();
    broker.declare(&names).await.context("Failed to declare queues")?;
    let queue: Arc<dyn DurableQueue> = Arc::new(broker);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let classifier = LlmIntentClassifier::new(&config.classifier, Arc::clone(&clock))?;
    let settings = PipelineSettings {
        policy: config.retry.policy(),
        publish_timeout: config.broker.publish_timeout,
    };

    let (trigger, signal) = shutdown::channel();

    let commands = service::command_worker(
        Arc::clone(&queue),
        DomainStore::new(repo.clone(), clock),
        classifier,
        &settings,
    );
    let commands_signal = signal.clone();
    let commands: WorkerHandle = tokio::spawn(async move { commands.run(commands_signal).await });

    let replies = service::reply_worker(Arc::clone(&queue), LoggingNotifier, &settings);
    let replies: WorkerHandle = tokio::spawn(async move { replies.run(signal).await });

    let producer = CommandProducer::with_timeout(Arc::clone(&queue), config.broker.publish_timeout);
    let listener = tokio::net::TcpListener::bind(config.server.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.http_addr))?;
    info!(addr = %config.server.http_addr, "Ingress listening");

    axum::serve(listener, ingress::router(producer))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Ingress stopped, draining workers");
    trigger.trigger();
    for (name, worker) in [("commands", commands), ("replies", replies)] {
        match worker.await {
            Ok(Ok(stats)) => info!(
                worker = name,
                acked = stats.acked,
                requeued = stats.requeued,
                dropped = stats.dropped,
                dead_lettered = stats.dead_lettered,
                "Worker stopped"
            ),
            Ok(Err(e)) => error!(worker = name, error = %e, "Worker failed"),
            Err(e) => error!(worker = name, error = %e, "Worker task panicked"),
        }
    }

    repo.close().await;
    info!("Shutdown complete");
    Ok(())
}

type WorkerHandle = JoinHandle<Result<ConsumerStats, QueueError>>;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
async fn start_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    let mut server = MetricsServer::new(addr);
    server.start()?;
    let handle = server
        .handle()
        .cloned()
        .context("Metrics recorder not installed")?;

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener {addr}"))?;
    info!(addr = %addr, "Metrics endpoint listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server failed");
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal, shutting down gracefully..."),
        () = terminate => info!("Received SIGTERM signal, shutting down gracefully..."),
    }
}
