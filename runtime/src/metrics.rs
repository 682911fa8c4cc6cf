//! Prometheus metrics for the pipeline.
//!
//! Counters are labelled with the queue they concern:
//!
//! | Metric | Meaning |
//! |---|---|
//! | `pipeline_messages_received_total` | deliveries taken from a queue |
//! | `pipeline_messages_acked_total` | deliveries handled and acknowledged |
//! | `pipeline_messages_requeued_total` | deliveries handed back for another attempt |
//! | `pipeline_messages_dropped_total` | malformed deliveries dropped |
//! | `pipeline_messages_dead_lettered_total` | deliveries moved to a dead-letter queue |
//! | `producer_envelopes_published_total` | envelopes accepted by the broker |
//! | `domain_store_replays_total` | mutations answered from the idempotency record |
//!
//! # Example
//!
//! ```rust,no_run
//! use hound_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! let _text = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Deliveries taken from a queue.
pub const MESSAGES_RECEIVED: &str = "pipeline_messages_received_total";
/// Deliveries acknowledged.
pub const MESSAGES_ACKED: &str = "pipeline_messages_acked_total";
/// Deliveries requeued.
pub const MESSAGES_REQUEUED: &str = "pipeline_messages_requeued_total";
/// Malformed deliveries dropped.
pub const MESSAGES_DROPPED: &str = "pipeline_messages_dropped_total";
/// Deliveries dead-lettered.
pub const MESSAGES_DEAD_LETTERED: &str = "pipeline_messages_dead_lettered_total";
/// Envelopes published.
pub const ENVELOPES_PUBLISHED: &str = "producer_envelopes_published_total";
/// Idempotent replays.
pub const DOMAIN_STORE_REPLAYS: &str = "domain_store_replays_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address its scrape endpoint is served on.
///
/// The HTTP endpoint itself is served by the binary from [`render`](Self::render).
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint will bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint binds to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a different recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics recorder installed");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(MESSAGES_RECEIVED, "Deliveries taken from a queue");
    describe_counter!(MESSAGES_ACKED, "Deliveries handled and acknowledged");
    describe_counter!(MESSAGES_REQUEUED, "Deliveries handed back for another attempt");
    describe_counter!(MESSAGES_DROPPED, "Malformed deliveries dropped without requeue");
    describe_counter!(MESSAGES_DEAD_LETTERED, "Deliveries moved to a dead-letter queue");
    describe_counter!(ENVELOPES_PUBLISHED, "Envelopes accepted by the broker");
    describe_counter!(
        DOMAIN_STORE_REPLAYS,
        "Mutations answered from a recorded idempotent response"
    );
}

/// Consumer-side counters.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a delivery received.
    pub fn record_received(queue: &str) {
        counter!(MESSAGES_RECEIVED, "queue" => queue.to_string()).increment(1);
    }

    /// Record an acknowledged delivery.
    pub fn record_acked(queue: &str) {
        counter!(MESSAGES_ACKED, "queue" => queue.to_string()).increment(1);
    }

    /// Record a requeued delivery.
    pub fn record_requeued(queue: &str) {
        counter!(MESSAGES_REQUEUED, "queue" => queue.to_string()).increment(1);
    }

    /// Record a dropped delivery.
    pub fn record_dropped(queue: &str) {
        counter!(MESSAGES_DROPPED, "queue" => queue.to_string()).increment(1);
    }

    /// Record a dead-lettered delivery.
    pub fn record_dead_lettered(queue: &str) {
        counter!(MESSAGES_DEAD_LETTERED, "queue" => queue.to_string()).increment(1);
    }
}

/// Record an envelope accepted by the broker.
pub fn record_published(queue: &str) {
    counter!(ENVELOPES_PUBLISHED, "queue" => queue.to_string()).increment(1);
}

/// Record a replayed idempotent response.
pub fn record_replay() {
    counter!(DOMAIN_STORE_REPLAYS).increment(1);
}
