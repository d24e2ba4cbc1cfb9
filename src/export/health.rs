use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "observation_importer";

/// Prometheus metrics for importer health and observability.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    server: parking_lot::Mutex<Option<RunningServer>>,

    /// Total messages read from the source.
    pub messages_received: Counter,
    /// Messages dropped because their payload could not be decoded.
    pub messages_dropped: Counter,
    /// Batches flushed by trigger (size/timeout/drain).
    pub batches_flushed: CounterVec,
    /// Events per flushed batch.
    pub batch_size: Histogram,
    /// Time to handle and commit one batch.
    pub flush_duration: Histogram,
    /// Observations persisted to the graph store.
    pub observations_inserted: Counter,
    /// Instance partitions that failed, by stage (ids/write).
    pub instance_failures: CounterVec,
    /// Error records published to the error sink.
    pub errors_reported: Counter,
    /// Cache lookups by cache (order/ids) and outcome (hit/miss).
    pub cache_requests: CounterVec,
    /// Catalog requests by endpoint and status.
    pub catalog_requests_total: CounterVec,
    /// Catalog request duration by endpoint.
    pub catalog_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_received = Counter::with_opts(
            Opts::new(
                "messages_received_total",
                "Total messages read from the message source.",
            )
            .namespace(NAMESPACE),
        )?;
        let messages_dropped = Counter::with_opts(
            Opts::new(
                "messages_dropped_total",
                "Total messages dropped because they could not be decoded.",
            )
            .namespace(NAMESPACE),
        )?;
        let batches_flushed = CounterVec::new(
            Opts::new("batches_flushed_total", "Total batches flushed by trigger.")
                .namespace(NAMESPACE),
            &["trigger"],
        )?;
        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_size", "Number of events per flushed batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to handle and commit one batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let observations_inserted = Counter::with_opts(
            Opts::new(
                "observations_inserted_total",
                "Total observations persisted to the graph store.",
            )
            .namespace(NAMESPACE),
        )?;
        let instance_failures = CounterVec::new(
            Opts::new(
                "instance_failures_total",
                "Total instance partitions that failed by stage.",
            )
            .namespace(NAMESPACE),
            &["stage"],
        )?;
        let errors_reported = Counter::with_opts(
            Opts::new(
                "errors_reported_total",
                "Total error records published to the error sink.",
            )
            .namespace(NAMESPACE),
        )?;
        let cache_requests = CounterVec::new(
            Opts::new(
                "cache_requests_total",
                "Total cache lookups by cache and outcome.",
            )
            .namespace(NAMESPACE),
            &["cache", "outcome"],
        )?;
        let catalog_requests_total = CounterVec::new(
            Opts::new(
                "catalog_requests_total",
                "Total dimension catalog requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let catalog_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "catalog_request_duration_seconds",
                "Dimension catalog request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["endpoint"],
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(observations_inserted.clone()))?;
        registry.register(Box::new(instance_failures.clone()))?;
        registry.register(Box::new(errors_reported.clone()))?;
        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(catalog_requests_total.clone()))?;
        registry.register(Box::new(catalog_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            server: parking_lot::Mutex::new(None),
            messages_received,
            messages_dropped,
            batches_flushed,
            batch_size,
            flush_duration,
            observations_inserted,
            instance_failures,
            errors_reported,
            cache_requests,
            catalog_requests_total,
            catalog_request_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8080"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();

        let task = tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        *self.server.lock() = Some(RunningServer {
            cancel,
            task,
            addr: local_addr,
        });

        Ok(())
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|server| server.addr)
    }

    /// Gracefully shuts down the health metrics server and waits for it to
    /// exit.
    pub async fn stop(&self) -> Result<()> {
        let Some(server) = self.server.lock().take() else {
            return Ok(());
        };

        server.cancel.cancel();
        server
            .task
            .await
            .context("health metrics server task panicked")?;

        tracing::info!("health metrics server stopped");

        Ok(())
    }
}

struct RunningServer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
