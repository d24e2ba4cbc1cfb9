use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::{IdCache, OrderCache};
use crate::catalog::{DimensionCatalog, HttpCatalogClient};
use crate::config::{CatalogConfig, Config, GraphKind};
use crate::consumer::ConsumeLoop;
use crate::export::health::HealthMetrics;
use crate::graph::{GraphBackend, GraphStore, MemoryGraph, Neo4jHttpStore};
use crate::handler::ObservationHandler;
use crate::observation::ObservationMapper;
use crate::publish::{self, ResultPublisher, Sink, WriterSink};
use crate::report::SinkErrorReporter;
use crate::source::{BoxedLineSource, MessageSource};
use crate::store::ObservationStore;

/// Errors raised while stopping the importer.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("graceful shutdown did not finish within {0:?}")]
    Timeout(Duration),
}

/// The external collaborators an importer runs against.
pub struct Components<C, S, R, E, G> {
    pub catalog: C,
    pub source: S,
    pub results: R,
    pub errors: E,
    pub graph: G,
}

/// Importer wired from configuration: HTTP catalog, line-delimited I/O and
/// the configured graph backend.
pub type ConfiguredImporter =
    Importer<HttpCatalogClient, BoxedLineSource, WriterSink, WriterSink, GraphBackend>;

/// Importer owns the pipeline components and their lifecycle.
pub struct Importer<C, S, R, E, G> {
    cfg: Config,
    health: Arc<HealthMetrics>,
    catalog: Arc<C>,
    source: Arc<S>,
    results: Arc<R>,
    errors: Arc<E>,
    graph: Arc<G>,
    cancel: CancellationToken,
    consumer: Option<JoinHandle<Result<()>>>,
    purger: Option<JoinHandle<()>>,
}

impl ConfiguredImporter {
    /// Builds the importer's collaborators from configuration.
    pub async fn from_config(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let catalog = create_catalog_client(&cfg.catalog, &health)?;

        let source = BoxedLineSource::open(&cfg.io.input).await?;
        let results = WriterSink::open("results", &cfg.io.results, publish::stdout).await?;
        let errors = WriterSink::open("errors", &cfg.io.errors, publish::stderr).await?;

        let graph = match cfg.graph.kind {
            GraphKind::Memory => {
                info!("using in-memory graph store, observations are not persisted");
                GraphBackend::Memory(MemoryGraph::new())
            }
            GraphKind::Neo4j => {
                let store = Neo4jHttpStore::new(&cfg.graph.neo4j)
                    .context("creating Neo4j graph store")?;
                info!(endpoint = %cfg.graph.neo4j.endpoint, "Neo4j graph store configured");
                GraphBackend::Neo4j(store)
            }
        };

        Ok(Self::new(
            cfg,
            health,
            Components {
                catalog,
                source,
                results,
                errors,
                graph,
            },
        ))
    }
}

/// Create a catalog client with metrics callback.
fn create_catalog_client(
    cfg: &CatalogConfig,
    health: &Arc<HealthMetrics>,
) -> Result<HttpCatalogClient> {
    let client = HttpCatalogClient::new(cfg).context("creating catalog client")?;

    let health = Arc::clone(health);
    let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
        health
            .catalog_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        health
            .catalog_request_duration
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }));

    Ok(client)
}

impl<C, S, R, E, G> Importer<C, S, R, E, G>
where
    C: DimensionCatalog + 'static,
    S: MessageSource + 'static,
    S::Message: 'static,
    R: Sink + 'static,
    E: Sink + 'static,
    G: GraphStore + 'static,
{
    pub fn new(cfg: Config, health: Arc<HealthMetrics>, parts: Components<C, S, R, E, G>) -> Self {
        Self {
            cfg,
            health,
            catalog: Arc::new(parts.catalog),
            source: Arc::new(parts.source),
            results: Arc::new(parts.results),
            errors: Arc::new(parts.errors),
            graph: Arc::new(parts.graph),
            cancel: CancellationToken::new(),
            consumer: None,
            purger: None,
        }
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn graph(&self) -> &Arc<G> {
        &self.graph
    }

    /// Start the health server, then the cache purger and the consume loop.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let ttl = self.cfg.cache.ttl;
        let orders = Arc::new(OrderCache::new(
            Arc::clone(&self.catalog),
            ttl,
            Some(Arc::clone(&self.health)),
        ));
        let ids = Arc::new(IdCache::new(
            Arc::clone(&self.catalog),
            ttl,
            Some(Arc::clone(&self.health)),
        ));

        self.spawn_cache_purger(Arc::clone(&orders), Arc::clone(&ids));

        let reporter = Arc::new(SinkErrorReporter::new(
            Arc::clone(&self.errors),
            Some(Arc::clone(&self.health)),
        ));
        let store = ObservationStore::new(
            ids,
            Arc::clone(&self.graph),
            reporter,
            Some(Arc::clone(&self.health)),
        );
        let handler = Arc::new(ObservationHandler::new(
            ObservationMapper::new(orders),
            store,
            ResultPublisher::new(Arc::clone(&self.results)),
        ));

        let consumer = ConsumeLoop::new(
            Arc::clone(&self.source),
            handler,
            self.cfg.batch.size,
            self.cfg.batch.wait,
            Some(Arc::clone(&self.health)),
        );
        self.consumer = Some(tokio::spawn(consumer.run(self.cancel.child_token())));

        info!(
            batch_size = self.cfg.batch.size,
            batch_wait = ?self.cfg.batch.wait,
            "importer started",
        );

        Ok(())
    }

    fn spawn_cache_purger(&mut self, orders: Arc<OrderCache<C>>, ids: Arc<IdCache<C>>) {
        let cancel = self.cancel.clone();
        let interval = self.cfg.cache.purge_interval;

        self.purger = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let orders_purged = orders.purge_expired();
                        let ids_purged = ids.purge_expired();
                        debug!(orders_purged, ids_purged, "purged expired cache entries");
                    }
                }
            }
        }));
    }

    /// Waits for the consume loop to exit on its own: `Ok` once the source is
    /// exhausted, the handler's error if it failed. Cancel-safe.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.consumer.as_mut() else {
            return Ok(());
        };

        let outcome = handle.await;
        self.consumer = None;

        outcome.context("consume loop task panicked")?
    }

    /// Cancel the consume loop and release resources in order, bounded by
    /// the graceful shutdown timeout.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        let timeout = self.cfg.graceful_shutdown_timeout;
        match tokio::time::timeout(timeout, self.teardown()).await {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?timeout, "graceful shutdown timed out");
                Err(ShutdownError::Timeout(timeout).into())
            }
        }
    }

    async fn teardown(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        // In-flight flushes are allowed to finish.
        if let Some(handle) = self.consumer.take() {
            outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::Error::new(e).context("consume loop task panicked")),
            };
        }

        if let Some(handle) = self.purger.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "cache purger task failed");
            }
        }

        if let Err(e) = self.source.close().await {
            error!(error = %e, "error closing message source");
        }

        if let Err(e) = self.results.close().await {
            error!(error = %e, sink = self.results.name(), "error closing result sink");
        }

        if let Err(e) = self.errors.close().await {
            error!(error = %e, sink = self.errors.name(), "error closing error sink");
        }

        if let Err(e) = self.graph.close().await {
            error!(error = %e, "error closing graph store");
        }

        self.health.stop().await?;

        info!("importer stopped");

        outcome
    }
}
