use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::catalog::DimensionCatalog;
use crate::event::ExtractedEvent;
use crate::graph::GraphStore;
use crate::observation::ObservationMapper;
use crate::publish::{ResultPublisher, Sink};
use crate::report::ErrorReporter;
use crate::store::ObservationStore;

/// Processes one flushed batch. An error is fatal to the consume loop.
pub trait BatchHandler: Send + Sync {
    fn handle(
        &self,
        events: &[ExtractedEvent],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Maps extracted rows, persists them per instance and publishes results.
pub struct ObservationHandler<C, G, R, S> {
    mapper: ObservationMapper<C>,
    store: ObservationStore<C, G, R>,
    publisher: ResultPublisher<S>,
}

impl<C, G, R, S> ObservationHandler<C, G, R, S> {
    pub fn new(
        mapper: ObservationMapper<C>,
        store: ObservationStore<C, G, R>,
        publisher: ResultPublisher<S>,
    ) -> Self {
        Self {
            mapper,
            store,
            publisher,
        }
    }
}

impl<C, G, R, S> BatchHandler for ObservationHandler<C, G, R, S>
where
    C: DimensionCatalog,
    G: GraphStore,
    R: ErrorReporter,
    S: Sink,
{
    async fn handle(&self, events: &[ExtractedEvent]) -> Result<()> {
        let mut observations = Vec::with_capacity(events.len());
        for event in events {
            let observation = self
                .mapper
                .map(&event.row, event.row_index, &event.instance_id)
                .await
                .with_context(|| {
                    format!(
                        "mapping row {} of instance {}",
                        event.row_index, event.instance_id
                    )
                })?;
            observations.push(observation);
        }

        let results = match self.store.save_all(observations).await {
            Ok(results) => results,
            Err(e) => {
                // The batch is not committed and will be redelivered, so the
                // partial results are not published.
                warn!(persisted = e.partial.len(), "abandoning batch after id resolution failure");
                return Err(e.into());
            }
        };

        self.publisher
            .publish(&results)
            .await
            .context("publishing results")?;

        debug!(
            events = events.len(),
            instances = results.len(),
            "handled batch"
        );

        Ok(())
    }
}
