//! Per-instance persistence of a flushed batch.
//!
//! Id resolution failures abort the whole call; write failures only skip the
//! failing instance.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cache::IdCache;
use crate::catalog::{CatalogError, DimensionCatalog};
use crate::event::InsertedEvent;
use crate::export::health::HealthMetrics;
use crate::graph::GraphStore;
use crate::observation::Observation;
use crate::report::{report_best_effort, ErrorReporter};

/// Dimension ids could not be resolved for an instance. Carries the results
/// of the partitions persisted before the failure.
#[derive(Error, Debug)]
#[error("resolving dimension ids for instance {instance_id}: {source}")]
pub struct SaveAllError {
    pub instance_id: String,
    pub partial: Vec<InsertedEvent>,
    #[source]
    pub source: CatalogError,
}

/// Splits observations by instance. Partitions are ordered by first
/// appearance and keep the relative order of their observations.
pub fn partition_by_instance(observations: Vec<Observation>) -> Vec<(String, Vec<Observation>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut partitions: Vec<(String, Vec<Observation>)> = Vec::new();

    for obs in observations {
        match index.get(&obs.instance_id) {
            Some(&i) => partitions[i].1.push(obs),
            None => {
                index.insert(obs.instance_id.clone(), partitions.len());
                partitions.push((obs.instance_id.clone(), vec![obs]));
            }
        }
    }

    partitions
}

pub struct ObservationStore<C, G, R> {
    ids: Arc<IdCache<C>>,
    graph: Arc<G>,
    reporter: Arc<R>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C, G, R> ObservationStore<C, G, R>
where
    C: DimensionCatalog,
    G: GraphStore,
    R: ErrorReporter,
{
    pub fn new(
        ids: Arc<IdCache<C>>,
        graph: Arc<G>,
        reporter: Arc<R>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            ids,
            graph,
            reporter,
            health,
        }
    }

    fn record_failure(&self, stage: &str) {
        if let Some(health) = &self.health {
            health.instance_failures.with_label_values(&[stage]).inc();
        }
    }

    /// Persists observations per instance, returning one result per instance
    /// written.
    pub async fn save_all(
        &self,
        observations: Vec<Observation>,
    ) -> Result<Vec<InsertedEvent>, SaveAllError> {
        let mut results = Vec::new();

        for (partition, (instance_id, batch)) in
            partition_by_instance(observations).into_iter().enumerate()
        {
            let ids = match self.ids.get(&instance_id).await {
                Ok(ids) => ids,
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "resolving dimension ids");
                    self.record_failure("ids");
                    report_best_effort(
                        self.reporter.as_ref(),
                        &instance_id,
                        "resolving dimension ids",
                        &e,
                    )
                    .await;

                    return Err(SaveAllError {
                        instance_id,
                        partial: results,
                        source: e,
                    });
                }
            };

            let count = match i32::try_from(batch.len()) {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        instance_id = %instance_id,
                        observations = batch.len(),
                        "skipping instance, partition too large to count",
                    );
                    self.record_failure("write");
                    report_best_effort(
                        self.reporter.as_ref(),
                        &instance_id,
                        "counting observations",
                        &e,
                    )
                    .await;
                    continue;
                }
            };

            if let Err(e) = self
                .graph
                .insert_observation_batch(partition, &instance_id, &batch, &ids)
                .await
            {
                warn!(instance_id = %instance_id, error = %e, "skipping instance after write failure");
                self.record_failure("write");
                report_best_effort(
                    self.reporter.as_ref(),
                    &instance_id,
                    "inserting observations",
                    &e,
                )
                .await;
                continue;
            }

            debug!(
                instance_id = %instance_id,
                partition,
                observations = batch.len(),
                "persisted instance partition",
            );

            if let Some(health) = &self.health {
                health.observations_inserted.inc_by(batch.len() as f64);
            }

            results.push(InsertedEvent {
                instance_id,
                observations_inserted: count,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use parking_lot::Mutex;

    use super::*;
    use crate::catalog::DimensionIds;
    use crate::graph::{GraphError, MemoryGraph};
    use crate::report::Cause;

    fn observation(instance_id: &str, row_index: i64) -> Observation {
        Observation {
            instance_id: instance_id.to_string(),
            row: format!("{row_index},,"),
            row_index,
            dimension_options: Vec::new(),
        }
    }

    struct FakeCatalog {
        missing: Vec<&'static str>,
    }

    impl DimensionCatalog for FakeCatalog {
        async fn fetch_order(&self, _instance_id: &str) -> Result<Vec<String>, CatalogError> {
            Ok(vec!["V4_0".to_string()])
        }

        async fn fetch_ids(&self, instance_id: &str) -> Result<DimensionIds, CatalogError> {
            if self.missing.iter().any(|m| *m == instance_id) {
                return Err(CatalogError::InstanceNotFound(instance_id.to_string()));
            }
            Ok(DimensionIds::new())
        }
    }

    struct FailingGraph {
        fail: Vec<&'static str>,
        inner: MemoryGraph,
        partitions: Mutex<Vec<usize>>,
    }

    impl GraphStore for FailingGraph {
        async fn insert_observation_batch(
            &self,
            partition: usize,
            instance_id: &str,
            observations: &[Observation],
            dimension_ids: &DimensionIds,
        ) -> Result<(), GraphError> {
            self.partitions.lock().push(partition);
            if self.fail.iter().any(|f| *f == instance_id) {
                return Err(GraphError::Query("constraint violated".to_string()));
            }
            self.inner
                .insert_observation_batch(partition, instance_id, observations, dimension_ids)
                .await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<(String, String)>>,
    }

    impl ErrorReporter for RecordingReporter {
        async fn notify(&self, instance_id: &str, context: &str, _cause: &Cause) -> Result<()> {
            self.reports
                .lock()
                .push((instance_id.to_string(), context.to_string()));
            Ok(())
        }
    }

    fn store(
        missing: Vec<&'static str>,
        fail: Vec<&'static str>,
    ) -> (
        ObservationStore<FakeCatalog, FailingGraph, RecordingReporter>,
        Arc<FailingGraph>,
        Arc<RecordingReporter>,
    ) {
        let ids = Arc::new(IdCache::new(
            Arc::new(FakeCatalog { missing }),
            Duration::from_secs(60),
            None,
        ));
        let graph = Arc::new(FailingGraph {
            fail,
            inner: MemoryGraph::new(),
            partitions: Mutex::new(Vec::new()),
        });
        let reporter = Arc::new(RecordingReporter::default());
        let store = ObservationStore::new(ids, Arc::clone(&graph), Arc::clone(&reporter), None);
        (store, graph, reporter)
    }

    #[test]
    fn test_partition_by_instance_preserves_order() {
        let partitions = partition_by_instance(vec![
            observation("b", 0),
            observation("a", 1),
            observation("b", 2),
            observation("a", 3),
        ]);

        let shape: Vec<(&str, Vec<i64>)> = partitions
            .iter()
            .map(|(id, obs)| (id.as_str(), obs.iter().map(|o| o.row_index).collect()))
            .collect();
        assert_eq!(shape, vec![("b", vec![0, 2]), ("a", vec![1, 3])]);
    }

    #[tokio::test]
    async fn test_save_all_counts_per_instance() {
        let (store, graph, reporter) = store(vec![], vec![]);

        let results = store
            .save_all(vec![
                observation("a", 0),
                observation("b", 1),
                observation("a", 2),
            ])
            .await
            .expect("save all");

        assert_eq!(
            results,
            vec![
                InsertedEvent {
                    instance_id: "a".to_string(),
                    observations_inserted: 2,
                },
                InsertedEvent {
                    instance_id: "b".to_string(),
                    observations_inserted: 1,
                },
            ]
        );
        assert_eq!(*graph.partitions.lock(), vec![0, 1]);
        assert!(reporter.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn test_save_all_isolates_write_failure() {
        let (store, graph, reporter) = store(vec![], vec!["a"]);

        let results = store
            .save_all(vec![observation("a", 0), observation("b", 1)])
            .await
            .expect("save all");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].instance_id, "b");
        assert_eq!(results[0].observations_inserted, 1);
        assert_eq!(
            *reporter.reports.lock(),
            vec![("a".to_string(), "inserting observations".to_string())]
        );
        assert_eq!(graph.inner.count("a"), 0);
        assert_eq!(graph.inner.count("b"), 1);
    }

    #[tokio::test]
    async fn test_save_all_aborts_on_id_failure() {
        let (store, graph, reporter) = store(vec!["b"], vec![]);

        let err = store
            .save_all(vec![
                observation("a", 0),
                observation("b", 1),
                observation("c", 2),
            ])
            .await
            .expect_err("id resolution fails");

        assert_eq!(err.instance_id, "b");
        assert_eq!(err.partial.len(), 1);
        assert_eq!(err.partial[0].instance_id, "a");
        assert_eq!(err.source, CatalogError::InstanceNotFound("b".to_string()));
        assert_eq!(
            *reporter.reports.lock(),
            vec![("b".to_string(), "resolving dimension ids".to_string())]
        );
        assert_eq!(graph.inner.count("c"), 0);
    }

    #[tokio::test]
    async fn test_save_all_empty() {
        let (store, _, _) = store(vec![], vec![]);
        assert!(store.save_all(Vec::new()).await.expect("empty").is_empty());
    }
}
