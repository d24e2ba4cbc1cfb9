pub mod neo4j;

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;

use crate::catalog::{dimension_key, DimensionIds};
use crate::observation::Observation;

pub use neo4j::Neo4jHttpStore;

/// Errors raised while persisting an instance partition.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("no node id for {key} in instance {instance_id}")]
    MissingNodeId { instance_id: String, key: String },

    #[error("graph request failed: {0}")]
    Request(String),

    #[error("graph query failed: {0}")]
    Query(String),
}

/// Persistence capability for observation partitions.
pub trait GraphStore: Send + Sync {
    /// Persist one instance partition as a single atomic write.
    fn insert_observation_batch(
        &self,
        partition: usize,
        instance_id: &str,
        observations: &[Observation],
        dimension_ids: &DimensionIds,
    ) -> impl std::future::Future<Output = Result<(), GraphError>> + Send;

    /// Release the store's connections.
    fn close(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Resolves the node id of every dimension option of an observation, in
/// header order.
pub fn resolve_node_ids<'a>(
    observation: &Observation,
    dimension_ids: &'a DimensionIds,
) -> Result<Vec<&'a str>, GraphError> {
    observation
        .dimension_options
        .iter()
        .map(|option| {
            let key = dimension_key(&option.dimension_name, &option.name);
            dimension_ids
                .get(&key)
                .map(String::as_str)
                .ok_or_else(|| GraphError::MissingNodeId {
                    instance_id: observation.instance_id.clone(),
                    key,
                })
        })
        .collect()
}

/// An observation as held by the in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObservation {
    pub partition: usize,
    pub row_index: i64,
    pub value: String,
    pub node_ids: Vec<String>,
}

/// In-memory graph store.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    instances: Mutex<HashMap<String, Vec<StoredObservation>>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observations stored for an instance, in insertion order.
    pub fn observations(&self, instance_id: &str) -> Vec<StoredObservation> {
        self.instances
            .lock()
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, instance_id: &str) -> usize {
        self.instances.lock().get(instance_id).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.instances.lock().values().map(Vec::len).sum()
    }
}

impl GraphStore for MemoryGraph {
    async fn insert_observation_batch(
        &self,
        partition: usize,
        instance_id: &str,
        observations: &[Observation],
        dimension_ids: &DimensionIds,
    ) -> Result<(), GraphError> {
        // Resolve everything first so a failure writes nothing.
        let stored = observations
            .iter()
            .map(|obs| {
                let node_ids = resolve_node_ids(obs, dimension_ids)?;
                Ok(StoredObservation {
                    partition,
                    row_index: obs.row_index,
                    value: obs.value().to_string(),
                    node_ids: node_ids.into_iter().map(str::to_string).collect(),
                })
            })
            .collect::<Result<Vec<_>, GraphError>>()?;

        self.instances
            .lock()
            .entry(instance_id.to_string())
            .or_default()
            .extend(stored);

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Configured graph store backend.
pub enum GraphBackend {
    Memory(MemoryGraph),
    Neo4j(Neo4jHttpStore),
}

impl GraphStore for GraphBackend {
    async fn insert_observation_batch(
        &self,
        partition: usize,
        instance_id: &str,
        observations: &[Observation],
        dimension_ids: &DimensionIds,
    ) -> Result<(), GraphError> {
        match self {
            Self::Memory(g) => {
                g.insert_observation_batch(partition, instance_id, observations, dimension_ids)
                    .await
            }
            Self::Neo4j(g) => {
                g.insert_observation_batch(partition, instance_id, observations, dimension_ids)
                    .await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Memory(g) => g.close().await,
            Self::Neo4j(g) => g.close().await,
        }
    }
}
