use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{resolve_node_ids, GraphError, GraphStore};
use crate::catalog::DimensionIds;
use crate::config::Neo4jConfig;
use crate::observation::Observation;

/// Graph store writing through the Neo4j transactional HTTP endpoint.
///
/// Each instance partition runs in its own transaction holding one `UNWIND`
/// statement. The transaction is committed only when every row created its
/// observation node and is rolled back otherwise, so a partition is written
/// entirely or not at all.
pub struct Neo4jHttpStore {
    http: reqwest::Client,
    endpoint: String,
    begin_url: String,
    username: String,
    password: String,
}

impl Neo4jHttpStore {
    pub fn new(cfg: &Neo4jConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();

        Ok(Self {
            http,
            begin_url: format!("{endpoint}/db/{}/tx", cfg.database),
            endpoint,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, url);
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    /// Resolves a URL returned by the server, which may be relative.
    fn server_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.endpoint, url.trim_start_matches('/'))
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<TxResponse, GraphError> {
        let response = request
            .send()
            .await
            .map_err(|e| GraphError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GraphError::Request(format!("unexpected status {status}")));
        }

        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Request(format!("decoding transaction response: {e}")))?;

        // Neo4j rolls the transaction back itself on statement errors.
        match parsed.errors.first() {
            Some(err) => Err(GraphError::Query(format!("{}: {}", err.code, err.message))),
            None => Ok(parsed),
        }
    }

    /// Runs `statement` in a new transaction and commits it when it created
    /// exactly `expected` nodes.
    async fn write(
        &self,
        statement: String,
        rows: Vec<Value>,
        expected: usize,
    ) -> Result<(), GraphError> {
        let body = json!({
            "statements": [{
                "statement": statement,
                "parameters": { "rows": rows },
                "includeStats": true,
            }],
        });

        let opened = self
            .send(self.request(reqwest::Method::POST, &self.begin_url).json(&body))
            .await?;

        let commit_url = opened
            .commit
            .as_deref()
            .map(|url| self.server_url(url))
            .ok_or_else(|| GraphError::Request("transaction response has no commit URL".to_string()))?;

        let created = opened
            .results
            .first()
            .and_then(|result| result.stats.as_ref())
            .map_or(0, |stats| stats.nodes_created);

        if created != expected {
            let tx_url = commit_url.trim_end_matches("/commit");
            if let Err(e) = self.send(self.request(reqwest::Method::DELETE, tx_url)).await {
                warn!(error = %e, tx_url, "rolling back transaction");
            }
            return Err(GraphError::Query(format!(
                "created {created} of {expected} observation nodes, transaction rolled back"
            )));
        }

        self.send(
            self.request(reqwest::Method::POST, &commit_url)
                .json(&json!({ "statements": [] })),
        )
        .await?;

        Ok(())
    }
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    commit: Option<String>,
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<StatementError>,
}

#[derive(Deserialize)]
struct StatementResult {
    #[serde(default)]
    stats: Option<StatementStats>,
}

#[derive(Deserialize)]
struct StatementStats {
    #[serde(default)]
    nodes_created: usize,
}

#[derive(Deserialize)]
struct StatementError {
    code: String,
    message: String,
}

/// Quotes a label, doubling any embedded backticks.
fn escape_label(label: &str) -> String {
    format!("`{}`", label.replace('`', "``"))
}

/// Builds the per-partition insert statement for the given dimensions.
pub(crate) fn build_statement(instance_id: &str, dimensions: &[&str]) -> String {
    let mut statement = String::from("UNWIND $rows AS row\n");

    for (n, dimension) in dimensions.iter().enumerate() {
        let label = escape_label(&format!("_{instance_id}_{dimension}"));
        let _ = writeln!(
            statement,
            "MATCH (d{n}:{label}) WHERE id(d{n}) = toInteger(row.d{n})"
        );
    }

    let label = escape_label(&format!("_{instance_id}_observation"));
    let _ = writeln!(
        statement,
        "CREATE (o:{label} {{value: row.v, rowIndex: row.i}})"
    );

    for n in 0..dimensions.len() {
        let _ = writeln!(statement, "CREATE (o)-[:isValueOf]->(d{n})");
    }

    statement
}

/// Builds the `$rows` parameter. Every observation must carry the same
/// dimensions, in the same order, as the first.
pub(crate) fn build_rows(
    instance_id: &str,
    dimensions: &[&str],
    observations: &[Observation],
    dimension_ids: &DimensionIds,
) -> Result<Vec<Value>, GraphError> {
    observations
        .iter()
        .map(|obs| {
            let same_shape = obs.dimension_options.len() == dimensions.len()
                && obs
                    .dimension_options
                    .iter()
                    .zip(dimensions)
                    .all(|(option, dimension)| option.dimension_name == *dimension);
            if !same_shape {
                return Err(GraphError::Query(format!(
                    "row {} of instance {instance_id} does not match the partition's dimensions",
                    obs.row_index
                )));
            }

            let node_ids = resolve_node_ids(obs, dimension_ids)?;

            let mut row = Map::new();
            row.insert("v".to_string(), Value::from(obs.value()));
            row.insert("i".to_string(), Value::from(obs.row_index));
            for (n, id) in node_ids.into_iter().enumerate() {
                row.insert(format!("d{n}"), Value::from(id));
            }

            Ok(Value::Object(row))
        })
        .collect()
}

impl GraphStore for Neo4jHttpStore {
    async fn insert_observation_batch(
        &self,
        partition: usize,
        instance_id: &str,
        observations: &[Observation],
        dimension_ids: &DimensionIds,
    ) -> Result<(), GraphError> {
        let Some(first) = observations.first() else {
            return Ok(());
        };

        let dimensions: Vec<&str> = first
            .dimension_options
            .iter()
            .map(|option| option.dimension_name.as_str())
            .collect();

        let rows = build_rows(instance_id, &dimensions, observations, dimension_ids)?;
        let statement = build_statement(instance_id, &dimensions);

        self.write(statement, rows, observations.len()).await?;

        debug!(
            partition,
            instance_id,
            observations = observations.len(),
            "committed observation partition",
        );

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
