use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::CatalogConfig;

/// Errors returned by a dimension catalog lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Transport failure or a server-side error status.
    #[error("dimension catalog unavailable: {0}")]
    Unavailable(String),

    /// The response body could not be parsed.
    #[error("dimension catalog response malformed: {0}")]
    Malformed(String),

    /// The catalog has no such instance.
    #[error("instance not found in dimension catalog: {0}")]
    InstanceNotFound(String),
}

/// Mapping of `"{dimension}_{value}"` to the persisted node identifier.
pub type DimensionIds = HashMap<String, String>;

/// Callback type for recording catalog request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Remote source of per-instance dimension metadata.
pub trait DimensionCatalog: Send + Sync {
    /// Fetch the instance's CSV header, which encodes the dimension order.
    fn fetch_order(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, CatalogError>> + Send;

    /// Fetch the instance's dimension value to node id mapping.
    fn fetch_ids(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<DimensionIds, CatalogError>> + Send;
}

/// Builds the id-mapping key for a dimension value.
pub fn dimension_key(dimension: &str, value: &str) -> String {
    format!("{dimension}_{value}")
}

/// HTTP client for the dimension catalog service.
pub struct HttpCatalogClient {
    http: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    metrics: Option<MetricsCallback>,
}

impl HttpCatalogClient {
    /// Create a new catalog client.
    pub fn new(cfg: &CatalogConfig) -> anyhow::Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            auth_token: (!cfg.auth_token.is_empty()).then(|| cfg.auth_token.clone()),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
        instance_id: &str,
        path: &str,
    ) -> Result<T, CatalogError> {
        let start = Instant::now();
        let url = format!("{}{}", self.endpoint, path);

        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(CatalogError::Unavailable(format!("requesting {path}: {e}")));
            }
        };

        let status = response.status();
        if let Err(e) = classify_status(status, instance_id, path) {
            self.record_request(endpoint, status_label(&e), start.elapsed());
            return Err(e);
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(CatalogError::Unavailable(format!("reading {path}: {e}")));
            }
        };

        let result = serde_json::from_slice::<T>(&body).map_err(|e| {
            CatalogError::Malformed(format!("decoding response from {path}: {e}"))
        });

        let label = match &result {
            Ok(_) => "success",
            Err(e) => status_label(e),
        };
        self.record_request(endpoint, label, start.elapsed());

        result
    }
}

fn classify_status(status: StatusCode, instance_id: &str, path: &str) -> Result<(), CatalogError> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::NOT_FOUND {
        return Err(CatalogError::InstanceNotFound(instance_id.to_string()));
    }

    Err(CatalogError::Unavailable(format!(
        "unexpected status {status} from {path}"
    )))
}

fn status_label(err: &CatalogError) -> &'static str {
    match err {
        CatalogError::Unavailable(_) => "unavailable",
        CatalogError::Malformed(_) => "malformed",
        CatalogError::InstanceNotFound(_) => "not_found",
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct InstanceResponse {
    headers: Vec<String>,
}

#[derive(Deserialize)]
struct DimensionNode {
    dimension_id: String,
    value: String,
    node_id: String,
}

fn ids_from_nodes(nodes: Vec<DimensionNode>) -> DimensionIds {
    nodes
        .into_iter()
        .map(|node| (dimension_key(&node.dimension_id, &node.value), node.node_id))
        .collect()
}

impl DimensionCatalog for HttpCatalogClient {
    async fn fetch_order(&self, instance_id: &str) -> Result<Vec<String>, CatalogError> {
        debug!(instance_id, "fetching dimension order");

        let resp: InstanceResponse = self
            .get_json("instance", instance_id, &format!("/instances/{instance_id}"))
            .await?;

        Ok(resp.headers)
    }

    async fn fetch_ids(&self, instance_id: &str) -> Result<DimensionIds, CatalogError> {
        debug!(instance_id, "fetching dimension ids");

        let nodes: Vec<DimensionNode> = self
            .get_json(
                "dimensions",
                instance_id,
                &format!("/instances/{instance_id}/dimensions"),
            )
            .await?;

        Ok(ids_from_nodes(nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_key() {
        assert_eq!(dimension_key("Time", "Aug-16"), "Time_Aug-16");
        assert_eq!(dimension_key("geography", ""), "geography_");
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, "i", "/instances/i").is_ok());
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "i", "/instances/i"),
            Err(CatalogError::InstanceNotFound("i".to_string()))
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "i", "/instances/i"),
            Err(CatalogError::Unavailable(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "i", "/instances/i"),
            Err(CatalogError::Unavailable(_))
        ));
    }

    #[test]
    fn test_ids_from_nodes() {
        let nodes: Vec<DimensionNode> = serde_json::from_str(
            r#"[
                {"dimension_id": "Time", "value": "Aug-16", "node_id": "11"},
                {"dimension_id": "Geo", "value": "K02000001", "node_id": "12"}
            ]"#,
        )
        .expect("valid json");

        let ids = ids_from_nodes(nodes);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.get("Time_Aug-16").map(String::as_str), Some("11"));
        assert_eq!(ids.get("Geo_K02000001").map(String::as_str), Some("12"));
    }

    #[test]
    fn test_new_strips_trailing_slash() {
        let cfg = CatalogConfig {
            endpoint: "http://catalog:22000/".to_string(),
            ..Default::default()
        };
        let client = HttpCatalogClient::new(&cfg).expect("client");
        assert_eq!(client.endpoint, "http://catalog:22000");
        assert!(client.auth_token.is_none());
    }
}
