//! Row-to-record mapping.
//!
//! A row is a positional CSV encoding: the observation value, `N` descriptive
//! columns, then (code, label) pairs per dimension. The instance header says
//! how many descriptive columns there are (`V4_N`) and names each dimension.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::OrderCache;
use crate::catalog::{CatalogError, DimensionCatalog};

/// Errors raised while mapping a row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("row has {actual} fields but the header needs at least {expected}")]
    RowTooShort { expected: usize, actual: usize },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// One resolved (dimension, value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionOption {
    pub dimension_name: String,
    pub name: String,
}

/// A row decoded against its instance header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub instance_id: String,
    pub row: String,
    pub row_index: i64,
    pub dimension_options: Vec<DimensionOption>,
}

impl Observation {
    /// The observation value column.
    pub fn value(&self) -> &str {
        self.row.split(',').next().unwrap_or_default()
    }
}

/// Returns the index of the first dimension column.
///
/// The first header element has the form `<label>_N`; `N` descriptive columns
/// follow the observation value, so dimensions start at `N + 1`.
pub fn dimension_offset(header: &[String]) -> Result<usize, MapError> {
    let first = header
        .first()
        .ok_or_else(|| MapError::MalformedHeader("header is empty".to_string()))?;

    let (_, suffix) = first
        .rsplit_once('_')
        .ok_or_else(|| MapError::MalformedHeader(format!("no offset in {first:?}")))?;

    let n: usize = suffix
        .parse()
        .map_err(|_| MapError::MalformedHeader(format!("invalid offset in {first:?}")))?;

    n.checked_add(1)
        .ok_or_else(|| MapError::MalformedHeader(format!("offset out of range in {first:?}")))
}

/// Builds the dimension options for a row against a header.
pub fn map_row(header: &[String], row: &str) -> Result<Vec<DimensionOption>, MapError> {
    let offset = dimension_offset(header)?;
    let fields: Vec<&str> = row.split(',').collect();

    let pairs = header.len().saturating_sub(offset) / 2;
    let required = offset + 2 * pairs;
    if pairs > 0 && fields.len() < required {
        return Err(MapError::RowTooShort {
            expected: required,
            actual: fields.len(),
        });
    }

    let mut options = Vec::with_capacity(pairs);
    for pair in 0..pairs {
        let i = offset + 2 * pair;
        let value = if fields[i].is_empty() {
            fields[i + 1]
        } else {
            fields[i]
        };

        options.push(DimensionOption {
            dimension_name: header[i + 1].clone(),
            name: value.to_string(),
        });
    }

    Ok(options)
}

/// Maps extracted rows into observations using the cached header order.
pub struct ObservationMapper<C> {
    orders: Arc<OrderCache<C>>,
}

impl<C: DimensionCatalog> ObservationMapper<C> {
    pub fn new(orders: Arc<OrderCache<C>>) -> Self {
        Self { orders }
    }

    pub async fn map(
        &self,
        row: &str,
        row_index: i64,
        instance_id: &str,
    ) -> Result<Observation, MapError> {
        let header = self.orders.get(instance_id).await?;
        let dimension_options = map_row(&header, row)?;

        Ok(Observation {
            instance_id: instance_id.to_string(),
            row: row.to_string(),
            row_index,
            dimension_options,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::catalog::DimensionIds;

    fn header(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    fn option(dimension: &str, value: &str) -> DimensionOption {
        DimensionOption {
            dimension_name: dimension.to_string(),
            name: value.to_string(),
        }
    }

    struct FixedCatalog {
        header: Vec<String>,
    }

    impl DimensionCatalog for FixedCatalog {
        async fn fetch_order(&self, instance_id: &str) -> Result<Vec<String>, CatalogError> {
            if instance_id == "missing" {
                return Err(CatalogError::InstanceNotFound(instance_id.to_string()));
            }
            Ok(self.header.clone())
        }

        async fn fetch_ids(&self, _instance_id: &str) -> Result<DimensionIds, CatalogError> {
            Ok(HashMap::new())
        }
    }

    #[test]
    fn test_dimension_offset() {
        assert_eq!(dimension_offset(&header(&["V4_0"])).expect("V4_0"), 1);
        assert_eq!(dimension_offset(&header(&["V4_1"])).expect("V4_1"), 2);
        assert_eq!(dimension_offset(&header(&["v4_12", "x"])).expect("v4_12"), 13);
        assert_eq!(
            dimension_offset(&header(&["obs_with_underscores_3"])).expect("last underscore"),
            4
        );
    }

    #[test]
    fn test_dimension_offset_malformed() {
        assert!(matches!(
            dimension_offset(&header(&["V4_x"])),
            Err(MapError::MalformedHeader(_))
        ));
        assert!(matches!(
            dimension_offset(&header(&["V4"])),
            Err(MapError::MalformedHeader(_))
        ));
        assert!(matches!(
            dimension_offset(&header(&["V4_-1"])),
            Err(MapError::MalformedHeader(_))
        ));
        assert!(matches!(
            dimension_offset(&[]),
            Err(MapError::MalformedHeader(_))
        ));
        assert!(matches!(
            dimension_offset(&header(&["V4_18446744073709551615", "a"])),
            Err(MapError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_map_row_offset_past_header_yields_no_options() {
        let header = header(&["V4_18446744073709551614", "Time_codelist", "Time"]);
        assert_eq!(dimension_offset(&header), Ok(usize::MAX));
        assert_eq!(map_row(&header, "1,,Aug-16"), Ok(Vec::new()));
    }

    #[test]
    fn test_map_row_preserves_header_order() {
        let header = header(&[
            "V4_1",
            "Data_Marking",
            "Time_codelist",
            "Time",
            "Geo_codelist",
            "Geo",
        ]);

        let options = map_row(&header, "128,,,Aug-16,K02000001,England").expect("map");
        assert_eq!(
            options,
            vec![option("Time", "Aug-16"), option("Geo", "K02000001")]
        );
    }

    #[test]
    fn test_map_row_prefers_code_over_label() {
        let header = header(&["V4_0", "Sex_codelist", "Sex"]);
        let options = map_row(&header, "5,F,Female").expect("map");
        assert_eq!(options, vec![option("Sex", "F")]);
    }

    #[test]
    fn test_map_row_too_short() {
        let header = header(&["V4_1", "Data_Marking", "Time_codelist", "Time"]);
        let err = map_row(&header, "128,").expect_err("row too short");
        assert_eq!(
            err,
            MapError::RowTooShort {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_map_row_without_dimensions() {
        let options = map_row(&header(&["V4_1", "Data_Marking"]), "1,x").expect("map");
        assert!(options.is_empty());
    }

    #[test]
    fn test_observation_value() {
        let obs = Observation {
            instance_id: "i".to_string(),
            row: "128,,x".to_string(),
            row_index: 0,
            dimension_options: Vec::new(),
        };
        assert_eq!(obs.value(), "128");
    }

    #[tokio::test]
    async fn test_mapper_builds_observation() {
        let catalog = Arc::new(FixedCatalog {
            header: header(&["V4_0", "Age_codelist", "Age"]),
        });
        let orders = Arc::new(OrderCache::new(catalog, Duration::from_secs(60), None));
        let mapper = ObservationMapper::new(orders);

        let obs = mapper.map("7,,30", 3, "inst").await.expect("map");
        assert_eq!(obs.instance_id, "inst");
        assert_eq!(obs.row, "7,,30");
        assert_eq!(obs.row_index, 3);
        assert_eq!(obs.dimension_options, vec![option("Age", "30")]);

        let again = mapper.map("7,,30", 3, "inst").await.expect("map again");
        assert_eq!(obs, again);
    }

    #[tokio::test]
    async fn test_mapper_propagates_catalog_error() {
        let catalog = Arc::new(FixedCatalog {
            header: header(&["V4_0"]),
        });
        let orders = Arc::new(OrderCache::new(catalog, Duration::from_secs(60), None));
        let mapper = ObservationMapper::new(orders);

        let err = mapper.map("1", 0, "missing").await.expect_err("not found");
        assert_eq!(
            err,
            MapError::Catalog(CatalogError::InstanceNotFound("missing".to_string()))
        );
    }
}
