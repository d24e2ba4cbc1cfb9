//! TTL caches in front of the dimension catalog.
//!
//! Both caches are cache-aside: a hit inside the TTL answers locally, a miss
//! or expired entry calls the catalog and stores the fresh value. Errors are
//! never cached. Entry locks are only held for the local read or write, not
//! while the catalog request is in flight, so concurrent misses on the same
//! key may fetch twice and the last write wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::catalog::{CatalogError, DimensionCatalog, DimensionIds};
use crate::export::health::HealthMetrics;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map of instance id to value with a fixed time-to-live.
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached value if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let entry = self.entries.get(key)?;
        (now < entry.expires_at).then(|| entry.value.clone())
    }

    /// Stores a value with a fresh TTL.
    pub fn insert(&self, key: &str, value: V) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn record_lookup(health: Option<&HealthMetrics>, cache: &str, outcome: &str) {
    if let Some(health) = health {
        health
            .cache_requests
            .with_label_values(&[cache, outcome])
            .inc();
    }
}

/// Instance id to ordered CSV header.
pub struct OrderCache<C> {
    catalog: Arc<C>,
    cache: TtlCache<Vec<String>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: DimensionCatalog> OrderCache<C> {
    pub fn new(catalog: Arc<C>, ttl: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            catalog,
            cache: TtlCache::new(ttl),
            health,
        }
    }

    /// Returns the instance's header, fetching it on a miss or expiry.
    pub async fn get(&self, instance_id: &str) -> Result<Vec<String>, CatalogError> {
        if let Some(order) = self.cache.get(instance_id) {
            record_lookup(self.health.as_deref(), "order", "hit");
            return Ok(order);
        }

        record_lookup(self.health.as_deref(), "order", "miss");
        let order = self.catalog.fetch_order(instance_id).await?;
        self.cache.insert(instance_id, order.clone());

        Ok(order)
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn invalidate(&self, instance_id: &str) {
        self.cache.invalidate(instance_id);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Instance id to dimension value node ids.
pub struct IdCache<C> {
    catalog: Arc<C>,
    cache: TtlCache<Arc<DimensionIds>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: DimensionCatalog> IdCache<C> {
    pub fn new(catalog: Arc<C>, ttl: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            catalog,
            cache: TtlCache::new(ttl),
            health,
        }
    }

    /// Returns the instance's id mapping, fetching it on a miss or expiry.
    pub async fn get(&self, instance_id: &str) -> Result<Arc<DimensionIds>, CatalogError> {
        if let Some(ids) = self.cache.get(instance_id) {
            record_lookup(self.health.as_deref(), "ids", "hit");
            return Ok(ids);
        }

        record_lookup(self.health.as_deref(), "ids", "miss");
        let ids = Arc::new(self.catalog.fetch_ids(instance_id).await?);
        self.cache.insert(instance_id, Arc::clone(&ids));

        Ok(ids)
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn invalidate(&self, instance_id: &str) {
        self.cache.invalidate(instance_id);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
