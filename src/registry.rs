use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::TieredCache;
use crate::models::AggregatedRecord;

const PERSIST_KEY: &str = "registry:slugs";

/// Memory TTL for the persisted registry snapshot; the disk copy lives six
/// times longer.
const PERSIST_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Canonical-id → per-source-slug map, maintained across merges so metadata
/// lookups can reach every provider that contributed to a record.
///
/// Constructed once per process and injected; flushed through the cache at
/// shutdown like the denylist.
#[derive(Default)]
pub struct SlugRegistry {
    entries: DashMap<String, BTreeMap<String, String>>,
}

impl SlugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(cache: &TieredCache) -> Self {
        let registry = Self::new();
        if let Some(entries) = cache
            .get::<BTreeMap<String, BTreeMap<String, String>>>(PERSIST_KEY)
            .await
        {
            for (id, slugs) in entries {
                registry.entries.insert(id, slugs);
            }
            info!(count = registry.entries.len(), "restored slug registry");
        }
        registry
    }

    pub async fn flush(&self, cache: &TieredCache) {
        let entries: BTreeMap<String, BTreeMap<String, String>> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        cache.set(PERSIST_KEY, &entries, PERSIST_TTL).await;
        debug!(count = entries.len(), "flushed slug registry");
    }

    /// Records (or extends) the slug set for a merged record. Existing slugs
    /// are kept; only genuinely new providers are added.
    pub fn record(&self, record: &AggregatedRecord) {
        self.record_slugs(&record.id, &record.provider_slugs);
    }

    pub fn record_slugs(&self, id: &str, slugs: &BTreeMap<String, String>) {
        let mut entry = self.entries.entry(id.to_string()).or_default();
        for (source, slug) in slugs {
            entry.entry(source.clone()).or_insert_with(|| slug.clone());
        }
    }

    pub fn slugs_for(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Reverse lookup: which canonical record does a source's native slug
    /// belong to?
    pub fn canonical_for(&self, source: &str, slug: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.value().get(source).is_some_and(|s| s == slug))
            .map(|e| e.key().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
