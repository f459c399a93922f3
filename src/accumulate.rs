use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::bundle::OfflineBundle;
use crate::cache::TieredCache;
use crate::config::EngineConfig;
use crate::denylist::Denylist;
use crate::identity::is_duplicate;
use crate::merge::{from_source, merge};
use crate::models::{AccumulationState, AggregatedRecord, CatalogItem, SourceRecord};
use crate::registry::SlugRegistry;
use crate::source::{
    catalog_page_with_retry, metadata_with_retry, search_with_retry, PageRequest, SortHint,
    SourceSet,
};

const MAX_LOCK_ENTRIES: usize = 1024;

/// Recency window a catalog view can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    Day,
    Week,
    Month,
}

impl TimeWindow {
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let days = match self {
            TimeWindow::Day => 1,
            TimeWindow::Week => 7,
            TimeWindow::Month => 30,
        };
        now - ChronoDuration::days(days)
    }
}

/// Ordering applied to a catalog view before slicing out the requested page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortStrategy {
    #[default]
    Recency,
    Rating,
    Alphabetical,
    Completeness,
}

impl SortStrategy {
    fn upstream_hint(&self) -> SortHint {
        match self {
            SortStrategy::Recency => SortHint::Recent,
            SortStrategy::Rating | SortStrategy::Completeness => SortHint::Popular,
            SortStrategy::Alphabetical => SortHint::Default,
        }
    }
}

/// One catalog view: which accumulated set to grow and how to present it.
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub catalog_id: String,
    pub filter_key: String,
    pub genre: Option<String>,
    /// Year-restricted view; served from a source-native listing when the
    /// source supports one, enforced locally either way.
    pub year: Option<i32>,
    /// Studio-restricted view, same fallback behavior as `year`.
    pub studio: Option<String>,
    pub time_window: Option<TimeWindow>,
    pub sort: SortStrategy,
    /// Caller-supplied exclusions, applied after sorting.
    pub exclude_genres: Vec<String>,
    pub exclude_studios: Vec<String>,
}

impl CatalogQuery {
    pub fn new(catalog_id: impl Into<String>, filter_key: impl Into<String>) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            filter_key: filter_key.into(),
            genre: None,
            year: None,
            studio: None,
            time_window: None,
            sort: SortStrategy::default(),
            exclude_genres: Vec::new(),
            exclude_studios: Vec::new(),
        }
    }

    fn accumulation_key(&self) -> String {
        format!(
            "catalog:{}:{}:accumulated",
            self.catalog_id, self.filter_key
        )
    }

    fn page_request(&self) -> PageRequest {
        PageRequest {
            genre: self.genre.clone(),
            year: self.year,
            studio: self.studio.clone(),
            sort: self.sort.upstream_hint(),
        }
    }
}

/// The aggregation engine: owns per-view accumulation state, reconciles
/// upstream pages through the identity resolver and merger, and serves
/// filtered, sorted windows out of the growing set.
pub struct CatalogEngine {
    sources: SourceSet,
    cache: TieredCache,
    denylist: Arc<Denylist>,
    registry: Arc<SlugRegistry>,
    config: EngineConfig,
    fetch_limiter: Arc<Semaphore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CatalogEngine {
    pub fn new(
        sources: SourceSet,
        cache: TieredCache,
        denylist: Arc<Denylist>,
        registry: Arc<SlugRegistry>,
        config: EngineConfig,
    ) -> Self {
        let permits = config.max_concurrent_fetches.max(1);
        Self {
            sources,
            cache,
            denylist,
            registry,
            config,
            fetch_limiter: Arc::new(Semaphore::new(permits)),
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Serves one window of a catalog view, accumulating upstream pages
    /// lazily until the raw set can cover the request (or every source is
    /// exhausted).
    pub async fn serve(&self, query: &CatalogQuery, skip: usize, limit: usize) -> Vec<CatalogItem> {
        let key = query.accumulation_key();
        let lock = self.view_lock(&key);
        let _guard = lock.lock().await;

        let mut state: AccumulationState = self.cache.get(&key).await.unwrap_or_default();

        // A time-window view discards most of what it fetches, so it
        // over-accumulates to keep the window slice full.
        let multiplier = if query.time_window.is_some() {
            self.config.window_fetch_multiplier as usize
        } else {
            1
        };
        let target_count = (skip + limit) * multiplier;

        let request = query.page_request();
        while state.items.len() < target_count && !state.is_complete {
            let page = state.next_page_cursor;
            let records = self.fan_out_catalog(page, request.clone()).await;
            let progressed = self.reconcile_into(&mut state.items, records);
            if progressed == 0 {
                info!(key = %key, page, "accumulation exhausted every source");
                state.is_complete = true;
            } else {
                debug!(
                    key = %key,
                    page,
                    progressed,
                    total = state.items.len(),
                    "accumulated page"
                );
                state.next_page_cursor = page + 1;
            }
            self.cache.set(&key, &state, self.config.catalog_ttl).await;
        }

        let working = self.filter_and_sort(&state.items, query);
        working
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(CatalogItem::from)
            .collect()
    }

    /// Incremental refresh: scan the first pages of each source newest-first
    /// and fold updates into the view's accumulated set, stopping early once
    /// a run of consecutive already-known records shows the scan has caught
    /// up. Sources whose recent ordering is unreliable always scan their
    /// first page in full instead.
    pub async fn refresh_recent(&self, query: &CatalogQuery) -> usize {
        let key = query.accumulation_key();
        let lock = self.view_lock(&key);
        let _guard = lock.lock().await;

        let mut state: AccumulationState = self.cache.get(&key).await.unwrap_or_default();
        let mut changed = 0;

        for source in self.sources.iter() {
            let monotonic = source.recent_is_monotonic();
            let max_pages = if monotonic {
                self.config.refresh_scan_pages
            } else {
                1
            };
            let mut known_streak = 0u32;
            let request = PageRequest::recent();
            'pages: for page in 1..=max_pages {
                let records =
                    catalog_page_with_retry(source, page, &request, &self.config).await;
                if records.is_empty() {
                    break;
                }
                for record in records {
                    let Some(candidate) = from_source(&record, &self.config) else {
                        continue;
                    };
                    let matched = self.upsert(&mut state.items, candidate);
                    changed += 1;
                    if matched {
                        known_streak += 1;
                        if monotonic && known_streak >= self.config.refresh_known_streak {
                            debug!(
                                source = source.id(),
                                page, known_streak, "refresh caught up, stopping scan"
                            );
                            break 'pages;
                        }
                    } else {
                        // Out-of-order insertions upstream must not end the
                        // scan prematurely.
                        known_streak = 0;
                    }
                }
            }
        }

        if changed > 0 {
            self.cache.set(&key, &state, self.config.catalog_ttl).await;
        }
        changed
    }

    /// Enriched, cached metadata lookup, merged across every provider the
    /// registry knows for the record.
    pub async fn get_metadata(&self, id: &str) -> Result<AggregatedRecord> {
        if self.denylist.is_blocked(id) {
            return Err(anyhow!("record '{}' is denylisted", id));
        }
        let cache_key = format!("meta:{id}");
        let sources = self.sources.clone();
        let registry = Arc::clone(&self.registry);
        let denylist = Arc::clone(&self.denylist);
        let config = self.config.clone();
        let id = id.to_string();
        self.cache
            .wrap(&cache_key, self.config.metadata_ttl, move || {
                fetch_merged_metadata(sources, registry, denylist, config, id)
            })
            .await
    }

    /// Cached cross-source search, reconciled through the same resolver and
    /// merger as the catalog path.
    pub async fn search(&self, query: &str) -> Result<Vec<AggregatedRecord>> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let cache_key = format!("search:{}", trimmed.to_lowercase());
        let sources = self.sources.clone();
        let denylist = Arc::clone(&self.denylist);
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let limiter = Arc::clone(&self.fetch_limiter);
        let needle = trimmed.to_string();
        self.cache
            .wrap(&cache_key, self.config.search_ttl, move || {
                run_search(sources, denylist, registry, config, limiter, needle)
            })
            .await
    }

    /// Installs a precomputed bundle as the accumulated state of a view,
    /// primes the slug registry from it, and switches the cache to bulk
    /// mode (spooling individual pages to disk is pointless once the whole
    /// dataset is resident).
    pub async fn seed_from_bundle(
        &self,
        bundle: &OfflineBundle,
        query: &CatalogQuery,
    ) -> usize {
        let key = query.accumulation_key();
        let lock = self.view_lock(&key);
        let _guard = lock.lock().await;

        let state = AccumulationState {
            items: bundle.catalog.clone(),
            next_page_cursor: 1,
            is_complete: true,
        };
        for record in &state.items {
            self.registry.record(record);
        }
        for (id, slugs) in &bundle.slug_registry {
            self.registry.record_slugs(id, slugs);
        }
        self.cache.set(&key, &state, self.config.catalog_ttl).await;
        self.cache.set_bulk_mode(true);
        info!(
            key = %key,
            records = state.items.len(),
            version = %bundle.version,
            "seeded catalog from offline bundle"
        );
        state.items.len()
    }

    /// Flushes the injected stateful services to durable storage. Call once
    /// at process shutdown.
    pub async fn shutdown(&self) {
        self.denylist.flush(&self.cache).await;
        self.registry.flush(&self.cache).await;
        info!("engine state flushed");
    }

    fn view_lock(&self, key: &str) -> Arc<Mutex<()>> {
        if self.locks.len() > MAX_LOCK_ENTRIES {
            self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn fan_out_catalog(&self, page: u32, request: PageRequest) -> Vec<SourceRecord> {
        let fetches = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            let limiter = Arc::clone(&self.fetch_limiter);
            let config = self.config.clone();
            let request = request.clone();
            async move {
                let _permit = limiter.acquire_owned().await.ok();
                catalog_page_with_retry(&source, page, &request, &config).await
            }
        });
        join_all(fetches).await.into_iter().flatten().collect()
    }

    /// Folds a page of raw records into the accumulated set, merging
    /// duplicates (against both the page itself and everything seen so far)
    /// and appending the rest. Returns how many records were merged or
    /// appended.
    fn reconcile_into(
        &self,
        items: &mut Vec<AggregatedRecord>,
        records: Vec<SourceRecord>,
    ) -> usize {
        let mut progressed = 0;
        for record in records {
            let Some(candidate) = from_source(&record, &self.config) else {
                continue;
            };
            self.upsert(items, candidate);
            progressed += 1;
        }
        progressed
    }

    /// Merges the candidate into its duplicate if one exists, appends it
    /// otherwise. Returns whether a duplicate was found.
    fn upsert(&self, items: &mut Vec<AggregatedRecord>, candidate: AggregatedRecord) -> bool {
        let position = items
            .iter()
            .position(|existing| same_title(existing, &candidate, &self.config));
        match position {
            Some(pos) => {
                items[pos] = merge(&items[pos], &candidate, &self.config);
                self.registry.record(&items[pos]);
                true
            }
            None => {
                self.registry.record(&candidate);
                items.push(candidate);
                false
            }
        }
    }

    fn filter_and_sort<'a>(
        &self,
        items: &'a [AggregatedRecord],
        query: &CatalogQuery,
    ) -> Vec<&'a AggregatedRecord> {
        let now = Utc::now();
        let mut working: Vec<&AggregatedRecord> = items
            .iter()
            .filter(|record| !self.denylist.is_blocked(&record.id))
            .filter(|record| match &query.genre {
                Some(genre) => record
                    .genres
                    .iter()
                    .any(|g| g.eq_ignore_ascii_case(genre)),
                None => true,
            })
            // Year/studio restrictions are enforced here even when a source
            // served its native listing, so sources without one can fall
            // back to generic pages.
            .filter(|record| match query.year {
                Some(year) => record.year == Some(year),
                None => true,
            })
            .filter(|record| match &query.studio {
                Some(studio) => record
                    .studio
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(studio)),
                None => true,
            })
            .filter(|record| match &query.time_window {
                Some(window) => record
                    .last_updated
                    .is_some_and(|updated| updated >= window.cutoff(now)),
                None => true,
            })
            .collect();

        working.sort_by(|a, b| compare_records(a, b, query.sort));

        working.retain(|record| {
            let genre_blocked = query
                .exclude_genres
                .iter()
                .any(|blocked| record.genres.iter().any(|g| g.eq_ignore_ascii_case(blocked)));
            let studio_blocked = query.exclude_studios.iter().any(|blocked| {
                record
                    .studio
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(blocked))
            });
            !genre_blocked && !studio_blocked
        });

        working
    }
}

fn same_title(a: &AggregatedRecord, b: &AggregatedRecord, config: &EngineConfig) -> bool {
    if a.id == b.id {
        return true;
    }
    // A shared native slug is an exact identity signal, cheaper than fuzzy
    // name comparison.
    if b.provider_slugs
        .iter()
        .any(|(source, slug)| a.provider_slugs.get(source) == Some(slug))
    {
        return true;
    }
    is_duplicate(&a.name, &b.name, config.similarity_threshold)
}

fn compare_records(a: &AggregatedRecord, b: &AggregatedRecord, sort: SortStrategy) -> Ordering {
    match sort {
        SortStrategy::Recency => b
            .last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.name.cmp(&b.name)),
        SortStrategy::Rating => b
            .rating
            .partial_cmp(&a.rating)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name)),
        SortStrategy::Alphabetical => a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)),
        SortStrategy::Completeness => b
            .metadata_score
            .cmp(&a.metadata_score)
            .then_with(|| a.name.cmp(&b.name)),
    }
}

async fn fetch_merged_metadata(
    sources: SourceSet,
    registry: Arc<SlugRegistry>,
    denylist: Arc<Denylist>,
    config: EngineConfig,
    id: String,
) -> Result<AggregatedRecord> {
    let (source_name, _slug) = match id.split_once(':') {
        Some((source, slug)) => (source, slug),
        None => return Err(anyhow!("id '{}' is not source-prefixed", id)),
    };
    let source = sources
        .by_id(source_name)
        .ok_or_else(|| anyhow!("no source registered for '{}'", source_name))?;

    let record = match metadata_with_retry(source, &id, &config).await {
        Ok(record) => {
            denylist.record_success(&id);
            record
        }
        Err(err) => {
            if err.is_server_fault() {
                denylist.record_failure(&id);
            }
            return Err(anyhow!("metadata fetch for '{}' failed: {}", id, err));
        }
    };
    let mut aggregated = from_source(&record, &config)
        .ok_or_else(|| anyhow!("source returned malformed record for '{}'", id))?;

    // Fold in every other provider the registry knows for this record.
    if let Some(slugs) = registry.slugs_for(&id) {
        for (other_source, other_slug) in slugs {
            if other_source == source_name {
                continue;
            }
            let Some(other) = sources.by_id(&other_source) else {
                continue;
            };
            let other_id = format!("{other_source}:{other_slug}");
            match metadata_with_retry(other, &other_id, &config).await {
                Ok(extra) => {
                    denylist.record_success(&other_id);
                    if let Some(candidate) = from_source(&extra, &config) {
                        if same_title(&aggregated, &candidate, &config) {
                            aggregated = merge(&aggregated, &candidate, &config);
                        }
                    }
                }
                Err(err) => {
                    if err.is_server_fault() {
                        denylist.record_failure(&other_id);
                    }
                    warn!(id = %other_id, error = %err, "secondary metadata fetch failed");
                }
            }
        }
    }

    registry.record(&aggregated);
    Ok(aggregated)
}

async fn run_search(
    sources: SourceSet,
    denylist: Arc<Denylist>,
    registry: Arc<SlugRegistry>,
    config: EngineConfig,
    limiter: Arc<Semaphore>,
    query: String,
) -> Result<Vec<AggregatedRecord>> {
    let fetches = sources.iter().map(|source| {
        let source = Arc::clone(source);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        let query = query.clone();
        async move {
            let _permit = limiter.acquire_owned().await.ok();
            search_with_retry(&source, &query, &config).await
        }
    });
    let results: Vec<SourceRecord> = join_all(fetches).await.into_iter().flatten().collect();

    let mut items: Vec<AggregatedRecord> = Vec::new();
    for record in results {
        let Some(candidate) = from_source(&record, &config) else {
            continue;
        };
        let position = items
            .iter()
            .position(|existing| same_title(existing, &candidate, &config));
        match position {
            Some(pos) => items[pos] = merge(&items[pos], &candidate, &config),
            None => items.push(candidate),
        }
    }
    for record in &items {
        registry.record(record);
    }
    items.retain(|record| !denylist.is_blocked(&record.id));
    items.sort_by(|a, b| compare_records(a, b, SortStrategy::Completeness));
    Ok(items)
}
