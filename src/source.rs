use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::EngineConfig;
use crate::models::SourceRecord;

/// Failure classes a scraper can report.
///
/// The engine only inspects [`SourceError::is_server_fault`] (repeated
/// server faults during metadata fetches feed the denylist); everything else
/// degrades to an empty contribution.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream returned status {status}")]
    Http { status: u16 },
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("malformed upstream payload: {0}")]
    Payload(String),
}

impl SourceError {
    pub fn is_server_fault(&self) -> bool {
        matches!(self, SourceError::Http { status } if *status >= 500)
    }
}

/// Sort order requested from a source's catalog listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortHint {
    #[default]
    Default,
    Recent,
    Popular,
}

/// The per-source scraper contract.
///
/// Implementations live outside this crate (one thin extraction routine per
/// upstream site) and return the common record shape. The by-year/by-studio
/// listings are optional; `Ok(None)` means "not supported here" and tells
/// the caller to fetch a generic page and filter locally.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Stable source identifier, used as the provider key everywhere.
    fn id(&self) -> &str;

    async fn fetch_catalog(
        &self,
        page: u32,
        genre: Option<&str>,
        sort: SortHint,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Enriched single-record lookup (with episodes).
    async fn fetch_metadata(&self, id: &str) -> Result<SourceRecord, SourceError>;

    async fn search(&self, query: &str) -> Result<Vec<SourceRecord>, SourceError>;

    async fn fetch_catalog_by_year(
        &self,
        _year: i32,
        _page: u32,
    ) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        Ok(None)
    }

    async fn fetch_catalog_by_studio(
        &self,
        _studio: &str,
        _page: u32,
    ) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        Ok(None)
    }

    /// Whether this source's "recent" listing is reliably newest-first.
    /// Sources that interleave reuploads return false and are always scanned
    /// in full during incremental refresh.
    fn recent_is_monotonic(&self) -> bool {
        true
    }
}

/// The set of scrapers injected into the engine.
#[derive(Clone)]
pub struct SourceSet {
    sources: Vec<Arc<dyn SourceApi>>,
}

impl SourceSet {
    pub fn new(sources: Vec<Arc<dyn SourceApi>>) -> Self {
        Self { sources }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceApi>> {
        self.sources.iter()
    }

    pub fn by_id(&self, id: &str) -> Option<&Arc<dyn SourceApi>> {
        self.sources.iter().find(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// What a catalog view wants from one upstream page.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub genre: Option<String>,
    pub year: Option<i32>,
    pub studio: Option<String>,
    pub sort: SortHint,
}

impl PageRequest {
    pub fn recent() -> Self {
        Self {
            sort: SortHint::Recent,
            ..Self::default()
        }
    }
}

/// One attempt at a view page: the source-native year/studio listing when the
/// source supports it, otherwise the generic catalog page (the caller filters
/// locally in that case).
async fn fetch_view_page(
    source: &Arc<dyn SourceApi>,
    page: u32,
    request: &PageRequest,
) -> Result<Vec<SourceRecord>, SourceError> {
    if let Some(year) = request.year {
        if let Some(records) = source.fetch_catalog_by_year(year, page).await? {
            return Ok(records);
        }
    }
    if let Some(studio) = &request.studio {
        if let Some(records) = source.fetch_catalog_by_studio(studio, page).await? {
            return Ok(records);
        }
    }
    source
        .fetch_catalog(page, request.genre.as_deref(), request.sort)
        .await
}

/// Catalog page fetch with bounded retries; a source that keeps failing
/// contributes an empty page so aggregation proceeds without it.
pub async fn catalog_page_with_retry(
    source: &Arc<dyn SourceApi>,
    page: u32,
    request: &PageRequest,
    config: &EngineConfig,
) -> Vec<SourceRecord> {
    let mut attempt = 0;
    loop {
        match fetch_view_page(source, page, request).await {
            Ok(records) => return records,
            Err(err) if attempt < config.fetch_retries => {
                attempt += 1;
                warn!(
                    source = source.id(),
                    page,
                    attempt,
                    error = %err,
                    "catalog fetch failed, retrying"
                );
                tokio::time::sleep(config.fetch_retry_delay).await;
            }
            Err(err) => {
                warn!(
                    source = source.id(),
                    page,
                    error = %err,
                    "catalog fetch failed, source contributes nothing this page"
                );
                return Vec::new();
            }
        }
    }
}

/// Metadata fetch with bounded retries; the final error is surfaced so the
/// caller can classify it (server faults count toward the denylist).
pub async fn metadata_with_retry(
    source: &Arc<dyn SourceApi>,
    id: &str,
    config: &EngineConfig,
) -> Result<SourceRecord, SourceError> {
    let mut attempt = 0;
    loop {
        match source.fetch_metadata(id).await {
            Ok(record) => return Ok(record),
            Err(err) if attempt < config.fetch_retries => {
                attempt += 1;
                warn!(
                    source = source.id(),
                    id,
                    attempt,
                    error = %err,
                    "metadata fetch failed, retrying"
                );
                tokio::time::sleep(config.fetch_retry_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Search with bounded retries; failures degrade to no results.
pub async fn search_with_retry(
    source: &Arc<dyn SourceApi>,
    query: &str,
    config: &EngineConfig,
) -> Vec<SourceRecord> {
    let mut attempt = 0;
    loop {
        match source.search(query).await {
            Ok(records) => return records,
            Err(err) if attempt < config.fetch_retries => {
                attempt += 1;
                warn!(
                    source = source.id(),
                    query,
                    attempt,
                    error = %err,
                    "search failed, retrying"
                );
                tokio::time::sleep(config.fetch_retry_delay).await;
            }
            Err(err) => {
                warn!(source = source.id(), query, error = %err, "search failed");
                return Vec::new();
            }
        }
    }
}
