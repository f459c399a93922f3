use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a source expresses its rating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RatingKind {
    #[default]
    Direct,
    Views,
    Trending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub number: u32,
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub released: Option<DateTime<Utc>>,
}

/// A single source's raw view of a title, as returned by a scraper.
///
/// `id` is source-prefixed (`"<source>:<slug>"`) and unique within a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub poster: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub studio: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_kind: RatingKind,
    #[serde(default)]
    pub vote_count: Option<u32>,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRef>,
}

impl SourceRecord {
    /// Records without a name or poster are unusable downstream and are
    /// dropped at the ingestion boundary.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty() && !self.poster.trim().is_empty()
    }

    /// Splits the source-prefixed id into `(source, slug)`.
    /// An unprefixed id yields an empty source.
    pub fn split_id(&self) -> (&str, &str) {
        match self.id.split_once(':') {
            Some((source, slug)) => (source, slug),
            None => ("", self.id.as_str()),
        }
    }
}

/// Raw per-source rating data retained alongside the resolved display rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSample {
    pub raw: f64,
    pub kind: RatingKind,
    #[serde(default)]
    pub votes: Option<u32>,
}

/// Outcome of resolving one display rating across a breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRating {
    pub rating: Option<f64>,
    pub source: Option<String>,
    pub is_na: bool,
}

impl ResolvedRating {
    pub fn not_available() -> Self {
        Self {
            rating: None,
            source: None,
            is_na: true,
        }
    }
}

/// The unified representation of a title after reconciling every matching
/// source record.
///
/// Constructed by [`crate::merge::from_source`] and mutated only through
/// [`crate::merge::merge`]; `metadata_score` and the resolved rating fields
/// are recomputed on every merge so they never go stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub id: String,
    pub name: String,
    pub poster: String,
    pub description: String,
    pub genres: Vec<String>,
    #[serde(default)]
    pub studio: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    pub providers: BTreeSet<String>,
    pub provider_slugs: BTreeMap<String, String>,
    pub rating_breakdown: BTreeMap<String, RatingSample>,
    pub metadata_score: i32,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_source: Option<String>,
    pub rating_is_na: bool,
    #[serde(default)]
    pub view_count: Option<u64>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRef>,
}

impl AggregatedRecord {
    /// Display string for the resolved rating, e.g. `"8.6"` or `"N/A"`.
    pub fn rating_display(&self) -> String {
        match self.rating {
            Some(r) => format!("{:.1}", r),
            None => "N/A".to_string(),
        }
    }
}

/// Projection handed to the presentation adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub poster: String,
    pub description: String,
    pub genres: Vec<String>,
    #[serde(default)]
    pub studio: Option<String>,
    #[serde(default)]
    pub release_info: Option<String>,
    pub rating: String,
    pub episodes: Vec<EpisodeRef>,
}

impl From<&AggregatedRecord> for CatalogItem {
    fn from(record: &AggregatedRecord) -> Self {
        CatalogItem {
            id: record.id.clone(),
            name: record.name.clone(),
            poster: record.poster.clone(),
            description: record.description.clone(),
            genres: record.genres.clone(),
            studio: record.studio.clone(),
            release_info: record.year.map(|y| y.to_string()),
            rating: record.rating_display(),
            episodes: record.episodes.clone(),
        }
    }
}

/// Per-(catalog, filter) accumulation state, persisted through the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulationState {
    pub items: Vec<AggregatedRecord>,
    pub next_page_cursor: u32,
    pub is_complete: bool,
}

impl Default for AccumulationState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_page_cursor: 1,
            is_complete: false,
        }
    }
}
