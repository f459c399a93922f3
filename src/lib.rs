//! polycat aggregates content listings scraped from independent, structurally
//! inconsistent upstream sources into one deduplicated catalog, reconciles
//! conflicting metadata and ratings, and serves the result as a paginated,
//! cached, incrementally-growing view.
//!
//! Per-source scrapers implement [`source::SourceApi`] and are injected into
//! a [`accumulate::CatalogEngine`] together with the two-tier cache and the
//! stateful denylist/registry services. The outward JSON protocol adapter
//! and process bootstrapping live in consuming binaries.

pub mod accumulate;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod denylist;
pub mod describe;
pub mod identity;
pub mod merge;
pub mod models;
pub mod rating;
pub mod registry;
pub mod source;

pub use accumulate::{CatalogEngine, CatalogQuery, SortStrategy, TimeWindow};
pub use bundle::OfflineBundle;
pub use cache::TieredCache;
pub use config::EngineConfig;
pub use denylist::Denylist;
pub use models::{AggregatedRecord, CatalogItem, SourceRecord};
pub use registry::SlugRegistry;
pub use source::{SortHint, SourceApi, SourceError, SourceSet};
