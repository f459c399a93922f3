use std::collections::BTreeMap;
use tracing::debug;

use crate::config::EngineConfig;
use crate::describe::{clean_description, select_best};
use crate::models::{AggregatedRecord, RatingKind, RatingSample, SourceRecord};
use crate::rating::priority_rating;

/// Descriptions at or under this length are treated as missing during merges.
const SHORT_DESCRIPTION: usize = 30;

/// Heuristic integer ranking how complete a record's fields are; the higher
/// side of a merge becomes the primary. Adding a field never lowers it.
pub fn metadata_score(record: &AggregatedRecord, config: &EngineConfig) -> i32 {
    let mut score = 0;
    if record.providers.iter().any(|p| config.is_trusted(p)) {
        score += 10;
    }
    let direct = record
        .rating_breakdown
        .values()
        .filter(|s| s.kind == RatingKind::Direct)
        .map(|s| s.raw)
        .fold(None::<f64>, |best, raw| {
            Some(best.map_or(raw, |b| b.max(raw)))
        });
    if let Some(raw) = direct {
        score += 5;
        if raw >= 8.0 {
            score += 2;
        }
    }
    let desc_len = record.description.chars().count();
    if desc_len > 20 {
        score += 3;
        if desc_len > 100 {
            score += 1;
        }
    }
    score += record.genres.len().min(5) as i32;
    if record.year.is_some() {
        score += 1;
    }
    if record.studio.is_some() {
        score += 1;
    }
    if !record.episodes.is_empty() {
        score += 2;
    }
    score
}

/// Lifts a validated source record into a single-provider aggregate.
///
/// Returns `None` for malformed records (no name or poster), which are
/// dropped silently at the ingestion boundary.
pub fn from_source(record: &SourceRecord, config: &EngineConfig) -> Option<AggregatedRecord> {
    if !record.is_valid() {
        debug!(id = %record.id, "dropping malformed source record");
        return None;
    }
    let (source, slug) = record.split_id();
    let source = source.to_string();

    let mut rating_breakdown = BTreeMap::new();
    if let Some(raw) = record.rating {
        rating_breakdown.insert(
            source.clone(),
            RatingSample {
                raw,
                kind: record.rating_kind,
                votes: record.vote_count,
            },
        );
    } else if let Some(views) = record.view_count {
        rating_breakdown.insert(
            source.clone(),
            RatingSample {
                raw: views as f64,
                kind: RatingKind::Views,
                votes: None,
            },
        );
    }

    let mut aggregated = AggregatedRecord {
        id: record.id.clone(),
        name: record.name.clone(),
        poster: record.poster.clone(),
        description: clean_description(&record.description, config.max_description_len),
        genres: dedup_genres(record.genres.iter().cloned(), record.studio.as_deref()),
        studio: record.studio.clone(),
        year: record.year,
        providers: [source.clone()].into_iter().collect(),
        provider_slugs: [(source, slug.to_string())].into_iter().collect(),
        rating_breakdown,
        metadata_score: 0,
        rating: None,
        rating_source: None,
        rating_is_na: true,
        view_count: record.view_count,
        last_updated: record.last_updated,
        episodes: record.episodes.clone(),
    };
    rescore(&mut aggregated, record.vote_count, config);
    Some(aggregated)
}

/// Merges two records judged to be the same title. Pure: neither input is
/// mutated.
///
/// The side with the higher metadata-completeness score becomes the primary
/// and the merged record keeps its identity; the secondary fills gaps
/// field by field. `candidate` is the newly observed side, so its own
/// breakdown entries always supersede stale ones for the same source.
pub fn merge(
    existing: &AggregatedRecord,
    candidate: &AggregatedRecord,
    config: &EngineConfig,
) -> AggregatedRecord {
    let (primary, secondary) = if candidate.metadata_score > existing.metadata_score {
        (candidate, existing)
    } else {
        (existing, candidate)
    };
    debug!(
        primary = %primary.id,
        secondary = %secondary.id,
        "merging duplicate records"
    );

    let mut merged = primary.clone();

    merged.providers.extend(secondary.providers.iter().cloned());
    for (source, slug) in &secondary.provider_slugs {
        merged
            .provider_slugs
            .entry(source.clone())
            .or_insert_with(|| slug.clone());
    }

    for (source, sample) in &secondary.rating_breakdown {
        merged
            .rating_breakdown
            .entry(source.clone())
            .or_insert_with(|| sample.clone());
    }
    // Fresh observations beat whatever was recorded for the same source.
    for source in &candidate.providers {
        if let Some(sample) = candidate.rating_breakdown.get(source) {
            merged
                .rating_breakdown
                .insert(source.clone(), sample.clone());
        }
    }

    merged.description = merge_description(primary, secondary, config);

    if merged.poster.trim().is_empty() && !secondary.poster.trim().is_empty() {
        merged.poster = secondary.poster.clone();
    }

    merged.studio = merge_studio(primary.studio.as_deref(), secondary.studio.as_deref());

    merged.genres = dedup_genres(
        primary
            .genres
            .iter()
            .chain(secondary.genres.iter())
            .cloned(),
        merged.studio.as_deref(),
    );

    if merged.year.is_none() {
        merged.year = secondary.year;
    }

    merged.last_updated = match (primary.last_updated, secondary.last_updated) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    if secondary.episodes.len() > merged.episodes.len() {
        merged.episodes = secondary.episodes.clone();
    }

    merged.view_count = match (primary.view_count, secondary.view_count) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    rescore(&mut merged, None, config);
    merged
}

fn rescore(record: &mut AggregatedRecord, fallback_votes: Option<u32>, config: &EngineConfig) {
    record.metadata_score = metadata_score(record, config);
    let resolved = priority_rating(&record.rating_breakdown, fallback_votes, config);
    record.rating = resolved.rating;
    record.rating_source = resolved.source;
    record.rating_is_na = resolved.is_na;
}

fn merge_description(
    primary: &AggregatedRecord,
    secondary: &AggregatedRecord,
    config: &EngineConfig,
) -> String {
    let primary_len = primary.description.chars().count();
    let secondary_len = secondary.description.chars().count();
    if primary_len < SHORT_DESCRIPTION && secondary_len > SHORT_DESCRIPTION {
        return clean_description(&secondary.description, config.max_description_len);
    }
    let mut candidates = BTreeMap::new();
    candidates.insert(
        lead_provider(secondary, config).to_string(),
        secondary.description.clone(),
    );
    // Primary wins its slot on a key collision.
    candidates.insert(
        lead_provider(primary, config).to_string(),
        primary.description.clone(),
    );
    select_best(&candidates, config)
}

fn lead_provider<'a>(record: &'a AggregatedRecord, config: &EngineConfig) -> &'a str {
    record
        .providers
        .iter()
        .min_by_key(|p| config.provider_rank(p))
        .map(|p| p.as_str())
        .unwrap_or("")
}

fn merge_studio(primary: Option<&str>, secondary: Option<&str>) -> Option<String> {
    match (primary, secondary) {
        (Some(p), Some(s)) if is_shouting(p) && !is_shouting(s) => Some(s.to_string()),
        (Some(p), _) => Some(p.to_string()),
        (None, s) => s.map(|v| v.to_string()),
    }
}

// Sources sometimes deliver studio names as all caps; prefer natural casing.
fn is_shouting(name: &str) -> bool {
    name.chars().any(|c| c.is_alphabetic()) && name == name.to_uppercase()
}

fn dedup_genres<I: Iterator<Item = String>>(genres: I, studio: Option<&str>) -> Vec<String> {
    let studio_lower = studio.map(|s| s.to_lowercase());
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for genre in genres {
        let trimmed = genre.trim();
        if trimmed.is_empty() {
            continue;
        }
        let key = trimmed.to_lowercase();
        // Sources sometimes tag the studio itself as a genre.
        if studio_lower.as_deref() == Some(key.as_str()) {
            continue;
        }
        if seen.insert(key) {
            out.push(trimmed.to_string());
        }
    }
    out
}
