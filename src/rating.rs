use std::collections::BTreeMap;

use crate::config::EngineConfig;
use crate::models::{RatingKind, RatingSample, ResolvedRating};

/// Ceiling for view-derived ratings; raw popularity never beats a strong
/// direct score.
const VIEWS_CEILING: f64 = 7.5;

/// Ceiling for trending-derived ratings.
const TRENDING_CEILING: f64 = 7.0;

/// Views below this carry no signal at all.
const MIN_MEANINGFUL_VIEWS: u64 = 1000;

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Clamps a direct score onto the 0–10 scale.
pub fn normalize_direct(raw: f64) -> f64 {
    raw.clamp(0.0, 10.0)
}

/// Converts a raw view count onto the 0–10 scale.
///
/// Returns `None` below [`MIN_MEANINGFUL_VIEWS`]; otherwise
/// `min(7.5, log10(views + 1) * 1.5)` to one decimal, non-decreasing in the
/// view count.
pub fn normalize_view_count(views: u64) -> Option<f64> {
    if views < MIN_MEANINGFUL_VIEWS {
        return None;
    }
    let scaled = ((views + 1) as f64).log10() * 1.5;
    Some(round1(scaled.min(VIEWS_CEILING)))
}

/// Rough score for a trending-list position, computed caller-side before the
/// sample enters a breakdown: `max(5.0, 9.5 - position * 0.05)`.
pub fn trending_rank_score(position: u32) -> f64 {
    round1(9.5 - position as f64 * 0.05).max(5.0)
}

/// Clamps a pre-converted trending score onto its capped band.
pub fn normalize_trending(raw: f64) -> f64 {
    raw.clamp(0.0, 10.0).min(TRENDING_CEILING)
}

fn normalize_sample(sample: &RatingSample) -> Option<f64> {
    match sample.kind {
        RatingKind::Direct => Some(normalize_direct(sample.raw)),
        RatingKind::Views => normalize_view_count(sample.raw.max(0.0) as u64),
        RatingKind::Trending => Some(normalize_trending(sample.raw)),
    }
}

/// Resolves one display rating from a per-source breakdown.
///
/// Providers are consulted in the configured priority order. A direct rating
/// whose known vote count is under `min_direct_votes` disqualifies that
/// provider outright (a statistically meaningless score must not win on
/// source priority alone); the first provider yielding a non-null normalized
/// value wins.
pub fn priority_rating(
    breakdown: &BTreeMap<String, RatingSample>,
    fallback_vote_count: Option<u32>,
    config: &EngineConfig,
) -> ResolvedRating {
    for source in &config.provider_priority {
        let Some(sample) = breakdown.get(source) else {
            continue;
        };
        if sample.kind == RatingKind::Direct {
            let votes = sample.votes.or(fallback_vote_count);
            if votes.is_some_and(|v| v < config.min_direct_votes) {
                continue;
            }
        }
        if let Some(rating) = normalize_sample(sample) {
            return ResolvedRating {
                rating: Some(rating),
                source: Some(source.clone()),
                is_na: false,
            };
        }
    }
    ResolvedRating::not_available()
}
