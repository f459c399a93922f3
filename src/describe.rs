use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::config::EngineConfig;

/// Returned whenever no usable synopsis survives filtering.
pub const NO_DESCRIPTION: &str = "No Description";

/// Anything shorter than this cannot be a real synopsis.
const MIN_DESCRIPTION_LEN: usize = 30;

/// Two promotional keywords closer together than this mark the text as ad copy.
const KEYWORD_SPAN: usize = 150;

// Boilerplate shapes scraped sources substitute for a synopsis.
static BOILERPLATE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bwatch\b.{0,80}?\bepisode\s+\d+",
        r"(?i)thousands of (?:videos|episodes|titles|series)",
        r"(?i)(?:stream|download)\b.{0,40}?\bfor free",
        r"(?i)subscribe to our",
        r"(?i)best (?:site|place) to (?:watch|stream)",
        r"(?i)new episodes (?:every|added)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("boilerplate pattern is valid"))
    .collect()
});

static PROMO_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:watch|stream|download|subscribe|free|online|hd|1080p|website|update[ds]?)\b")
        .expect("keyword pattern is valid")
});

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("url pattern is valid"));

// "<title> Episode <n> is:" lead-ins some sources prepend to the synopsis.
static EPISODE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[^:]{0,100}\bepisode\s+\d+\s+is\s*:\s*")
        .expect("episode prefix pattern is valid")
});

static PLOT_VOCAB: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:story|discovers?|journey|world|secret|battle|life|past|becomes?|must)\b")
        .expect("plot vocabulary pattern is valid")
});

/// True when the text reads as promotional filler rather than a synopsis.
pub fn is_promotional(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_DESCRIPTION_LEN {
        return true;
    }
    if BOILERPLATE.iter().any(|p| p.is_match(trimmed)) {
        return true;
    }
    let hits: Vec<usize> = PROMO_KEYWORD.find_iter(trimmed).map(|m| m.start()).collect();
    hits.windows(2).any(|w| w[1] - w[0] < KEYWORD_SPAN)
}

/// Normalizes a raw scraped description.
///
/// Strips episode lead-ins and URLs, collapses whitespace, and rejects
/// promotional leftovers; survivors are truncated at a word boundary.
pub fn clean_description(text: &str, max_len: usize) -> String {
    let without_prefix = EPISODE_PREFIX.replace(text, "");
    let without_urls = URL.replace_all(&without_prefix, "");
    let collapsed = without_urls.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || is_promotional(&collapsed) {
        return NO_DESCRIPTION.to_string();
    }
    truncate_at_word(&collapsed, max_len)
}

fn truncate_at_word(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_len).collect();
    let head = match cut.rfind(' ') {
        Some(pos) => &cut[..pos],
        None => cut.as_str(),
    };
    format!("{}...", head.trim_end())
}

/// Quality score in `[0, 100]`; promotional text scores zero.
pub fn score_description(text: &str) -> i32 {
    let trimmed = text.trim();
    if is_promotional(trimmed) {
        return 0;
    }
    let mut score = 10;
    let len = trimmed.chars().count();
    if len >= 100 {
        score += 15;
    }
    if len >= 200 {
        score += 10;
    }
    if len >= 300 {
        score += 10;
    }
    if trimmed.chars().next().is_some_and(|c| c.is_uppercase()) {
        score += 10;
    }
    let plot_hits = PLOT_VOCAB.find_iter(trimmed).count() as i32;
    score += (plot_hits * 5).min(25);
    if !PROMO_KEYWORD.is_match(trimmed) {
        score += 15;
    }
    score.min(100)
}

/// Picks the best description across per-source candidates.
///
/// Sources are consulted in priority order and the first candidate with a
/// positive score wins; failing that, the highest-scoring candidate from any
/// source; failing that, the sentinel.
pub fn select_best(candidates: &BTreeMap<String, String>, config: &EngineConfig) -> String {
    for source in &config.provider_priority {
        if let Some(text) = candidates.get(source) {
            if score_description(text) > 0 {
                return clean_description(text, config.max_description_len);
            }
        }
    }
    let best = candidates
        .values()
        .map(|text| (score_description(text), text))
        .max_by_key(|(score, _)| *score);
    match best {
        Some((score, text)) if score > 0 => clean_description(text, config.max_description_len),
        _ => NO_DESCRIPTION.to_string(),
    }
}
