use once_cell::sync::Lazy;
use regex::Regex;

// Trailing release-noise tokens sources append to titles, e.g.
// "Dark Moon Episode 12" or "Dark Moon The Animation".
static TRAILING_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+(?:episode|ep|series|season|ova|the\s+animation|animation)(?:\s+\d+)?$")
        .expect("trailing token pattern is valid")
});

static LEADING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:the|a|an)\s+").expect("article pattern is valid"));

/// Canonical comparison key for a title.
///
/// Lowercases, keeps only letters/digits/space/hyphen, collapses whitespace,
/// then strips a leading article and a trailing release-noise token.
pub fn normalize_name(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut last_space = false;
    for ch in input.trim().chars() {
        let ch = ch.to_lowercase().next().unwrap_or(ch);
        if ch.is_alphanumeric() || ch == '-' {
            cleaned.push(ch);
            last_space = false;
        } else if ch.is_whitespace() && !last_space && !cleaned.is_empty() {
            cleaned.push(' ');
            last_space = true;
        }
    }
    let cleaned = cleaned.trim_end().to_string();
    let without_article = LEADING_ARTICLE.replace(&cleaned, "");
    TRAILING_TOKEN.replace(&without_article, "").into_owned()
}

/// Levenshtein similarity in `[0, 1]`; `1.0` means identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = strsim::levenshtein(a, b);
    (max_len - distance) as f64 / max_len as f64
}

/// Whether two titles denote the same real-world entry.
///
/// Exact normalized equality wins outright. Otherwise names whose lengths
/// differ by more than 40% of the longer one are rejected before paying for
/// the edit-distance computation.
pub fn is_duplicate(a: &str, b: &str, threshold: f64) -> bool {
    let norm_a = normalize_name(a);
    let norm_b = normalize_name(b);
    if norm_a == norm_b {
        return true;
    }
    let len_a = norm_a.chars().count();
    let len_b = norm_b.chars().count();
    let longer = len_a.max(len_b);
    if longer == 0 {
        return true;
    }
    let diff = len_a.abs_diff(len_b);
    if diff as f64 > longer as f64 * 0.4 {
        return false;
    }
    similarity(&norm_a, &norm_b) >= threshold
}
