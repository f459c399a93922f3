use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide tunables.
///
/// Every threshold the aggregation pipeline consults lives here so that the
/// live serving path and the offline batch builder run with identical
/// settings. `Default` carries the documented values; `from_env` overlays
/// `POLYCAT_*` variables for deployments that need to deviate.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Providers in descending trust order; consulted for rating resolution
    /// and description selection.
    pub provider_priority: Vec<String>,
    /// Providers whose records get the metadata-completeness trust bonus.
    pub trusted_sources: Vec<String>,
    /// Minimum fuzzy similarity for two names to be judged the same title.
    pub similarity_threshold: f64,
    /// Direct ratings backed by fewer votes than this are skipped during
    /// rating resolution.
    pub min_direct_votes: u32,
    /// Descriptions are truncated to this many characters at a word boundary.
    pub max_description_len: usize,

    /// Directory for the disk cache tier.
    pub cache_dir: PathBuf,
    /// Disk entries outlive memory entries by this factor.
    pub disk_ttl_multiplier: u32,
    /// Memory TTL for accumulated catalog state.
    pub catalog_ttl: Duration,
    /// Memory TTL for enriched metadata lookups.
    pub metadata_ttl: Duration,
    /// Memory TTL for search results.
    pub search_ttl: Duration,

    /// Upper bound on concurrent upstream fetches.
    pub max_concurrent_fetches: usize,
    /// Retries per upstream call before the source contributes nothing.
    pub fetch_retries: u32,
    /// Fixed delay between retry attempts.
    pub fetch_retry_delay: Duration,
    /// Accumulation target multiplier while a time-window filter is active.
    pub window_fetch_multiplier: u32,

    /// Pages per source scanned by the incremental refresh.
    pub refresh_scan_pages: u32,
    /// Consecutive already-known records that end a refresh scan early.
    pub refresh_known_streak: u32,

    /// Server-fault failures before an id is denylisted.
    pub denylist_threshold: u32,
    /// How long a denylisted id stays excluded.
    pub denylist_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_priority: vec![
                "zenith".to_string(),
                "kaido".to_string(),
                "streamline".to_string(),
                "vaultix".to_string(),
            ],
            trusted_sources: vec!["zenith".to_string()],
            similarity_threshold: 0.90,
            min_direct_votes: 10,
            max_description_len: 500,
            cache_dir: PathBuf::from("cache"),
            disk_ttl_multiplier: 6,
            catalog_ttl: Duration::from_secs(30 * 60),
            metadata_ttl: Duration::from_secs(6 * 60 * 60),
            search_ttl: Duration::from_secs(60 * 60),
            max_concurrent_fetches: 4,
            fetch_retries: 2,
            fetch_retry_delay: Duration::from_secs(1),
            window_fetch_multiplier: 5,
            refresh_scan_pages: 3,
            refresh_known_streak: 5,
            denylist_threshold: 3,
            denylist_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `POLYCAT_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(list) = env_list("POLYCAT_PROVIDER_PRIORITY") {
            config.provider_priority = list;
        }
        if let Some(list) = env_list("POLYCAT_TRUSTED_SOURCES") {
            config.trusted_sources = list;
        }
        if let Some(v) = env_parse::<f64>("POLYCAT_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse("POLYCAT_MIN_DIRECT_VOTES") {
            config.min_direct_votes = v;
        }
        if let Some(v) = env_parse("POLYCAT_MAX_DESCRIPTION_LEN") {
            config.max_description_len = v;
        }
        if let Ok(dir) = env::var("POLYCAT_CACHE_DIR") {
            if !dir.is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }
        if let Some(v) = env_parse("POLYCAT_DISK_TTL_MULTIPLIER") {
            config.disk_ttl_multiplier = v;
        }
        if let Some(v) = env_secs("POLYCAT_CATALOG_TTL_SECS") {
            config.catalog_ttl = v;
        }
        if let Some(v) = env_secs("POLYCAT_METADATA_TTL_SECS") {
            config.metadata_ttl = v;
        }
        if let Some(v) = env_secs("POLYCAT_SEARCH_TTL_SECS") {
            config.search_ttl = v;
        }
        if let Some(v) = env_parse("POLYCAT_MAX_CONCURRENT_FETCHES") {
            config.max_concurrent_fetches = v;
        }
        if let Some(v) = env_parse("POLYCAT_FETCH_RETRIES") {
            config.fetch_retries = v;
        }
        if let Some(v) = env_secs("POLYCAT_FETCH_RETRY_DELAY_SECS") {
            config.fetch_retry_delay = v;
        }
        if let Some(v) = env_parse("POLYCAT_WINDOW_FETCH_MULTIPLIER") {
            config.window_fetch_multiplier = v;
        }
        if let Some(v) = env_parse("POLYCAT_REFRESH_SCAN_PAGES") {
            config.refresh_scan_pages = v;
        }
        if let Some(v) = env_parse("POLYCAT_REFRESH_KNOWN_STREAK") {
            config.refresh_known_streak = v;
        }
        if let Some(v) = env_parse("POLYCAT_DENYLIST_THRESHOLD") {
            config.denylist_threshold = v;
        }
        if let Some(v) = env_secs("POLYCAT_DENYLIST_TTL_SECS") {
            config.denylist_ttl = v;
        }
        config
    }

    /// Rank of a provider in the priority order; unknown providers sort last.
    pub fn provider_rank(&self, source: &str) -> usize {
        self.provider_priority
            .iter()
            .position(|p| p == source)
            .unwrap_or(self.provider_priority.len())
    }

    pub fn is_trusted(&self, source: &str) -> bool {
        self.trusted_sources.iter().any(|s| s == source)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let list: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}
