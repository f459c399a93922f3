use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use polycat::merge::from_source;
use polycat::models::{EpisodeRef, RatingKind, SourceRecord};
use polycat::{
    CatalogEngine, CatalogQuery, Denylist, EngineConfig, OfflineBundle, SlugRegistry,
    SortStrategy, SourceApi, SourceError, SourceSet, TieredCache, TimeWindow,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SYNOPSIS: &str = "After the fall of the northern keep, a young cartographer discovers a \
    map that rewrites the history of her family and sets out on a journey across a fractured \
    world to find the people who erased it.";

struct FakeSource {
    id: String,
    monotonic: bool,
    pages: Mutex<Vec<Vec<SourceRecord>>>,
    year_pages: Option<Vec<Vec<SourceRecord>>>,
    metadata: HashMap<String, SourceRecord>,
    failing: HashMap<String, u16>,
    search_hits: Vec<SourceRecord>,
    catalog_calls: Mutex<Vec<u32>>,
}

impl FakeSource {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            monotonic: true,
            pages: Mutex::new(Vec::new()),
            year_pages: None,
            metadata: HashMap::new(),
            failing: HashMap::new(),
            search_hits: Vec::new(),
            catalog_calls: Mutex::new(Vec::new()),
        }
    }

    fn with_pages(mut self, pages: Vec<Vec<SourceRecord>>) -> Self {
        self.pages = Mutex::new(pages);
        self
    }

    fn set_pages(&self, pages: Vec<Vec<SourceRecord>>) {
        *self.pages.lock().unwrap() = pages;
    }

    fn calls(&self) -> Vec<u32> {
        self.catalog_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceApi for FakeSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch_catalog(
        &self,
        page: u32,
        _genre: Option<&str>,
        _sort: polycat::SortHint,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        self.catalog_calls.lock().unwrap().push(page);
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get((page - 1) as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_metadata(&self, id: &str) -> Result<SourceRecord, SourceError> {
        if let Some(status) = self.failing.get(id) {
            return Err(SourceError::Http { status: *status });
        }
        self.metadata
            .get(id)
            .cloned()
            .ok_or(SourceError::Http { status: 404 })
    }

    async fn search(&self, _query: &str) -> Result<Vec<SourceRecord>, SourceError> {
        Ok(self.search_hits.clone())
    }

    async fn fetch_catalog_by_year(
        &self,
        _year: i32,
        page: u32,
    ) -> Result<Option<Vec<SourceRecord>>, SourceError> {
        match &self.year_pages {
            Some(pages) => Ok(Some(
                pages.get((page - 1) as usize).cloned().unwrap_or_default(),
            )),
            None => Ok(None),
        }
    }

    fn recent_is_monotonic(&self) -> bool {
        self.monotonic
    }
}

fn rec(source: &str, slug: &str, name: &str) -> SourceRecord {
    SourceRecord {
        id: format!("{source}:{slug}"),
        name: name.to_string(),
        poster: format!("https://cdn.example/{slug}.jpg"),
        description: String::new(),
        genres: vec![],
        studio: None,
        year: None,
        rating: None,
        rating_kind: RatingKind::Direct,
        vote_count: None,
        view_count: None,
        last_updated: Some(Utc::now() - ChronoDuration::hours(2)),
        episodes: vec![],
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        fetch_retries: 0,
        fetch_retry_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

struct Harness {
    engine: CatalogEngine,
    denylist: Arc<Denylist>,
    registry: Arc<SlugRegistry>,
    cache: TieredCache,
    _dir: TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build_engine(sources: Vec<Arc<FakeSource>>, config: EngineConfig) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = TieredCache::new(dir.path(), config.disk_ttl_multiplier).expect("cache");
    let denylist = Arc::new(Denylist::new(&config));
    let registry = Arc::new(SlugRegistry::new());
    let sources = sources
        .into_iter()
        .map(|source| source as Arc<dyn SourceApi>)
        .collect();
    let engine = CatalogEngine::new(
        SourceSet::new(sources),
        cache.clone(),
        denylist.clone(),
        registry.clone(),
        config,
    );
    Harness {
        engine,
        denylist,
        registry,
        cache,
        _dir: dir,
    }
}

fn alpha_query() -> CatalogQuery {
    let mut query = CatalogQuery::new("top", "all");
    query.sort = SortStrategy::Alphabetical;
    query
}

#[tokio::test]
async fn merges_duplicates_across_sources_and_resolves_priority_rating() {
    let mut sister = rec("zenith", "sister-breeder", "Sister Breeder");
    sister.rating = Some(8.6);
    sister.vote_count = Some(50);
    sister.description = SYNOPSIS.to_string();

    let mut sister_kaido = rec("kaido", "sister-breeder", "sister-breeder");
    sister_kaido.view_count = Some(15_000);

    let zenith = Arc::new(FakeSource::new("zenith").with_pages(vec![vec![sister]]));
    let kaido = Arc::new(FakeSource::new("kaido").with_pages(vec![vec![
        sister_kaido,
        rec("kaido", "winter-keep", "Winter Keep"),
    ]]));

    let harness = build_engine(vec![zenith.clone(), kaido.clone()], test_config());
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "Sister Breeder");
    assert_eq!(items[0].id, "zenith:sister-breeder");
    assert_eq!(items[0].rating, "8.6");
    assert_eq!(items[1].name, "Winter Keep");
    assert_eq!(items[1].rating, "N/A");

    // Both native slugs are registered under the merged record.
    let slugs = harness
        .registry
        .slugs_for("zenith:sister-breeder")
        .expect("registered");
    assert_eq!(slugs.get("kaido").map(String::as_str), Some("sister-breeder"));
}

#[tokio::test]
async fn thin_direct_votes_lose_to_a_solid_view_signal() {
    let mut sister = rec("zenith", "sister-breeder", "Sister Breeder");
    sister.rating = Some(8.6);
    sister.vote_count = Some(3);

    let mut sister_kaido = rec("kaido", "sister-breeder", "sister-breeder");
    sister_kaido.view_count = Some(15_000);

    let zenith = Arc::new(FakeSource::new("zenith").with_pages(vec![vec![sister]]));
    let kaido = Arc::new(FakeSource::new("kaido").with_pages(vec![vec![sister_kaido]]));

    let harness = build_engine(vec![zenith, kaido], test_config());
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].rating, "6.3");
}

#[tokio::test]
async fn time_window_views_accumulate_five_times_the_requested_window() {
    // 12 pages of 10 unique recent records each.
    let pages: Vec<Vec<SourceRecord>> = (1..=12)
        .map(|p| {
            (1..=10)
                .map(|i| rec("zenith", &format!("t{p}p{i}"), &format!("t{p}p{i}")))
                .collect()
        })
        .collect();
    let zenith = Arc::new(FakeSource::new("zenith").with_pages(pages));

    let harness = build_engine(vec![zenith.clone()], test_config());
    let mut query = CatalogQuery::new("recent", "window=week");
    query.time_window = Some(TimeWindow::Week);
    query.sort = SortStrategy::Recency;

    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 20);

    // target = (0 + 20) * 5 = 100 raw records, reached after page 10.
    let calls = zenith.calls();
    assert_eq!(calls.iter().max(), Some(&10));
    assert_eq!(calls.len(), 10);
}

#[tokio::test]
async fn exhausted_sources_complete_the_view_and_stop_fetching() {
    let zenith = Arc::new(FakeSource::new("zenith").with_pages(vec![vec![
        rec("zenith", "a", "Alpha Den"),
        rec("zenith", "b", "Bright Hollow"),
        rec("zenith", "c", "Cinder Row"),
    ]]));

    let harness = build_engine(vec![zenith.clone()], test_config());
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;
    assert_eq!(items.len(), 3);
    // Page 1 produced records; page 2 came back empty and completed the view.
    assert_eq!(zenith.calls(), vec![1, 2]);

    let again = harness.engine.serve(&alpha_query(), 0, 20).await;
    assert_eq!(again.len(), 3);
    // A complete view never pays another upstream fetch.
    assert_eq!(zenith.calls(), vec![1, 2]);
}

#[tokio::test]
async fn malformed_records_are_dropped_silently() {
    let mut broken = rec("zenith", "broken", "Broken");
    broken.poster = String::new();
    let zenith = Arc::new(
        FakeSource::new("zenith")
            .with_pages(vec![vec![broken, rec("zenith", "fine", "Fine Title")]]),
    );

    let harness = build_engine(vec![zenith], test_config());
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Fine Title");
}

#[tokio::test]
async fn genre_filters_and_blacklists_apply_in_order() {
    let mut drama = rec("zenith", "a", "Arc of Ash");
    drama.genres = vec!["Drama".to_string()];
    let mut horror = rec("zenith", "b", "Black Lantern");
    horror.genres = vec!["Horror".to_string()];
    let mut both = rec("zenith", "c", "Cold Harvest");
    both.genres = vec!["Drama".to_string(), "Horror".to_string()];

    let zenith = Arc::new(FakeSource::new("zenith").with_pages(vec![vec![drama, horror, both]]));
    let harness = build_engine(vec![zenith], test_config());

    let mut query = alpha_query();
    query.genre = Some("Drama".to_string());
    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 2);

    query.exclude_genres = vec!["Horror".to_string()];
    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Arc of Ash");
}

#[tokio::test]
async fn year_views_use_native_listings_and_filter_generic_fallbacks() {
    let mut native = rec("zenith", "y1", "Year Son");
    native.year = Some(2021);
    // The generic listing would be wrong for this view; it must stay untouched.
    let mut zenith = FakeSource::new("zenith")
        .with_pages(vec![vec![rec("zenith", "x", "Should Not Appear")]]);
    zenith.year_pages = Some(vec![vec![native]]);
    let zenith = Arc::new(zenith);

    let mut matching = rec("kaido", "kestrel", "Kestrel Vale");
    matching.year = Some(2021);
    let mut stale = rec("kaido", "larkspur", "Larkspur");
    stale.year = Some(2019);
    let kaido = Arc::new(FakeSource::new("kaido").with_pages(vec![vec![matching, stale]]));

    let harness = build_engine(vec![zenith.clone(), kaido], test_config());
    let mut query = alpha_query();
    query.year = Some(2021);

    let items = harness.engine.serve(&query, 0, 20).await;
    let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["Kestrel Vale", "Year Son"]);
    // zenith served its native year listing; its generic catalog was never hit.
    assert!(zenith.calls().is_empty());
}

#[tokio::test]
async fn repeated_server_faults_denylist_the_record() {
    let mut source = FakeSource::new("zenith").with_pages(vec![vec![
        rec("zenith", "a", "Alpha Den"),
        rec("zenith", "b", "Bright Hollow"),
    ]]);
    source.failing.insert("zenith:a".to_string(), 503);
    let zenith = Arc::new(source);

    let harness = build_engine(vec![zenith], test_config());
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;
    assert_eq!(items.len(), 2);

    for _ in 0..3 {
        assert!(harness.engine.get_metadata("zenith:a").await.is_err());
    }
    assert!(harness.denylist.is_blocked("zenith:a"));

    // The broken record vanishes from catalog results until the entry expires.
    let items = harness.engine.serve(&alpha_query(), 0, 20).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "Bright Hollow");

    let err = harness.engine.get_metadata("zenith:a").await.unwrap_err();
    assert!(err.to_string().contains("denylisted"));
}

#[tokio::test]
async fn not_found_metadata_does_not_denylist() {
    let zenith = Arc::new(
        FakeSource::new("zenith").with_pages(vec![vec![rec("zenith", "a", "Alpha Den")]]),
    );
    let harness = build_engine(vec![zenith], test_config());

    for _ in 0..5 {
        assert!(harness.engine.get_metadata("zenith:missing").await.is_err());
    }
    assert!(!harness.denylist.is_blocked("zenith:missing"));
}

#[tokio::test]
async fn metadata_is_enriched_across_registered_providers() {
    let mut sister = rec("zenith", "sister-breeder", "Sister Breeder");
    sister.rating = Some(8.6);
    sister.vote_count = Some(50);
    let mut sister_kaido = rec("kaido", "sister-breeder", "sister-breeder");
    sister_kaido.view_count = Some(15_000);

    let mut enriched = sister.clone();
    enriched.description = SYNOPSIS.to_string();
    enriched.episodes = vec![
        EpisodeRef {
            number: 1,
            id: "zenith:sister-breeder:1".to_string(),
            title: Some("First Light".to_string()),
            poster: None,
            released: None,
        },
        EpisodeRef {
            number: 2,
            id: "zenith:sister-breeder:2".to_string(),
            title: None,
            poster: None,
            released: None,
        },
    ];

    let mut zenith = FakeSource::new("zenith").with_pages(vec![vec![sister]]);
    zenith
        .metadata
        .insert("zenith:sister-breeder".to_string(), enriched);
    let mut kaido = FakeSource::new("kaido").with_pages(vec![vec![sister_kaido.clone()]]);
    kaido
        .metadata
        .insert("kaido:sister-breeder".to_string(), sister_kaido);

    let harness = build_engine(vec![Arc::new(zenith), Arc::new(kaido)], test_config());
    harness.engine.serve(&alpha_query(), 0, 20).await;

    let record = harness
        .engine
        .get_metadata("zenith:sister-breeder")
        .await
        .expect("metadata");
    assert_eq!(record.providers.len(), 2);
    assert_eq!(record.episodes.len(), 2);
    assert_eq!(record.rating, Some(8.6));
    assert_eq!(record.rating_source.as_deref(), Some("zenith"));
    assert!(record.description.starts_with("After the fall"));
}

#[tokio::test]
async fn search_reconciles_hits_from_every_source() {
    let mut hit_zenith = rec("zenith", "sister-breeder", "Sister Breeder");
    hit_zenith.rating = Some(8.6);
    hit_zenith.vote_count = Some(50);
    let mut hit_kaido = rec("kaido", "sister-breeder", "sister-breeder");
    hit_kaido.view_count = Some(15_000);

    let mut zenith = FakeSource::new("zenith");
    zenith.search_hits = vec![hit_zenith];
    let mut kaido = FakeSource::new("kaido");
    kaido.search_hits = vec![hit_kaido];

    let harness = build_engine(vec![Arc::new(zenith), Arc::new(kaido)], test_config());
    let results = harness.engine.search("sister breeder").await.expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].providers.len(), 2);
    assert_eq!(results[0].rating, Some(8.6));

    let empty = harness.engine.search("   ").await.expect("blank search");
    assert!(empty.is_empty());
}

const DISTINCT_NAMES: [&str; 8] = [
    "Ashgrove",
    "Briarwood",
    "Caldera Nights",
    "Driftmark",
    "Emberfall",
    "Foxglove Lane",
    "Galehollow",
    "Harrowgate",
];

#[tokio::test]
async fn refresh_stops_early_once_the_scan_catches_up() {
    let known: Vec<SourceRecord> = DISTINCT_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| rec("zenith", &format!("k{i}"), name))
        .collect();
    let zenith = Arc::new(FakeSource::new("zenith").with_pages(vec![known.clone()]));

    let harness = build_engine(vec![zenith.clone()], test_config());
    let query = alpha_query();
    harness.engine.serve(&query, 0, 3).await;
    let calls_after_serve = zenith.calls().len();

    // A brand-new record now sits on page 2, but the page-1 scan hits the
    // known streak first and stops before ever reaching it.
    zenith.set_pages(vec![known, vec![rec("zenith", "new", "Newly Added")]]);

    harness.engine.refresh_recent(&query).await;
    assert_eq!(zenith.calls().len(), calls_after_serve + 1);
    assert!(harness.registry.slugs_for("zenith:new").is_none());
}

#[tokio::test]
async fn unreliable_recent_ordering_forces_a_full_first_page_scan() {
    let known: Vec<SourceRecord> = DISTINCT_NAMES[..6]
        .iter()
        .enumerate()
        .map(|(i, name)| rec("vaultix", &format!("k{i}"), name))
        .collect();
    let mut source = FakeSource::new("vaultix").with_pages(vec![known.clone()]);
    source.monotonic = false;
    let vaultix = Arc::new(source);

    let harness = build_engine(vec![vaultix.clone()], test_config());
    let query = alpha_query();
    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 6);

    // A reupload lands at the bottom of page 1, behind six known records.
    let mut page = known;
    page.push(rec("vaultix", "gem", "Hidden Gem"));
    vaultix.set_pages(vec![page]);

    let changed = harness.engine.refresh_recent(&query).await;
    assert!(changed > 0);
    // The early-stop rule would have ended the scan at the fifth known
    // record; this source ignores it and finds the late addition.
    assert!(harness.registry.slugs_for("vaultix:gem").is_some());

    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 7);
}

#[tokio::test]
async fn bundle_seeding_serves_without_any_upstream_fetch() {
    let config = test_config();
    let mut first = rec("zenith", "dark-moon", "Dark Moon");
    first.rating = Some(8.1);
    first.vote_count = Some(200);
    let second = rec("kaido", "winter-keep", "Winter Keep");
    let catalog = vec![
        from_source(&first, &config).expect("valid"),
        from_source(&second, &config).expect("valid"),
    ];
    let bundle = OfflineBundle::build("2026-08-01", catalog);

    let zenith = Arc::new(
        FakeSource::new("zenith").with_pages(vec![vec![rec("zenith", "x", "Should Not Appear")]]),
    );
    let harness = build_engine(vec![zenith.clone()], config);

    let query = alpha_query();
    let seeded = harness.engine.seed_from_bundle(&bundle, &query).await;
    assert_eq!(seeded, 2);
    assert!(harness.cache.bulk_mode());

    let items = harness.engine.serve(&query, 0, 20).await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "Dark Moon");
    assert!(zenith.calls().is_empty());
}

#[tokio::test]
async fn shutdown_flushes_service_state_for_the_next_process() {
    let zenith = Arc::new(
        FakeSource::new("zenith").with_pages(vec![vec![rec("zenith", "a", "Alpha Den")]]),
    );
    let config = EngineConfig {
        denylist_threshold: 1,
        ..test_config()
    };
    let harness = build_engine(vec![zenith], config.clone());

    harness.engine.serve(&alpha_query(), 0, 20).await;
    harness.denylist.record_failure("zenith:doomed");
    harness.engine.shutdown().await;

    let restored_denylist = Denylist::load(&harness.cache, &config).await;
    assert!(restored_denylist.is_blocked("zenith:doomed"));
    let restored_registry = SlugRegistry::load(&harness.cache).await;
    assert!(restored_registry.slugs_for("zenith:a").is_some());
}
