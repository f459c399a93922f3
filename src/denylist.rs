use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::config::EngineConfig;

const PERSIST_KEY: &str = "denylist:entries";

/// Time-bounded exclusion list for records whose source repeatedly fails to
/// serve them.
///
/// Metadata fetches that die with a server-fault-class error feed
/// [`Denylist::record_failure`]; once an id accumulates enough consecutive
/// faults it is excluded from catalog results until its entry expires.
/// Constructed once per process and injected; [`Denylist::flush`] persists
/// the blocked set through the cache at shutdown.
pub struct Denylist {
    blocked: DashMap<String, DateTime<Utc>>,
    failures: DashMap<String, u32>,
    threshold: u32,
    ttl: Duration,
}

impl Denylist {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            blocked: DashMap::new(),
            failures: DashMap::new(),
            threshold: config.denylist_threshold.max(1),
            ttl: config.denylist_ttl,
        }
    }

    /// Restores the blocked set persisted by a previous process.
    pub async fn load(cache: &TieredCache, config: &EngineConfig) -> Self {
        let denylist = Self::new(config);
        if let Some(entries) = cache.get::<BTreeMap<String, DateTime<Utc>>>(PERSIST_KEY).await {
            let now = Utc::now();
            for (id, expires_at) in entries {
                if expires_at > now {
                    denylist.blocked.insert(id, expires_at);
                }
            }
            info!(count = denylist.blocked.len(), "restored denylist entries");
        }
        denylist
    }

    pub async fn flush(&self, cache: &TieredCache) {
        let now = Utc::now();
        let entries: BTreeMap<String, DateTime<Utc>> = self
            .blocked
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        cache.set(PERSIST_KEY, &entries, self.ttl).await;
        debug!(count = entries.len(), "flushed denylist");
    }

    /// Counts a server-fault failure against the id; enough of them in a row
    /// and the id is blocked for the configured TTL.
    pub fn record_failure(&self, id: &str) {
        let mut count = self.failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            let expires_at = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(6));
            warn!(id, failures = *count, "denylisting persistently broken record");
            drop(count);
            self.failures.remove(id);
            self.blocked.insert(id.to_string(), expires_at);
        }
    }

    /// A successful fetch resets the consecutive-failure count.
    pub fn record_success(&self, id: &str) {
        self.failures.remove(id);
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        let still_blocked = match self.blocked.get(id) {
            Some(entry) => Utc::now() < *entry.value(),
            None => return false,
        };
        if !still_blocked {
            self.blocked.remove(id);
        }
        still_blocked
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}
