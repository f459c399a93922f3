use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// On-disk envelope, one JSON file per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub memory_expires_at: DateTime<Utc>,
    pub disk_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Memory + disk cache with stale-while-revalidate.
///
/// The disk tier holds every entry for `disk_ttl_multiplier` times its
/// memory TTL; within that retention window an expired entry is served
/// immediately while a single background refresh replaces it. Disk I/O
/// failures are logged and treated as misses, never surfaced. The cache is
/// best-effort, not authoritative storage: concurrent writers to one key may
/// lose a write.
///
/// Cloning is cheap and every clone shares the same tiers.
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: DashMap<String, MemoryEntry>,
    disk_dir: PathBuf,
    disk_ttl_multiplier: u32,
    bulk_mode: AtomicBool,
    refreshing: DashMap<String, ()>,
}

impl TieredCache {
    pub fn new(disk_dir: impl AsRef<Path>, disk_ttl_multiplier: u32) -> Result<Self> {
        let disk_dir = disk_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&disk_dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                memory: DashMap::new(),
                disk_dir,
                disk_ttl_multiplier: disk_ttl_multiplier.max(1),
                bulk_mode: AtomicBool::new(false),
                refreshing: DashMap::new(),
            }),
        })
    }

    /// Once a precomputed dataset has been loaded wholesale, caching every
    /// scraped page on disk again only adds cleanup cost; bulk mode keeps
    /// the memory tier and turns the disk tier off.
    pub fn set_bulk_mode(&self, enabled: bool) {
        self.inner.bulk_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn bulk_mode(&self) -> bool {
        self.inner.bulk_mode.load(Ordering::Relaxed)
    }

    /// Memory tier first, then any disk entry still inside its retention
    /// window; a fresh disk hit repopulates the memory tier.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(value) = self.memory_lookup(key) {
            return decode(key, &value);
        }
        let entry = self.read_disk(key).await?;
        let now = Utc::now();
        if now >= entry.disk_expires_at {
            return None;
        }
        if now < entry.memory_expires_at {
            self.inner.memory.insert(
                key.to_string(),
                MemoryEntry {
                    value: entry.value.clone(),
                    expires_at: entry.memory_expires_at,
                },
            );
        }
        decode(key, &entry.value)
    }

    /// Writes both tiers; the disk expiry is `ttl * disk_ttl_multiplier`.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        self.set_with_ttls(key, value, ttl, ttl * self.inner.disk_ttl_multiplier)
            .await;
    }

    pub async fn set_with_ttls<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        memory_ttl: Duration,
        disk_ttl: Duration,
    ) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(err) => {
                warn!(key, error = %err, "failed to serialize cache value");
                return;
            }
        };
        let now = Utc::now();
        let memory_expires_at = now + chrono_duration(memory_ttl);
        self.inner.memory.insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at: memory_expires_at,
            },
        );
        if self.bulk_mode() {
            return;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            memory_expires_at,
            disk_expires_at: now + chrono_duration(disk_ttl),
            created_at: now,
        };
        self.write_disk(&entry).await;
    }

    /// Cache-or-compute with stale-while-revalidate.
    ///
    /// Memory hit: returned with no I/O. Fresh disk hit: memory repopulated
    /// and returned. Expired disk hit still inside the retention window: the
    /// stale value is returned immediately and, unless one is already in
    /// flight, a background refresh runs `producer` and overwrites both
    /// tiers (failures are logged and the cached value left untouched).
    /// Cold key: `producer` runs synchronously — the only path whose error
    /// reaches the caller.
    pub async fn wrap<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(value) = self.memory_lookup(key) {
            if let Some(decoded) = decode(key, &value) {
                return Ok(decoded);
            }
        }

        if let Some(entry) = self.read_disk(key).await {
            let now = Utc::now();
            if now < entry.memory_expires_at {
                self.inner.memory.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: entry.value.clone(),
                        expires_at: entry.memory_expires_at,
                    },
                );
                if let Some(decoded) = decode(key, &entry.value) {
                    return Ok(decoded);
                }
            } else if now < entry.disk_expires_at {
                if let Some(decoded) = decode::<T>(key, &entry.value) {
                    self.spawn_refresh(key, ttl, producer());
                    return Ok(decoded);
                }
            }
        }

        let value = producer().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    fn spawn_refresh<T, Fut>(&self, key: &str, ttl: Duration, fut: Fut)
    where
        T: Serialize + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.inner.refreshing.insert(key.to_string(), ()).is_some() {
            // A refresh for this exact key is already in flight.
            return;
        }
        debug!(key, "serving stale value, refreshing in background");
        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match fut.await {
                Ok(value) => {
                    cache.set(&key, &value, ttl).await;
                    debug!(key = %key, "background refresh complete");
                }
                Err(err) => {
                    // Next caller past the marker may retry.
                    warn!(key = %key, error = %err, "background refresh failed");
                }
            }
            cache.inner.refreshing.remove(&key);
        });
    }

    fn memory_lookup(&self, key: &str) -> Option<serde_json::Value> {
        let expired = {
            let entry = self.inner.memory.get(key)?;
            if Utc::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            true
        };
        if expired {
            self.inner.memory.remove(key);
        }
        None
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.inner
            .disk_dir
            .join(format!("{}.json", hex::encode(digest)))
    }

    async fn read_disk(&self, key: &str) -> Option<CacheEntry> {
        if self.bulk_mode() {
            return None;
        }
        let path = self.disk_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(key, error = %err, "disk cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(key, error = %err, "corrupt disk cache entry, treating as miss");
                None
            }
        }
    }

    // Whole-file replace per key; no partial-write protection by design of
    // a best-effort tier.
    async fn write_disk(&self, entry: &CacheEntry) {
        let path = self.disk_path(&entry.key);
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %entry.key, error = %err, "failed to encode cache entry");
                return;
            }
        };
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            warn!(key = %entry.key, error = %err, "disk cache write failed");
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &serde_json::Value) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(key, error = %err, "cached value does not match requested shape");
            None
        }
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}
