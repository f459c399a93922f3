use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::models::AggregatedRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub display_name: String,
    pub record_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleStats {
    pub total_records: usize,
    pub multi_provider_records: usize,
    pub rated_records: usize,
}

/// Precomputed catalog document produced by the offline batch builder.
///
/// The builder links this crate and runs the same merge pipeline as the live
/// path, so a bundle can be installed wholesale at process start (see
/// [`crate::accumulate::CatalogEngine::seed_from_bundle`]) without any
/// semantic drift between online and offline records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineBundle {
    pub version: String,
    pub build_date: DateTime<Utc>,
    pub providers_meta: BTreeMap<String, ProviderMeta>,
    pub catalog: Vec<AggregatedRecord>,
    pub slug_registry: BTreeMap<String, BTreeMap<String, String>>,
    pub stats: BundleStats,
}

impl OfflineBundle {
    /// Assembles a bundle from an already-merged record set.
    pub fn build(version: impl Into<String>, catalog: Vec<AggregatedRecord>) -> Self {
        let mut providers_meta: BTreeMap<String, ProviderMeta> = BTreeMap::new();
        let mut slug_registry: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut multi_provider_records = 0;
        let mut rated_records = 0;

        for record in &catalog {
            if record.providers.len() > 1 {
                multi_provider_records += 1;
            }
            if record.rating.is_some() {
                rated_records += 1;
            }
            for provider in &record.providers {
                providers_meta
                    .entry(provider.clone())
                    .or_insert_with(|| ProviderMeta {
                        display_name: provider.clone(),
                        record_count: 0,
                    })
                    .record_count += 1;
            }
            slug_registry.insert(record.id.clone(), record.provider_slugs.clone());
        }

        let stats = BundleStats {
            total_records: catalog.len(),
            multi_provider_records,
            rated_records,
        };
        Self {
            version: version.into(),
            build_date: Utc::now(),
            providers_meta,
            catalog,
            slug_registry,
            stats,
        }
    }

    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read bundle at {}", path.display()))?;
        let bundle: Self =
            serde_json::from_slice(&bytes).context("failed to parse bundle JSON")?;
        info!(
            version = %bundle.version,
            records = bundle.stats.total_records,
            "loaded offline bundle"
        );
        Ok(bundle)
    }

    pub async fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec(self).context("failed to encode bundle")?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("failed to write bundle to {}", path.display()))?;
        Ok(())
    }

    /// Fetches a bundle re-served by the edge layer.
    pub async fn fetch(url: &str) -> Result<Self> {
        let user_agent = format!("polycat/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .user_agent(user_agent)
            .build()
            .context("failed to build bundle HTTP client")?;
        let res = client
            .get(url)
            .send()
            .await
            .context("bundle request failed")?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!("bundle fetch failed with status {}", status));
        }
        let bundle: Self = res.json().await.context("failed to parse bundle JSON")?;
        info!(
            version = %bundle.version,
            records = bundle.stats.total_records,
            url,
            "fetched offline bundle"
        );
        Ok(bundle)
    }
}
