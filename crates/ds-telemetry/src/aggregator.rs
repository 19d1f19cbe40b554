//! Statistics aggregator
//!
//! Folds settled observations into the persisted per-day counters. A batch is
//! applied to in-memory copies of every statistics object it touches, and each
//! object is written back once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ds_core::config::StatisticsConfig;
use ds_core::settings::{CompressionEndpoint, ProxySettings, Scope};
use ds_core::store::{load_item, save_item};
use ds_core::{Origin, SettingsStore, Statistics};

use crate::error::TelemetryError;
use crate::observation::BandwidthObservation;

/// Add one observation to the global and, when the page is known, the
/// page's site statistics.
pub fn record_observation(
    observation: &BandwidthObservation,
    global: &mut Statistics,
    site: Option<&mut Statistics>,
    now_ms: u64,
    retention_days: usize,
    compression_origins: &BTreeSet<Origin>,
) {
    let category = observation.category;
    let compressed = observation
        .asset_origin
        .as_ref()
        .is_some_and(|o| compression_origins.contains(o));

    let apply = |stats: &mut Statistics| {
        stats
            .bytes_used
            .increment(category, observation.bytes, now_ms, retention_days);
        stats.requests_made.increment(category, 1, now_ms, retention_days);
        if compressed {
            stats
                .requests_compressed
                .increment(category, 1, now_ms, retention_days);
        }
        if let Some(saved) = observation.bytes_saved {
            stats.bytes_saved.increment(category, saved, now_ms, retention_days);
        }
    };

    apply(global);

    let Some(site) = site else { return };
    apply(&mut *site);

    if let (Some(asset), Some(page)) = (&observation.asset_origin, &observation.page_origin) {
        if asset != page {
            site.cross_origin.entry(asset.clone()).or_default().increment(
                category,
                observation.bytes,
                now_ms,
                retention_days,
            );
        }
    }
}

pub struct StatisticsAggregator<S: ?Sized> {
    store: Arc<S>,
    config: StatisticsConfig,
}

impl<S: SettingsStore + ?Sized> StatisticsAggregator<S> {
    pub fn new(store: Arc<S>, config: StatisticsConfig) -> Self {
        Self { store, config }
    }

    /// Origins whose responses count as compressed: every public endpoint
    /// plus the configured proxy.
    async fn compression_origins(&self) -> BTreeSet<Origin> {
        let mut origins: BTreeSet<Origin> = CompressionEndpoint::ALL.iter().map(|e| e.origin()).collect();
        let proxy: ProxySettings = load_item(self.store.as_ref(), &Scope::Global).await;
        if let Some(origin) = proxy.origin() {
            origins.insert(origin);
        }
        origins
    }

    /// Apply a batch and write every touched statistics object back once.
    pub async fn record_batch(&self, batch: &[BandwidthObservation], now_ms: u64) -> Result<(), TelemetryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let compression_origins = self.compression_origins().await;
        let retention = self.config.retention_days;
        let mut global = self.get_global_statistics().await;
        let mut sites: BTreeMap<Origin, Statistics> = BTreeMap::new();

        for observation in batch {
            let site = match &observation.page_origin {
                Some(page) => {
                    if !sites.contains_key(page) {
                        let loaded = self.get_site_statistics(page).await;
                        sites.insert(page.clone(), loaded);
                    }
                    sites.get_mut(page)
                }
                None => None,
            };
            record_observation(observation, &mut global, site, now_ms, retention, &compression_origins);
        }

        save_item(self.store.as_ref(), &Scope::Global, &global).await?;
        for (origin, stats) in &sites {
            save_item(self.store.as_ref(), &Scope::Site(origin.clone()), stats).await?;
        }

        log::debug!(
            "Recorded {} observations across {} sites",
            batch.len(),
            sites.len()
        );
        Ok(())
    }

    pub async fn get_global_statistics(&self) -> Statistics {
        load_item(self.store.as_ref(), &Scope::Global).await
    }

    /// Statistics of one site; empty if nothing was recorded for it.
    pub async fn get_site_statistics(&self, origin: &Origin) -> Statistics {
        load_item(self.store.as_ref(), &Scope::Site(origin.clone())).await
    }
}
