//! Bandwidth statistics containers
//!
//! Counters are kept per UTC day. Once more than the retention window of days
//! is held, the oldest days are folded into a lifetime aggregate that is never
//! expired.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DAY_MS;
use crate::settings::{SettingsItem, SettingsKind};
use crate::types::AssetCategory;
use crate::url::Origin;

/// Start of the UTC day containing `now_ms`.
#[inline]
pub fn day_bucket(now_ms: u64) -> u64 {
    now_ms / DAY_MS * DAY_MS
}

// =============================================================================
// Single Asset Statistics
// =============================================================================

/// One non-negative counter per asset category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleAssetStatistics {
    pub audio: u64,
    pub font: u64,
    pub html: u64,
    pub image: u64,
    pub other: u64,
    pub script: u64,
    pub style: u64,
    pub video: u64,
}

impl SingleAssetStatistics {
    pub fn get(&self, category: AssetCategory) -> u64 {
        match category {
            AssetCategory::Audio => self.audio,
            AssetCategory::Font => self.font,
            AssetCategory::Html => self.html,
            AssetCategory::Image => self.image,
            AssetCategory::Other => self.other,
            AssetCategory::Script => self.script,
            AssetCategory::Style => self.style,
            AssetCategory::Video => self.video,
        }
    }

    fn slot(&mut self, category: AssetCategory) -> &mut u64 {
        match category {
            AssetCategory::Audio => &mut self.audio,
            AssetCategory::Font => &mut self.font,
            AssetCategory::Html => &mut self.html,
            AssetCategory::Image => &mut self.image,
            AssetCategory::Other => &mut self.other,
            AssetCategory::Script => &mut self.script,
            AssetCategory::Style => &mut self.style,
            AssetCategory::Video => &mut self.video,
        }
    }

    pub fn add(&mut self, category: AssetCategory, amount: u64) {
        let slot = self.slot(category);
        *slot = slot.saturating_add(amount);
    }

    /// Field-wise sum.
    pub fn add_all(&mut self, other: &SingleAssetStatistics) {
        for category in AssetCategory::ALL {
            self.add(category, other.get(category));
        }
    }

    pub fn total(&self) -> u64 {
        AssetCategory::ALL
            .iter()
            .fold(0u64, |acc, &c| acc.saturating_add(self.get(c)))
    }
}

// =============================================================================
// Combined Asset Statistics
// =============================================================================

/// Daily counters plus the aggregate of every evicted day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CombinedAssetStatistics {
    pub aggregate: SingleAssetStatistics,
    /// Keyed by the epoch millis of the day start.
    pub daily_stats: BTreeMap<u64, SingleAssetStatistics>,
}

impl CombinedAssetStatistics {
    /// Add `amount` to today's bucket for `category`, then enforce the
    /// retention window.
    pub fn increment(&mut self, category: AssetCategory, amount: u64, now_ms: u64, retention_days: usize) {
        self.daily_stats
            .entry(day_bucket(now_ms))
            .or_default()
            .add(category, amount);
        self.evict(retention_days);
    }

    /// Fold the oldest days into `aggregate` until at most `retention_days`
    /// remain. Returns the number of days folded.
    pub fn evict(&mut self, retention_days: usize) -> usize {
        let mut evicted = 0;
        while self.daily_stats.len() > retention_days {
            let Some((_, day)) = self.daily_stats.pop_first() else {
                break;
            };
            self.aggregate.add_all(&day);
            evicted += 1;
        }
        evicted
    }

    /// Lifetime totals: aggregate plus every retained day.
    pub fn lifetime(&self) -> SingleAssetStatistics {
        let mut total = self.aggregate;
        for day in self.daily_stats.values() {
            total.add_all(day);
        }
        total
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Everything recorded for one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Statistics {
    pub bytes_used: CombinedAssetStatistics,
    pub bytes_saved: CombinedAssetStatistics,
    pub requests_made: CombinedAssetStatistics,
    pub requests_compressed: CombinedAssetStatistics,
    /// Third-party assets loaded by a site, keyed by the asset's origin.
    /// Always empty for the global scope.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub cross_origin: BTreeMap<Origin, CombinedAssetStatistics>,
}

impl SettingsItem for Statistics {
    const KIND: SettingsKind = SettingsKind::Statistics;
}
