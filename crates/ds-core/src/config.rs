//! Rule-ID layout, priority tiers and telemetry tunables.
//!
//! The constants describe the shape of the declarative rule space shared by
//! every capability. The `*Config` structs hold runtime-tunable values and can
//! be deserialized from the host's JSON.

use serde::{Deserialize, Serialize};

// =============================================================================
// Rule-ID Layout
// =============================================================================

/// Rule IDs reserved for static exemption rules (inclusive range).
pub mod static_ids {
    /// Allow rule for URLs carrying the redirect-loop marker.
    pub const LOOP_PREVENTION: u32 = 1;
    /// Allow rule for favicons.
    pub const FAVICON_EXEMPTION: u32 = 2;
    /// Allow rule for SVG images.
    pub const SVG_EXEMPTION: u32 = 3;
    /// Allow rule for requests already pointing at a compression endpoint.
    pub const ENDPOINT_EXEMPTION: u32 = 4;
    /// Allow rule for the user's compression denylist.
    pub const DENYLIST_EXEMPTION: u32 = 5;
    /// Last ID of the static block.
    pub const LAST: u32 = 99;
}

/// Well-known global rule slots, one per capability.
pub mod global_ids {
    pub const COMPRESSION_SIMPLE: u32 = 100;
    pub const COMPRESSION_PROXY: u32 = 101;
    pub const COMPRESSION_WEB_REQUEST: u32 = 102;
    pub const BYPASS_CSP: u32 = 103;
    pub const SAVE_DATA: u32 = 104;
    /// First ID of the global block-rule range.
    pub const BLOCK_FIRST: u32 = 200;
}

/// Base IDs of the per-site rule ranges. A site's rule ID is `base + offset`.
pub mod site_bases {
    pub const COMPRESSION_SIMPLE: u32 = 10_000;
    pub const COMPRESSION_PROXY: u32 = 20_000;
    pub const COMPRESSION_WEB_REQUEST: u32 = 30_000;
    pub const BYPASS_CSP: u32 = 40_000;
    pub const SAVE_DATA: u32 = 50_000;
}

/// Number of per-site offsets; valid offsets are `0..SITE_OFFSET_SPACE`.
pub const SITE_OFFSET_SPACE: u32 = 10_000;

/// Maximum number of rules compiled from a single block list.
pub const MAX_BLOCK_RULES: usize = 100;

/// Hash-derived rule IDs are kept at or above this value, clear of every
/// fixed range.
pub const DERIVED_ID_FLOOR: u32 = site_bases::SAVE_DATA + SITE_OFFSET_SPACE;

// =============================================================================
// Priority Tiers
// =============================================================================

/// Rule priorities. Higher values win.
pub mod priority {
    /// User block rules. Nothing the extension allows may unblock them.
    pub const BLOCK: u32 = 200;
    /// Loop prevention and format exemptions. Above every redirect and header rule.
    pub const EXEMPTION: u32 = 100;
    /// Site-scoped redirect rules.
    pub const SITE_REDIRECT: u32 = 3;
    /// Global redirect rules.
    pub const GLOBAL_REDIRECT: u32 = 2;
    /// Header modification rules.
    pub const HEADERS: u32 = 1;
}

// =============================================================================
// Redirect Loop Marker
// =============================================================================

/// Fragment appended to every fallback target. Requests carrying it are never
/// redirected again.
pub const LOOP_MARKER: &str = "ds-loop";

// =============================================================================
// Telemetry
// =============================================================================

/// Length of one statistics day bucket.
pub const DAY_MS: u64 = 86_400_000;

/// Number of daily buckets kept before folding into the aggregate.
pub const DEFAULT_RETENTION_DAYS: usize = 90;

/// Quiet period after the last observation before a record may flush.
pub const DEFAULT_SETTLE_TIME_MS: u64 = 900;

/// Hard upper bound on how long a record may stay pending.
pub const DEFAULT_MAX_AGE_MS: u64 = 10_000;

pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

pub const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 8;

/// Rule synchronizer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Upper bound on in-flight engine update calls during one pass.
    pub max_concurrent_updates: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_updates: DEFAULT_MAX_CONCURRENT_UPDATES,
        }
    }
}

/// Bandwidth event collector tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectorConfig {
    pub settle_time_ms: u64,
    pub max_age_ms: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            settle_time_ms: DEFAULT_SETTLE_TIME_MS,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

/// Statistics aggregation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatisticsConfig {
    pub retention_days: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}
