//! DataSaver Bandwidth Telemetry
//!
//! Collects per-resource observations from two independent network sources,
//! merges and debounces them, and folds the settled records into bounded
//! per-day statistics.
//!
//! # Modules
//!
//! - `observation`: Raw source events and the merge into one record
//! - `batch`: Bounded batch queue
//! - `collector`: Per-URL buffering with settle and max-age thresholds
//! - `aggregator`: Statistics accumulation and batched persistence
//! - `pipeline`: Periodic flush loop

pub mod aggregator;
pub mod batch;
pub mod collector;
pub mod error;
pub mod observation;
pub mod pipeline;

pub use aggregator::{record_observation, StatisticsAggregator};
pub use batch::BatchQueue;
pub use collector::{BandwidthCollector, PendingObservation};
pub use error::TelemetryError;
pub use observation::{merge, BandwidthObservation, HttpHeader, NetworkObservation, PerformanceObservation};
pub use pipeline::{flush_once, now_ms, spawn_flush_loop};
