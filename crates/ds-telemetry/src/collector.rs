//! Bandwidth event collector
//!
//! Both network sources may report the same asset, in any order, some time
//! apart. Observations are buffered per URL until the record has been quiet
//! for the settle time or has reached its maximum age, then merged into one
//! `BandwidthObservation`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use ds_core::config::CollectorConfig;

use crate::batch::BatchQueue;
use crate::observation::{merge, BandwidthObservation, NetworkObservation, PerformanceObservation};

/// What is known so far about one asset URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObservation {
    pub performance: Option<PerformanceObservation>,
    pub network: Option<NetworkObservation>,
    pub first_seen_at_ms: u64,
    pub last_updated_at_ms: u64,
}

impl PendingObservation {
    fn new(now_ms: u64) -> Self {
        Self {
            performance: None,
            network: None,
            first_seen_at_ms: now_ms,
            last_updated_at_ms: now_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.performance.is_none() && self.network.is_none()
    }

    /// Old enough to give up waiting, or quiet long enough to be complete.
    pub fn is_due(&self, now_ms: u64, config: &CollectorConfig) -> bool {
        now_ms.saturating_sub(self.first_seen_at_ms) >= config.max_age_ms
            || now_ms.saturating_sub(self.last_updated_at_ms) >= config.settle_time_ms
    }
}

struct CollectorState {
    pending: HashMap<String, PendingObservation>,
    /// URLs waiting in `queue`. A URL is queued at most once.
    dirty: HashSet<String>,
    queue: BatchQueue<String>,
}

pub struct BandwidthCollector {
    config: CollectorConfig,
    state: Mutex<CollectorState>,
}

impl BandwidthCollector {
    pub fn new(config: CollectorConfig) -> Self {
        let queue = BatchQueue::new(config.batch_size);
        Self {
            config,
            state: Mutex::new(CollectorState {
                pending: HashMap::new(),
                dirty: HashSet::new(),
                queue,
            }),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn observe_performance(&self, observation: PerformanceObservation, now_ms: u64) {
        let url = observation.url.clone();
        self.observe(url, now_ms, |pending| pending.performance = Some(observation));
    }

    pub fn observe_network(&self, observation: NetworkObservation, now_ms: u64) {
        let url = observation.url.clone();
        self.observe(url, now_ms, |pending| pending.network = Some(observation));
    }

    fn observe(&self, url: String, now_ms: u64, update: impl FnOnce(&mut PendingObservation)) {
        let Ok(mut state) = self.state.lock() else {
            log::error!("Collector state poisoned, dropping observation for {url}");
            return;
        };

        let pending = state
            .pending
            .entry(url.clone())
            .or_insert_with(|| PendingObservation::new(now_ms));
        update(pending);
        pending.last_updated_at_ms = now_ms;

        if state.dirty.insert(url.clone()) {
            state.queue.push(url);
        }
    }

    /// Number of URLs with buffered observations.
    pub fn pending_count(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn pending(&self, url: &str) -> Option<PendingObservation> {
        self.state.lock().ok()?.pending.get(url).cloned()
    }

    /// Scan every queued URL once. Due records are removed and merged; the
    /// rest go back in the queue unchanged.
    pub fn flush_due(&self, now_ms: u64) -> Vec<BandwidthObservation> {
        let Ok(mut state) = self.state.lock() else {
            log::error!("Collector state poisoned, skipping flush");
            return Vec::new();
        };
        let state = &mut *state;

        let mut flushed = Vec::new();
        let mut requeue = Vec::new();
        let mut remaining = state.queue.len();

        while remaining > 0 {
            let batch = state.queue.take_batch();
            remaining = remaining.saturating_sub(batch.len());

            for url in batch {
                let due = match state.pending.get(&url) {
                    None => true,
                    Some(p) if p.is_empty() => true,
                    Some(p) => p.is_due(now_ms, &self.config),
                };
                if !due {
                    requeue.push(url);
                    continue;
                }

                state.dirty.remove(&url);
                let Some(record) = state.pending.remove(&url) else {
                    continue;
                };
                match merge(&url, record.performance.as_ref(), record.network.as_ref()) {
                    Some(observation) => flushed.push(observation),
                    None => log::trace!("Dropping observation without byte count for {url}"),
                }
            }
        }

        for url in requeue {
            state.queue.push(url);
        }
        if !flushed.is_empty() {
            log::debug!("Flushed {} bandwidth observations", flushed.len());
        }
        flushed
    }
}
