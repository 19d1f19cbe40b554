//! Periodic flush from the collector into the aggregator.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ds_core::SettingsStore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::StatisticsAggregator;
use crate::collector::BandwidthCollector;

/// Wall-clock epoch millis.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Flush everything due at `now_ms`, one aggregator batch per collector
/// batch. Storage errors are logged and the batch is dropped. Returns the
/// number of observations recorded.
pub async fn flush_once<S>(collector: &BandwidthCollector, aggregator: &StatisticsAggregator<S>, now_ms: u64) -> usize
where
    S: SettingsStore + ?Sized,
{
    let flushed = collector.flush_due(now_ms);
    let mut recorded = 0;
    for batch in flushed.chunks(collector.config().batch_size.max(1)) {
        match aggregator.record_batch(batch, now_ms).await {
            Ok(()) => recorded += batch.len(),
            Err(e) => log::error!("Lost {} bandwidth observations: {e}", batch.len()),
        }
    }
    recorded
}

/// Run `flush_once` every flush interval until the task is aborted.
pub fn spawn_flush_loop<S>(collector: Arc<BandwidthCollector>, aggregator: Arc<StatisticsAggregator<S>>) -> JoinHandle<()>
where
    S: SettingsStore + ?Sized + 'static,
{
    let interval = Duration::from_millis(collector.config().flush_interval_ms.max(1));
    let epoch_base = now_ms();
    let started = Instant::now();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = epoch_base + started.elapsed().as_millis() as u64;
            flush_once(&collector, &aggregator, now).await;
        }
    })
}
