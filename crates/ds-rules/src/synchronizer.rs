//! Rule synchronizer
//!
//! Keeps the engine's installed rules equal to what the current settings
//! compile to. Each capability group owns a disjoint ID set and is reconciled
//! under its own lock, so passes for one group never overlap while different
//! groups proceed independently.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ds_core::config::SyncConfig;
use ds_core::settings::{CompressionMode, SettingsKey, SettingsKind};
use ds_core::{Capabilities, Origin, Rule, RuleUpdate, SettingsStore, StoreChange};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::builder::{owning_group, site_block_ids, Capability};
use crate::engine::InterceptionEngine;
use crate::error::SyncError;
use crate::plan::{plan_group, RuleDiff, GROUPS};
use crate::snapshot::SettingsSnapshot;

/// Bookkeeping for one capability group. Only touched while its lock is held.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupState {
    pub passes: u64,
    pub failed_updates: u64,
    /// Compression mode in force after the last pass. Compression group only.
    pub compression_mode: Option<CompressionMode>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub updates: usize,
    pub failed: usize,
}

impl PassReport {
    fn absorb(&mut self, other: PassReport) {
        self.updates += other.updates;
        self.failed += other.failed;
    }
}

struct GroupSlot {
    group: Capabilities,
    state: Mutex<GroupState>,
    dirty: Notify,
}

/// Capability groups affected by a change to `key`.
pub fn groups_for_key(key: &str) -> Capabilities {
    let Some(key) = SettingsKey::parse(key) else {
        return Capabilities::empty();
    };
    match key.kind {
        SettingsKind::General => Capabilities::ALL,
        SettingsKind::Compression if key.scope.origin().is_none() => {
            Capabilities::COMPRESSION | Capabilities::EXEMPTIONS
        }
        SettingsKind::Compression => Capabilities::COMPRESSION,
        SettingsKind::Proxy => Capabilities::COMPRESSION | Capabilities::EXEMPTIONS,
        SettingsKind::BlockRules => Capabilities::BLOCK,
        SettingsKind::Statistics => Capabilities::empty(),
    }
}

pub struct RuleSynchronizer<S: ?Sized, E: ?Sized> {
    store: Arc<S>,
    engine: Arc<E>,
    config: SyncConfig,
    slots: Vec<GroupSlot>,
    started: AtomicBool,
}

impl<S, E> RuleSynchronizer<S, E>
where
    S: SettingsStore + ?Sized,
    E: InterceptionEngine + ?Sized,
{
    pub fn new(store: Arc<S>, engine: Arc<E>, config: SyncConfig) -> Self {
        let slots = GROUPS
            .iter()
            .map(|&group| GroupSlot {
                group,
                state: Mutex::new(GroupState::default()),
                dirty: Notify::new(),
            })
            .collect();
        Self {
            store,
            engine,
            config,
            slots,
            started: AtomicBool::new(false),
        }
    }

    /// Bookkeeping of a single group.
    pub async fn state(&self, group: Capabilities) -> Option<GroupState> {
        let slot = self.slots.iter().find(|s| s.group == group)?;
        Some(slot.state.lock().await.clone())
    }

    fn slots_in(&self, groups: Capabilities) -> impl Iterator<Item = &GroupSlot> {
        self.slots.iter().filter(move |s| groups.contains(s.group))
    }

    /// Install the global rule of one capability.
    pub async fn apply_default_rules(&self, capability: Capability) -> Result<PassReport, SyncError> {
        let focus: BTreeSet<u32> = [capability.global_id()].into();
        let mut report = PassReport::default();
        for slot in self.slots_in(capability.group()) {
            report.absorb(self.reconcile(slot, Some(&focus)).await?);
        }
        Ok(report)
    }

    /// Install the rules of the site `url` belongs to, in every group.
    pub async fn apply_site_rules(&self, url: &str) -> Result<PassReport, SyncError> {
        let Some(origin) = Origin::parse(url) else {
            log::debug!("No site rules for non-http(s) URL {url}");
            return Ok(PassReport::default());
        };

        let snapshot = SettingsSnapshot::load(self.store.as_ref()).await?;
        let focus = site_rule_ids(&snapshot, &origin);
        if focus.is_empty() {
            log::debug!("{origin} has no private rule offset");
            return Ok(PassReport::default());
        }

        let mut report = PassReport::default();
        for slot in &self.slots {
            report.absorb(self.reconcile(slot, Some(&focus)).await?);
        }
        Ok(report)
    }

    /// Full reconciliation of every group in `groups`.
    pub async fn apply_all_rules(&self, groups: Capabilities) -> Result<PassReport, SyncError> {
        let mut report = PassReport::default();
        for slot in self.slots_in(groups) {
            report.absorb(self.reconcile(slot, None).await?);
        }
        Ok(report)
    }

    /// Reconcile every group. A failing group does not stop the others.
    pub async fn apply_everything(&self) -> PassReport {
        let mut report = PassReport::default();
        for slot in &self.slots {
            match self.reconcile(slot, None).await {
                Ok(r) => report.absorb(r),
                Err(e) => log::error!("Failed to reconcile {:?} rules: {e}", slot.group),
            }
        }
        report
    }

    async fn live_rules(&self, group: Capabilities) -> Result<BTreeMap<u32, Rule>, SyncError> {
        Ok(self
            .engine
            .get_rules()
            .await?
            .into_iter()
            .filter(|r| owning_group(r.id) == Some(group))
            .map(|r| (r.id, r))
            .collect())
    }

    /// One pass for one group. Settings are re-read inside the lock so the
    /// pass never acts on values older than the change that triggered it.
    async fn reconcile(&self, slot: &GroupSlot, focus: Option<&BTreeSet<u32>>) -> Result<PassReport, SyncError> {
        let mut state = slot.state.lock().await;

        let snapshot = SettingsSnapshot::load(self.store.as_ref()).await?;
        let live = self.live_rules(slot.group).await?;
        let plan = plan_group(slot.group, &snapshot);
        let diff = RuleDiff::between(&plan, &live, focus);

        if slot.group == Capabilities::COMPRESSION {
            let mode = Some(snapshot.global.compression.mode);
            if state.compression_mode.is_some() && state.compression_mode != mode {
                log::info!("Compression mode changed from {:?} to {:?}", state.compression_mode, mode);
            }
            state.compression_mode = mode;
        }

        let mut report = PassReport::default();
        if !diff.is_empty() {
            log::debug!(
                "Reconciling {:?}: {} stale, {} global, {} site updates",
                slot.group,
                diff.stale.remove_rule_ids.len(),
                diff.global.add_rules.len(),
                diff.sites.len()
            );
        }

        // Stale removals first so a site returning to the global rules is never
        // covered twice.
        for update in [diff.stale, diff.global] {
            if !update.is_empty() {
                report.absorb(self.push(slot.group, update).await);
            }
        }

        let site_reports: Vec<PassReport> = stream::iter(diff.sites)
            .map(|update| self.push(slot.group, update))
            .buffer_unordered(self.config.max_concurrent_updates.max(1))
            .collect()
            .await;
        for r in site_reports {
            report.absorb(r);
        }

        state.passes += 1;
        state.failed_updates += report.failed as u64;
        Ok(report)
    }

    async fn push(&self, group: Capabilities, update: RuleUpdate) -> PassReport {
        match self.engine.update_rules(update).await {
            Ok(()) => PassReport { updates: 1, failed: 0 },
            Err(e) => {
                log::error!("Engine rejected {group:?} rule update: {e}");
                PassReport { updates: 1, failed: 1 }
            }
        }
    }

    fn mark_dirty(&self, groups: Capabilities) {
        for slot in self.slots_in(groups) {
            slot.dirty.notify_one();
        }
    }
}

/// Rule IDs a site currently owns across all groups.
fn site_rule_ids(snapshot: &SettingsSnapshot, origin: &Origin) -> BTreeSet<u32> {
    let Some(offset) = snapshot.site(origin).and_then(|s| s.offset()) else {
        return BTreeSet::new();
    };
    Capability::ALL
        .iter()
        .map(|c| c.site_id(offset))
        .chain(site_block_ids(origin))
        .collect()
}

// =============================================================================
// Watchers
// =============================================================================

/// Background tasks started by `RuleSynchronizer::start`. Dropping the handle
/// stops them.
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn shutdown(self) {}
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl<S, E> RuleSynchronizer<S, E>
where
    S: SettingsStore + ?Sized + 'static,
    E: InterceptionEngine + ?Sized + 'static,
{
    /// Run the initial pass and keep rules in sync with the store from then
    /// on. May be called once.
    ///
    /// The store is subscribed before the initial pass, so changes made while
    /// it runs trigger another pass rather than being lost.
    pub async fn start(self: &Arc<Self>) -> Result<SyncHandle, SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyStarted);
        }

        let changes = self.store.watch();
        let report = self.apply_everything().await;
        log::info!(
            "Initial rule sync done: {} updates, {} failed",
            report.updates,
            report.failed
        );

        let mut tasks: Vec<JoinHandle<()>> = (0..self.slots.len())
            .map(|index| tokio::spawn(Arc::clone(self).run_worker(index)))
            .collect();
        tasks.push(tokio::spawn(Arc::clone(self).dispatch(changes)));
        Ok(SyncHandle { tasks })
    }

    async fn dispatch(self: Arc<Self>, mut changes: broadcast::Receiver<StoreChange>) {
        loop {
            match changes.recv().await {
                Ok(change) => self.mark_dirty(groups_for_key(&change.key)),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Missed {missed} settings changes, resyncing all rules");
                    self.mark_dirty(Capabilities::ALL);
                }
                Err(RecvError::Closed) => {
                    log::debug!("Settings store closed, stopping rule watchers");
                    return;
                }
            }
        }
    }

    /// Bursts of notifications collapse into at most one pending pass.
    async fn run_worker(self: Arc<Self>, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        loop {
            slot.dirty.notified().await;
            if let Err(e) = self.reconcile(slot, None).await {
                log::error!("Failed to reconcile {:?} rules: {e}", slot.group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::OffsetAllocator;
    use crate::engine::MemoryEngine;
    use ds_core::config::{global_ids, priority};
    use ds_core::settings::{BlockRule, BlockSettings, BlockTarget, Scope};
    use ds_core::store::save_item;
    use ds_core::{CompressionSettings, GeneralSettings, MemoryStore, RuleAction};
    use std::time::Duration;

    type Synchronizer = RuleSynchronizer<MemoryStore, MemoryEngine>;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryEngine>, Arc<Synchronizer>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemoryEngine::new());
        let sync = Arc::new(RuleSynchronizer::new(store.clone(), engine.clone(), SyncConfig::default()));
        (store, engine, sync)
    }

    fn origin(s: &str) -> Origin {
        Origin::parse(s).unwrap()
    }

    async fn opt_out(store: &MemoryStore, site: &str, offset: u32) {
        let general = GeneralSettings {
            rule_id_offset: Some(offset),
            ..GeneralSettings::default()
        };
        save_item(store, &Scope::Site(origin(site)), &general).await.unwrap();
    }

    async fn set_mode(store: &MemoryStore, mode: CompressionMode) {
        let compression = CompressionSettings {
            mode,
            ..CompressionSettings::default()
        };
        save_item(store, &Scope::Global, &compression).await.unwrap();
    }

    fn excluded(engine: &MemoryEngine, id: u32) -> Vec<String> {
        engine
            .rule(id)
            .and_then(|r| r.condition.excluded_initiator_domains)
            .unwrap_or_default()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_groups_for_key() {
        assert_eq!(groups_for_key("sync:general"), Capabilities::ALL);
        assert_eq!(groups_for_key("sync:general-https://a.com"), Capabilities::ALL);
        assert_eq!(
            groups_for_key("sync:compression"),
            Capabilities::COMPRESSION | Capabilities::EXEMPTIONS
        );
        assert_eq!(groups_for_key("sync:compression-https://a.com"), Capabilities::COMPRESSION);
        assert_eq!(groups_for_key("sync:block-rules"), Capabilities::BLOCK);
        assert!(groups_for_key("local:statistics").is_empty());
        assert!(groups_for_key("something-else").is_empty());
    }

    #[tokio::test]
    async fn test_global_simple_rule_single_update() {
        let (_, engine, sync) = setup();
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();

        let history = engine.history();
        assert_eq!(history.len(), 1);
        let update = &history[0];
        assert_eq!(update.add_rules.len(), 1);
        assert_eq!(update.add_rules[0].id, global_ids::COMPRESSION_SIMPLE);
        assert!(update.remove_rule_ids.contains(&global_ids::COMPRESSION_SIMPLE));

        let RuleAction::Redirect { redirect } = &update.add_rules[0].action else {
            panic!("expected redirect");
        };
        let sub = redirect.regex_substitution.as_deref().unwrap();
        assert!(sub.starts_with("https://wsrv.nl/?q=60&output=webp"));
    }

    #[tokio::test]
    async fn test_opted_out_site() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://news.example.com", 5).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();

        assert_eq!(excluded(&engine, global_ids::COMPRESSION_SIMPLE), vec!["news.example.com"]);
        let site_rule = engine.rule(10_005).unwrap();
        assert_eq!(site_rule.priority, priority::SITE_REDIRECT);
        assert_eq!(
            site_rule.condition.initiator_domains,
            Some(vec!["news.example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn test_exclusions_track_opt_outs_and_releases() {
        let (store, engine, sync) = setup();
        let allocator = OffsetAllocator::new(store.clone());
        let a = origin("https://a.com");
        let b = origin("https://b.com");

        let offset_a = allocator.allocate_offset(&a).await.unwrap();
        let offset_b = allocator.allocate_offset(&b).await.unwrap();
        sync.apply_all_rules(Capabilities::ALL).await.unwrap();
        assert_eq!(excluded(&engine, global_ids::COMPRESSION_SIMPLE), vec!["a.com", "b.com"]);
        assert_eq!(excluded(&engine, global_ids::SAVE_DATA), vec!["a.com", "b.com"]);
        assert!(engine.rule(10_000 + offset_a).is_some());
        assert!(engine.rule(50_000 + offset_b).is_some());

        allocator.release_offset(&a).await.unwrap();
        sync.apply_all_rules(Capabilities::ALL).await.unwrap();
        assert_eq!(excluded(&engine, global_ids::COMPRESSION_SIMPLE), vec!["b.com"]);
        assert_eq!(excluded(&engine, global_ids::SAVE_DATA), vec!["b.com"]);
        assert!(engine.rule(10_000 + offset_a).is_none());
        assert!(engine.rule(50_000 + offset_a).is_none());
        assert!(engine.rule(10_000 + offset_b).is_some());
    }

    #[tokio::test]
    async fn test_mode_switch_clears_other_ranges() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://a.com", 3).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();
        assert!(engine.rule(global_ids::COMPRESSION_SIMPLE).is_some());
        assert!(engine.rule(10_003).is_some());

        set_mode(&store, CompressionMode::Proxy).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();
        let ids: Vec<u32> = engine.installed().into_keys().collect();
        assert_eq!(ids, vec![global_ids::COMPRESSION_PROXY, 20_003]);

        set_mode(&store, CompressionMode::WebRequest).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();
        assert!(engine.installed().is_empty());

        let state = sync.state(Capabilities::COMPRESSION).await.unwrap();
        assert_eq!(state.passes, 3);
        assert_eq!(state.compression_mode, Some(CompressionMode::WebRequest));
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://a.com", 0).await;
        sync.apply_everything().await;
        let installed = engine.installed();
        engine.clear_history();

        let report = sync.apply_everything().await;
        assert_eq!(report, PassReport::default());
        assert!(engine.history().is_empty());
        assert_eq!(engine.installed(), installed);
    }

    #[tokio::test]
    async fn test_disabling_removes_everything_but_exemptions() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://a.com", 0).await;
        sync.apply_everything().await;
        assert!(engine.installed().len() > 5);

        let general = GeneralSettings {
            enabled: false,
            ..GeneralSettings::default()
        };
        save_item(store.as_ref(), &Scope::Global, &general).await.unwrap();
        let site_general = GeneralSettings {
            enabled: false,
            rule_id_offset: Some(0),
            ..GeneralSettings::default()
        };
        save_item(store.as_ref(), &Scope::Site(origin("https://a.com")), &site_general)
            .await
            .unwrap();
        sync.apply_everything().await;

        assert!(engine
            .installed()
            .keys()
            .all(|&id| owning_group(id) == Some(Capabilities::EXEMPTIONS)));
    }

    #[tokio::test]
    async fn test_duplicate_offsets_first_site_wins() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://b.com", 7).await;
        opt_out(&store, "https://a.com", 7).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();

        let rule = engine.rule(10_007).unwrap();
        assert_eq!(rule.condition.initiator_domains, Some(vec!["a.com".to_string()]));
        assert_eq!(excluded(&engine, global_ids::COMPRESSION_SIMPLE), vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_site_block_rules_tail_removed() {
        let (store, engine, sync) = setup();
        let site = origin("https://a.com");
        opt_out(&store, "https://a.com", 0).await;

        let entry = |ext: &str| BlockRule {
            target: BlockTarget::Extension {
                extension: ext.to_string(),
            },
            enabled: true,
            min_size: 0,
        };
        let block = BlockSettings {
            rules: vec![entry("gif"), entry("mp4"), entry("webm")],
        };
        save_item(store.as_ref(), &Scope::Site(site.clone()), &block).await.unwrap();
        sync.apply_all_rules(Capabilities::BLOCK).await.unwrap();

        let ids = site_block_ids(&site);
        assert!(ids[..3].iter().all(|id| engine.rule(*id).is_some()));

        let shorter = BlockSettings {
            rules: vec![entry("gif")],
        };
        save_item(store.as_ref(), &Scope::Site(site.clone()), &shorter).await.unwrap();
        sync.apply_all_rules(Capabilities::BLOCK).await.unwrap();
        assert!(engine.rule(ids[0]).is_some());
        assert!(engine.rule(ids[1]).is_none());
        assert!(engine.rule(ids[2]).is_none());
        // Site has its own list; the global list is empty.
        assert!(engine.installed().keys().all(|id| !(200..300).contains(id)));
    }

    #[tokio::test]
    async fn test_apply_default_and_site_rules() {
        let (store, engine, sync) = setup();
        opt_out(&store, "https://a.com", 2).await;

        sync.apply_default_rules(Capability::SaveData).await.unwrap();
        let ids: Vec<u32> = engine.installed().into_keys().collect();
        assert_eq!(ids, vec![global_ids::SAVE_DATA]);

        sync.apply_site_rules("https://a.com/some/page").await.unwrap();
        assert!(engine.rule(10_002).is_some());
        assert!(engine.rule(50_002).is_some());
        assert!(engine.rule(global_ids::COMPRESSION_SIMPLE).is_none());

        let report = sync.apply_site_rules("https://unknown.com/").await.unwrap();
        assert_eq!(report, PassReport::default());
    }

    #[tokio::test]
    async fn test_engine_failures_are_counted_not_raised() {
        let (_, engine, sync) = setup();
        engine.set_fail_updates(true);
        let report = sync.apply_all_rules(Capabilities::SAVE_DATA).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(sync.state(Capabilities::SAVE_DATA).await.unwrap().failed_updates, 1);

        engine.set_fail_updates(false);
        sync.apply_all_rules(Capabilities::SAVE_DATA).await.unwrap();
        assert!(engine.rule(global_ids::SAVE_DATA).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_passes_never_overlap() {
        let (store, engine, sync) = setup();
        for i in 0..10 {
            opt_out(&store, &format!("https://site{i}.com"), i).await;
        }

        let passes = (0..5).map(|i| {
            let sync = sync.clone();
            let store = store.clone();
            async move {
                let mode = if i % 2 == 0 { CompressionMode::Proxy } else { CompressionMode::Simple };
                set_mode(&store, mode).await;
                sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();
            }
        });
        futures::future::join_all(passes).await;
        sync.apply_all_rules(Capabilities::COMPRESSION).await.unwrap();

        assert_eq!(engine.overlapping_updates(), 0);
        // Only the final mode's rules remain.
        let installed = engine.installed();
        let proxy = installed.contains_key(&global_ids::COMPRESSION_PROXY);
        let simple = installed.contains_key(&global_ids::COMPRESSION_SIMPLE);
        assert!(proxy ^ simple);
        assert_eq!(installed.len(), 11);
    }

    #[tokio::test]
    async fn test_watchers_follow_store_changes() {
        let (store, engine, sync) = setup();
        let handle = sync.start().await.unwrap();
        assert!(engine.rule(global_ids::COMPRESSION_SIMPLE).is_some());
        assert!(matches!(sync.start().await, Err(SyncError::AlreadyStarted)));

        opt_out(&store, "https://a.com", 4).await;
        eventually(|| excluded(&engine, global_ids::COMPRESSION_SIMPLE) == vec!["a.com".to_string()]).await;
        eventually(|| engine.rule(10_004).is_some()).await;

        set_mode(&store, CompressionMode::Proxy).await;
        eventually(|| engine.rule(global_ids::COMPRESSION_PROXY).is_some() && engine.rule(10_004).is_none())
            .await;

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_lagging_watcher_resyncs_every_group() {
        let store = Arc::new(MemoryStore::with_watch_capacity(1));
        let engine = Arc::new(MemoryEngine::new());
        let sync = Arc::new(RuleSynchronizer::new(store.clone(), engine.clone(), SyncConfig::default()));
        let handle = sync.start().await.unwrap();
        assert!(engine.rule(global_ids::SAVE_DATA).is_some());

        // Drift the engine, then overflow the change feed with keys that map
        // to no group. Only the lag can bring the rule back.
        engine.update_rules(RuleUpdate::remove([global_ids::SAVE_DATA])).await.unwrap();
        for i in 0..3 {
            store.set("local:statistics", serde_json::json!({ "n": i })).await.unwrap();
        }

        eventually(|| engine.rule(global_ids::SAVE_DATA).is_some()).await;
        handle.shutdown();
    }
}
