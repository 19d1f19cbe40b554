//! Per-site rule-ID offsets
//!
//! A site opts out of the global rules by holding a private offset. Offsets
//! are persisted in the site's general settings; allocation is serialized so
//! two sites never receive the same one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ds_core::config::SITE_OFFSET_SPACE;
use ds_core::settings::{Scope, SettingsKind};
use ds_core::store::{load_item, load_stored_item, save_item, site_origins};
use ds_core::{GeneralSettings, Origin, SettingsStore, StoreError};
use tokio::sync::Mutex;

use crate::error::SyncError;

/// Stored offsets and the sites holding each, in origin order.
async fn offset_holders<S: SettingsStore + ?Sized>(store: &S) -> Result<BTreeMap<u32, Vec<Origin>>, StoreError> {
    let mut holders: BTreeMap<u32, Vec<Origin>> = BTreeMap::new();
    for origin in site_origins(store, &[SettingsKind::General]).await? {
        let general: Option<GeneralSettings> = load_stored_item(store, &Scope::Site(origin.clone())).await;
        if let Some(offset) = general.and_then(|g| g.rule_id_offset) {
            holders.entry(offset).or_default().push(origin);
        }
    }
    Ok(holders)
}

/// Lowest offset no site holds.
pub async fn find_available_offset<S: SettingsStore + ?Sized>(store: &S) -> Result<Option<u32>, StoreError> {
    let holders = offset_holders(store).await?;
    Ok((0..SITE_OFFSET_SPACE).find(|offset| !holders.contains_key(offset)))
}

/// Hands out and reclaims per-site offsets.
pub struct OffsetAllocator<S: ?Sized> {
    store: Arc<S>,
    lock: Mutex<()>,
}

impl<S: SettingsStore + ?Sized> OffsetAllocator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    async fn site_general(&self, origin: &Origin) -> GeneralSettings {
        let scope = Scope::Site(origin.clone());
        match load_stored_item(self.store.as_ref(), &scope).await {
            Some(general) => general,
            None => {
                let global: GeneralSettings = load_item(self.store.as_ref(), &Scope::Global).await;
                GeneralSettings {
                    rule_id_offset: None,
                    ..global
                }
            }
        }
    }

    /// Give `origin` a private offset, returning the one it already holds if
    /// any.
    pub async fn allocate_offset(&self, origin: &Origin) -> Result<u32, SyncError> {
        let _guard = self.lock.lock().await;

        let mut general = self.site_general(origin).await;
        if let Some(offset) = general.rule_id_offset {
            return Ok(offset);
        }

        let offset = find_available_offset(self.store.as_ref())
            .await?
            .ok_or(SyncError::OffsetSpaceExhausted)?;
        general.rule_id_offset = Some(offset);
        save_item(self.store.as_ref(), &Scope::Site(origin.clone()), &general).await?;

        log::info!("Allocated rule offset {offset} to {origin}");
        Ok(offset)
    }

    /// Return `origin` to the global rules.
    pub async fn release_offset(&self, origin: &Origin) -> Result<(), SyncError> {
        let _guard = self.lock.lock().await;

        let scope = Scope::Site(origin.clone());
        let Some(mut general) = load_stored_item::<GeneralSettings, _>(self.store.as_ref(), &scope).await else {
            return Ok(());
        };
        if let Some(offset) = general.rule_id_offset.take() {
            save_item(self.store.as_ref(), &scope, &general).await?;
            log::info!("Released rule offset {offset} from {origin}");
        }
        Ok(())
    }

    /// Move every site sharing an offset with an earlier site (in origin
    /// order) onto a fresh offset. Returns the sites that moved.
    pub async fn repair_collisions(&self) -> Result<Vec<Origin>, SyncError> {
        let _guard = self.lock.lock().await;

        let holders = offset_holders(self.store.as_ref()).await?;
        let mut taken: BTreeSet<u32> = holders.keys().copied().collect();
        let mut moved = Vec::new();

        for (offset, origins) in holders {
            for origin in origins.into_iter().skip(1) {
                let fresh = (0..SITE_OFFSET_SPACE)
                    .find(|o| !taken.contains(o))
                    .ok_or(SyncError::OffsetSpaceExhausted)?;
                taken.insert(fresh);

                let scope = Scope::Site(origin.clone());
                let mut general = self.site_general(&origin).await;
                general.rule_id_offset = Some(fresh);
                save_item(self.store.as_ref(), &scope, &general).await?;

                log::warn!("Moved {origin} from colliding rule offset {offset} to {fresh}");
                moved.push(origin);
            }
        }
        Ok(moved)
    }
}
