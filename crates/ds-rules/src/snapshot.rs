//! Point-in-time view of every setting that shapes rules.

use std::collections::BTreeMap;

use ds_core::settings::{Scope, SettingsKind};
use ds_core::store::{load_item, load_site_item, load_stored_item, site_origins};
use ds_core::{GeneralSettings, Origin, SettingsStore, StoreError};

use crate::builder::ScopeSettings;

const RULE_KINDS: [SettingsKind; 4] = [
    SettingsKind::General,
    SettingsKind::Compression,
    SettingsKind::Proxy,
    SettingsKind::BlockRules,
];

/// Settings of one site with stored overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSettings {
    pub origin: Origin,
    pub settings: ScopeSettings,
}

impl SiteSettings {
    pub fn offset(&self) -> Option<u32> {
        self.settings.general.rule_id_offset
    }
}

/// Global settings plus every site with stored overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub global: ScopeSettings,
    pub sites: Vec<SiteSettings>,
}

impl SettingsSnapshot {
    /// Read everything fresh from the store.
    pub async fn load<S: SettingsStore + ?Sized>(store: &S) -> Result<Self, StoreError> {
        let global = load_scope(store, None).await;
        let mut sites = Vec::new();
        for origin in site_origins(store, &RULE_KINDS).await? {
            let settings = load_scope(store, Some((&origin, &global.general))).await;
            sites.push(SiteSettings { origin, settings });
        }
        Ok(Self { global, sites })
    }

    pub fn site(&self, origin: &Origin) -> Option<&SiteSettings> {
        self.sites.iter().find(|s| &s.origin == origin)
    }

    /// Sites holding a private offset, in origin order.
    pub fn opted_out(&self) -> impl Iterator<Item = &SiteSettings> {
        self.sites.iter().filter(|s| s.offset().is_some())
    }

    /// Hosts the global rules must not apply to: every opted-out site.
    pub fn excluded_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.opted_out().map(|s| s.origin.host().to_string()).collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Opted-out sites that own their offset. When two sites claim the same
    /// offset, the first in origin order keeps it and the rest are reported
    /// separately.
    pub fn resolve_offsets(&self) -> (Vec<(&SiteSettings, u32)>, Vec<&SiteSettings>) {
        let mut owners: BTreeMap<u32, &SiteSettings> = BTreeMap::new();
        let mut conflicts = Vec::new();
        for site in self.opted_out() {
            let Some(offset) = site.offset() else { continue };
            if owners.contains_key(&offset) {
                conflicts.push(site);
            } else {
                owners.insert(offset, site);
            }
        }
        let mut winners: Vec<(&SiteSettings, u32)> = owners.into_iter().map(|(o, s)| (s, o)).collect();
        winners.sort_by(|a, b| a.0.origin.cmp(&b.0.origin));
        (winners, conflicts)
    }
}

async fn load_scope<S: SettingsStore + ?Sized>(store: &S, site: Option<(&Origin, &GeneralSettings)>) -> ScopeSettings {
    match site {
        None => ScopeSettings {
            general: load_item(store, &Scope::Global).await,
            compression: load_item(store, &Scope::Global).await,
            proxy: load_item(store, &Scope::Global).await,
            block: load_item(store, &Scope::Global).await,
        },
        Some((origin, global_general)) => {
            // A site without its own general settings behaves like the global
            // scope, but never inherits an offset.
            let general = match load_stored_item(store, &Scope::Site(origin.clone())).await {
                Some(general) => general,
                None => GeneralSettings {
                    rule_id_offset: None,
                    ..global_general.clone()
                },
            };
            ScopeSettings {
                general,
                compression: load_site_item(store, origin).await,
                proxy: load_site_item(store, origin).await,
                block: load_site_item(store, origin).await,
            }
        }
    }
}
