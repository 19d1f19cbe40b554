//! Settings store seam
//!
//! The host owns durable storage. This module defines the interface the core
//! consumes, typed load/save helpers that validate every value, and an
//! in-memory implementation used by tests and host-less embeddings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::settings::{Scope, SettingsItem, SettingsKey, SettingsKind};
use crate::url::Origin;

/// Notification that a key's value changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
}

/// Durable key/value storage with change notification.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Every key currently holding a value.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Subscribe to change notifications. Dropping the receiver unsubscribes.
    fn watch(&self) -> broadcast::Receiver<StoreChange>;
}

// =============================================================================
// Typed Access
// =============================================================================

/// Load an item, falling back to its default when missing or invalid.
pub async fn load_item<T, S>(store: &S, scope: &Scope) -> T
where
    T: SettingsItem,
    S: SettingsStore + ?Sized,
{
    load_stored_item(store, scope).await.unwrap_or_default()
}

/// Load an item only if a valid value is stored.
pub async fn load_stored_item<T, S>(store: &S, scope: &Scope) -> Option<T>
where
    T: SettingsItem,
    S: SettingsStore + ?Sized,
{
    let key = SettingsKey {
        kind: T::KIND,
        scope: scope.clone(),
    }
    .to_string();

    let raw = match store.get(&key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("Failed to read '{key}', using default: {e}");
            return None;
        }
    };

    let item: T = match serde_json::from_value(raw) {
        Ok(item) => item,
        Err(e) => {
            log::warn!("Malformed value for '{key}', using default: {e}");
            return None;
        }
    };

    match item.validate() {
        Ok(()) => Some(item),
        Err(e) => {
            log::warn!("Invalid value for '{key}', using default: {e}");
            None
        }
    }
}

/// Load a site-scoped item, inheriting the global value when the site has
/// none of its own.
pub async fn load_site_item<T, S>(store: &S, origin: &Origin) -> T
where
    T: SettingsItem,
    S: SettingsStore + ?Sized,
{
    match load_stored_item(store, &Scope::Site(origin.clone())).await {
        Some(item) => item,
        None => load_item(store, &Scope::Global).await,
    }
}

/// Validate and persist an item.
pub async fn save_item<T, S>(store: &S, scope: &Scope, item: &T) -> Result<(), StoreError>
where
    T: SettingsItem,
    S: SettingsStore + ?Sized,
{
    let key = SettingsKey {
        kind: T::KIND,
        scope: scope.clone(),
    }
    .to_string();

    item.validate().map_err(|e| StoreError::InvalidValue {
        key: key.clone(),
        reason: e.0,
    })?;

    let value = serde_json::to_value(item)?;
    store.set(&key, value).await
}

/// Origins that have at least one site-scoped value of the given kinds.
pub async fn site_origins<S>(store: &S, kinds: &[SettingsKind]) -> Result<BTreeSet<Origin>, StoreError>
where
    S: SettingsStore + ?Sized,
{
    let keys = store.keys().await?;
    Ok(keys
        .iter()
        .filter_map(|key| SettingsKey::parse(key))
        .filter(|key| kinds.contains(&key.kind))
        .filter_map(|key| match key.scope {
            Scope::Site(origin) => Some(origin),
            Scope::Global => None,
        })
        .collect())
}

// =============================================================================
// In-Memory Store
// =============================================================================

const WATCH_CAPACITY: usize = 256;

/// Store backed by a map in memory. Writes that do not change a value do not
/// notify watchers.
pub struct MemoryStore {
    values: RwLock<BTreeMap<String, Value>>,
    changes: broadcast::Sender<StoreChange>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_watch_capacity(WATCH_CAPACITY)
    }

    /// Store whose watchers lag after `capacity` unread changes.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            values: RwLock::new(BTreeMap::new()),
            changes,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock_error() -> StoreError {
        StoreError::Backend("memory store lock poisoned".to_string())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let values = self.values.read().map_err(|_| Self::lock_error())?;
        Ok(values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("write to '{key}' rejected")));
        }

        let changed = {
            let mut values = self.values.write().map_err(|_| Self::lock_error())?;
            match values.get(key) {
                Some(existing) if *existing == value => false,
                _ => {
                    values.insert(key.to_string(), value);
                    true
                }
            }
        };

        if changed {
            // No receivers is not an error.
            let _ = self.changes.send(StoreChange {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let values = self.values.read().map_err(|_| Self::lock_error())?;
        Ok(values.keys().cloned().collect())
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
