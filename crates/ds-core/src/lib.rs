//! DataSaver Core Library
//!
//! Shared data model for the DataSaver bandwidth reducer: the settings tree
//! and its storage keys, the declarative rule model handed to the browser's
//! interception engine, and the statistics containers the telemetry pipeline
//! persists.
//!
//! # Modules
//!
//! - `config`: Rule-ID layout, priority tiers and telemetry tunables
//! - `error`: Store and validation errors
//! - `hash`: Murmur3 hashing and per-origin rule-ID derivation
//! - `rule`: Declarative rule model and rule updates
//! - `settings`: Settings items, scopes and storage keys
//! - `statistics`: Daily/aggregate statistics with retention eviction
//! - `store`: Settings store interface, typed access and an in-memory store
//! - `types`: Resource types, asset categories and capability groups
//! - `url`: URL splitting and origin normalization

pub mod config;
pub mod error;
pub mod hash;
pub mod rule;
pub mod settings;
pub mod statistics;
pub mod store;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use error::{StoreError, ValidationError};
pub use hash::derive_rule_ids;
pub use rule::{Rule, RuleAction, RuleCondition, RuleUpdate};
pub use settings::{
    BlockSettings, CompressionMode, CompressionSettings, GeneralSettings, ProxySettings, Scope,
    SettingsItem, SettingsKey, SettingsKind,
};
pub use statistics::{CombinedAssetStatistics, SingleAssetStatistics, Statistics};
pub use store::{MemoryStore, SettingsStore, StoreChange};
pub use types::{AssetCategory, Capabilities, ResourceType};
pub use url::Origin;
