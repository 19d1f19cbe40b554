//! DataSaver Rule Compiler and Synchronizer
//!
//! This crate turns stored settings into declarative interception rules and
//! keeps the host engine's installed set equal to them.
//!
//! # Modules
//!
//! - `redirect`: Redirect target templates for compression endpoints
//! - `builder`: Per-capability rule builders and the rule-ID layout
//! - `snapshot`: Point-in-time settings view
//! - `plan`: Desired rule sets and diffs against the engine
//! - `allocator`: Per-site rule-ID offsets
//! - `engine`: Interception engine seam
//! - `synchronizer`: Serialized reconciliation and store watchers

pub mod allocator;
pub mod builder;
pub mod engine;
pub mod error;
pub mod plan;
pub mod redirect;
pub mod snapshot;
pub mod synchronizer;

pub use allocator::{find_available_offset, OffsetAllocator};
pub use builder::{Capability, RuleScope, ScopeSettings};
pub use engine::{InterceptionEngine, MemoryEngine};
pub use error::{EngineError, SyncError};
pub use plan::{default_rules, plan_group, GroupPlan, RuleDiff};
pub use snapshot::{SettingsSnapshot, SiteSettings};
pub use synchronizer::{groups_for_key, GroupState, PassReport, RuleSynchronizer, SyncHandle};
