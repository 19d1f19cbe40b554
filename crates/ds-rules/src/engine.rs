//! Interception engine seam
//!
//! The host's declarative request-interception engine is the only consumer of
//! compiled rules. Everything here talks to it through `InterceptionEngine`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ds_core::{Rule, RuleUpdate};

use crate::error::EngineError;

/// Atomic add/remove of declarative rules.
#[async_trait]
pub trait InterceptionEngine: Send + Sync {
    /// Apply one update. Removals are processed before additions.
    async fn update_rules(&self, update: RuleUpdate) -> Result<(), EngineError>;

    /// Every rule currently installed.
    async fn get_rules(&self) -> Result<Vec<Rule>, EngineError>;
}

// =============================================================================
// In-Memory Engine
// =============================================================================

/// Engine backed by a map in memory.
///
/// Records every update it receives and counts updates that touched a rule ID
/// while another in-flight update was touching the same ID.
pub struct MemoryEngine {
    rules: Mutex<BTreeMap<u32, Rule>>,
    history: Mutex<Vec<RuleUpdate>>,
    in_flight: Mutex<BTreeSet<u32>>,
    overlaps: AtomicUsize,
    fail_updates: AtomicBool,
    rule_limit: usize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Engine that rejects updates leaving more than `rule_limit` rules.
    pub fn with_limit(rule_limit: usize) -> Self {
        Self {
            rules: Mutex::new(BTreeMap::new()),
            history: Mutex::new(Vec::new()),
            in_flight: Mutex::new(BTreeSet::new()),
            overlaps: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
            rule_limit,
        }
    }

    /// Make every subsequent update fail.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Installed rules keyed by ID.
    pub fn installed(&self) -> BTreeMap<u32, Rule> {
        self.rules.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn rule(&self, id: u32) -> Option<Rule> {
        self.rules.lock().ok().and_then(|r| r.get(&id).cloned())
    }

    /// Every update received, successful or not, in arrival order.
    pub fn history(&self) -> Vec<RuleUpdate> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    /// Number of updates that overlapped another in-flight update on a
    /// shared rule ID.
    pub fn overlapping_updates(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn unavailable() -> EngineError {
        EngineError::Unavailable("memory engine lock poisoned".to_string())
    }

    fn apply(&self, update: &RuleUpdate) -> Result<(), EngineError> {
        let mut rules = self.rules.lock().map_err(|_| Self::unavailable())?;
        let mut next = rules.clone();

        for id in &update.remove_rule_ids {
            next.remove(id);
        }
        for rule in &update.add_rules {
            if rule.id == 0 {
                return Err(EngineError::InvalidRule {
                    id: 0,
                    reason: "rule IDs start at 1".to_string(),
                });
            }
            if next.insert(rule.id, rule.clone()).is_some() {
                return Err(EngineError::InvalidRule {
                    id: rule.id,
                    reason: "duplicate rule ID".to_string(),
                });
            }
        }
        if next.len() > self.rule_limit {
            return Err(EngineError::QuotaExceeded {
                requested: next.len(),
                limit: self.rule_limit,
            });
        }

        *rules = next;
        Ok(())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterceptionEngine for MemoryEngine {
    async fn update_rules(&self, update: RuleUpdate) -> Result<(), EngineError> {
        if let Ok(mut history) = self.history.lock() {
            history.push(update.clone());
        }

        let touched: BTreeSet<u32> = update.touched_ids().collect();
        {
            let mut in_flight = self.in_flight.lock().map_err(|_| Self::unavailable())?;
            if touched.iter().any(|id| in_flight.contains(id)) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            in_flight.extend(touched.iter().copied());
        }

        // Give concurrent callers a chance to interleave, like a real engine
        // round-trip would.
        tokio::task::yield_now().await;

        let result = if self.fail_updates.load(Ordering::SeqCst) {
            Err(EngineError::Unavailable("updates disabled".to_string()))
        } else {
            self.apply(&update)
        };

        if let Ok(mut in_flight) = self.in_flight.lock() {
            for id in &touched {
                in_flight.remove(id);
            }
        }
        result
    }

    async fn get_rules(&self) -> Result<Vec<Rule>, EngineError> {
        let rules = self.rules.lock().map_err(|_| Self::unavailable())?;
        Ok(rules.values().cloned().collect())
    }
}
