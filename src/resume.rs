//! Skip-or-process decisions
//!
//! A `completed` record is the only proof of work. `running` left behind by
//! a crash and `failed` from an earlier run both mean "process again".

use crate::progress::ProgressStore;
use crate::types::ProgressKey;
use std::sync::Arc;

/// What to do with a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Already completed; no side effects
    Skip,
    /// Absent, running, failed, or force-reprocess is on
    Process,
}

/// Resume decisions derived from persisted completion state
#[derive(Debug, Clone)]
pub struct ResumeGate {
    store: Arc<ProgressStore>,
}

impl ResumeGate {
    /// Create a gate over a store
    pub fn new(store: Arc<ProgressStore>) -> Self {
        Self { store }
    }

    /// Decide for one key
    pub fn decide(&self, key: &ProgressKey) -> Decision {
        if self.store.is_completed(key) && !self.store.force_reprocess() {
            Decision::Skip
        } else {
            Decision::Process
        }
    }

    /// Split items into (skipped, pending) by their keys
    pub fn partition<T>(&self, items: Vec<(ProgressKey, T)>) -> (Vec<(ProgressKey, T)>, Vec<(ProgressKey, T)>) {
        items
            .into_iter()
            .partition(|(key, _)| self.decide(key) == Decision::Skip)
    }
}
