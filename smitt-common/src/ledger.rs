//! Known-set ledgers
//!
//! A ledger records which units of work a stage has finished successfully.
//! The polling engine only asks two questions of it, so the backing store is
//! swappable: the in-memory ledger serves the single-instance watchers, and a
//! persistent implementation can be slotted in later without touching the
//! engine.
//!
//! Entries are only ever added. A key is marked done after the downstream
//! process reported success, never before.

use std::collections::HashSet;

/// Record of units already processed by one stage
pub trait Ledger: Send {
    /// Whether `key` has been marked done
    fn contains(&self, key: &str) -> bool;

    /// Mark `key` as done. Marking an existing key is a no-op.
    fn mark_done(&mut self, key: &str);

    /// Number of keys recorded
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-lifetime ledger; starts empty and is lost on restart
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    done: HashSet<String>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn contains(&self, key: &str) -> bool {
        self.done.contains(key)
    }

    fn mark_done(&mut self, key: &str) {
        if self.done.insert(key.to_string()) {
            tracing::debug!(key = %key, "Marked as processed");
        }
    }

    fn len(&self) -> usize {
        self.done.len()
    }
}
