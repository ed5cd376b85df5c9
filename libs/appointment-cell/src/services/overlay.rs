use std::collections::{BTreeMap, HashSet};

use shared_models::{PendingRequest, StatusMap};

#[derive(Debug, Clone)]
struct OverlayEntry {
    pending: PendingRequest,
    generation: u64,
}

/// Optimistic pending entries written locally after a successful submit,
/// layered over the last reconciled map until a reconciliation pass that
/// started after the insert has completed.
#[derive(Debug, Clone, Default)]
pub struct PendingOverlay {
    generation: u64,
    entries: BTreeMap<String, OverlayEntry>,
}

impl PendingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the newest entry. A pass records this before querying.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn insert(&mut self, counterparty_id: &str, pending: PendingRequest) -> u64 {
        self.generation += 1;
        self.entries.insert(
            counterparty_id.to_string(),
            OverlayEntry {
                pending,
                generation: self.generation,
            },
        );
        self.generation
    }

    /// Drops entries inserted at or before `mark`. Entries inserted while the
    /// pass was running survive it.
    pub fn retire_through(&mut self, mark: u64) {
        self.entries.retain(|_, entry| entry.generation > mark);
    }

    /// Drops entries whose request document is already visible to the store
    /// listener, the reconciled map accounts for them from here on.
    pub fn retire_seen(&mut self, seen_request_ids: &HashSet<String>) {
        self.entries
            .retain(|_, entry| !seen_request_ids.contains(&entry.pending.request_id));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `reconciled` with every overlay entry applied on top.
    pub fn apply(&self, reconciled: &StatusMap) -> StatusMap {
        let mut merged = reconciled.clone();
        for (counterparty_id, entry) in &self.entries {
            merged.set_pending(counterparty_id, entry.pending.clone());
        }
        merged
    }
}
