//! Sparse, block-indexed history of past snapshots.
//!
//! The history lets the engine fold a new block's logs onto the closest older
//! checkpoint instead of the current snapshot, which makes replays of already
//! applied blocks harmless and lets rollbacks rewind without regenerating.
//!
//! ## Invariants
//!
//! - At most one entry per block number (a later insert replaces the earlier one)
//! - Iteration is always in increasing block order
//! - Entries more than `retention_window` blocks behind the pruning anchor are
//!   dropped by [`StateHistory::prune`]
//!
//! ## Example
//!
//! ```
//! use dex_state_sync::history::StateHistory;
//! use std::sync::Arc;
//!
//! let mut history = StateHistory::new(1000);
//! history.insert(90, Arc::new("A"));
//! history.insert(95, Arc::new("B"));
//! history.insert(100, Arc::new("C"));
//!
//! let latest = history.latest_before(97).map(|(block, state)| (block, *state));
//! assert_eq!(latest, Some((95, "B")));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Block-number-keyed snapshot store bounded by a retention window.
#[derive(Debug, Clone)]
pub struct StateHistory<S> {
    entries: BTreeMap<u64, Arc<S>>,
    retention_window: u64,
}

impl<S> StateHistory<S> {
    /// Create an empty history retaining `retention_window` blocks.
    #[must_use]
    pub const fn new(retention_window: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            retention_window,
        }
    }

    /// Retention window in blocks.
    #[must_use]
    pub const fn retention_window(&self) -> u64 {
        self.retention_window
    }

    /// Store `state` as the checkpoint for `block`, replacing any existing entry.
    pub fn insert(&mut self, block: u64, state: Arc<S>) {
        self.entries.insert(block, state);
    }

    /// Checkpoint stored for exactly `block`.
    #[must_use]
    pub fn get(&self, block: u64) -> Option<&Arc<S>> {
        self.entries.get(&block)
    }

    /// Whether a checkpoint exists for `block`.
    #[must_use]
    pub fn contains(&self, block: u64) -> bool {
        self.entries.contains_key(&block)
    }

    /// Most recent checkpoint strictly older than `block`.
    #[must_use]
    pub fn latest_before(&self, block: u64) -> Option<(u64, Arc<S>)> {
        self.entries
            .range(..block)
            .next_back()
            .map(|(number, state)| (*number, Arc::clone(state)))
    }

    /// Most recent checkpoint at or before `block`.
    #[must_use]
    pub fn latest_at_or_before(&self, block: u64) -> Option<(u64, Arc<S>)> {
        self.entries
            .range(..=block)
            .next_back()
            .map(|(number, state)| (*number, Arc::clone(state)))
    }

    /// Drop entries older than `anchor - retention_window`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, anchor: u64) -> usize {
        let cutoff = anchor.saturating_sub(self.retention_window);
        self.remove_below(cutoff)
    }

    /// Drop every entry with a block number strictly below `block`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_below(&mut self, block: u64) -> usize {
        let kept = self.entries.split_off(&block);
        let removed = self.entries.len();
        self.entries = kept;
        if removed > 0 {
            debug!(removed, below = block, "Pruned state history");
        }
        removed
    }

    /// Drop every entry with a block number strictly above `block`, except `keep`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_above(&mut self, block: u64, keep: Option<u64>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|number, _| *number <= block || Some(*number) == keep);
        before - self.entries.len()
    }

    /// Block numbers currently held, in increasing order.
    #[must_use]
    pub fn blocks(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Iterate checkpoints in increasing block order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Arc<S>)> {
        self.entries.iter().map(|(number, state)| (*number, state))
    }

    /// Number of checkpoints held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
