//! Current pointer, flags and reorg transitions of one subscriber.
//!
//! [`SyncState`] is the synchronous core the engine wraps in a mutex. It holds
//! the snapshot history, the current `(snapshot, block)` pointer and the
//! `invalid`/`inactive` flags, and implements the rollback, restart and
//! freshness rules. Nothing here talks to the cache, the scheduler or the
//! protocol, so every transition is testable without a runtime.
//!
//! ## Reorg semantics
//!
//! - `rollback(b)` while **invalid**: drop everything newer than `b` and rewind
//!   to the newest remaining checkpoint (or to no snapshot at all)
//! - `rollback(b)` while **valid**: the current snapshot is trusted; only
//!   checkpoints newer than `b` that are not the current one are dropped
//! - `restart(b)`: drop checkpoints older than `b`; the current snapshot has
//!   to go too if it is older than `b`
//!
//! Both only prune history. The pointer move they call for is returned as a
//! [`Rewind`] and performed by the engine's write path, so rewound snapshots
//! are published and a slave can answer a null with a cache refresh.

use std::sync::Arc;
use tracing::{debug, info};

use crate::history::StateHistory;

/// Pointer move requested by [`SyncState::rollback`] or [`SyncState::restart`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewind<S> {
    /// The current pointer stays where it is.
    Keep,
    /// Re-establish `state` as current at `block`.
    To {
        /// Checkpoint block
        block: u64,
        /// Checkpoint snapshot
        state: Arc<S>,
    },
    /// No snapshot is left; move the pointer to `block` without one.
    Clear {
        /// New pointer block
        block: u64,
    },
}

/// Snapshot history plus current pointer and flags.
#[derive(Debug, Clone)]
pub struct SyncState<S> {
    history: StateHistory<S>,
    current: Option<Arc<S>>,
    block_number: u64,
    invalid: bool,
    inactive: bool,
}

impl<S> SyncState<S> {
    /// Create an uninitialized state retaining `retention_window` blocks of history.
    #[must_use]
    pub const fn new(retention_window: u64) -> Self {
        Self {
            history: StateHistory::new(retention_window),
            current: None,
            block_number: 0,
            invalid: false,
            inactive: false,
        }
    }

    /// Current snapshot regardless of freshness or validity.
    #[must_use]
    pub fn current(&self) -> Option<Arc<S>> {
        self.current.clone()
    }

    /// Whether a current snapshot is held.
    #[must_use]
    pub const fn has_state(&self) -> bool {
        self.current.is_some()
    }

    /// Block number of the current pointer.
    #[must_use]
    pub const fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Whether the current snapshot may be stale relative to the canonical chain.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Whether the subscriber is dormant.
    #[must_use]
    pub const fn is_inactive(&self) -> bool {
        self.inactive
    }

    /// Snapshot history.
    #[must_use]
    pub const fn history(&self) -> &StateHistory<S> {
        &self.history
    }

    /// Move the current pointer.
    ///
    /// A non-null snapshot is also recorded in history at `block`, the history
    /// is pruned relative to `block`, and the invalid flag is cleared because
    /// the snapshot was freshly established.
    pub fn apply(&mut self, state: Option<Arc<S>>, block: u64) {
        if let Some(ref snapshot) = state {
            self.history.insert(block, Arc::clone(snapshot));
            self.history.prune(block);
            self.invalid = false;
        }
        self.current = state;
        self.block_number = block;
    }

    /// Record a checkpoint for a block that is not the newest one.
    pub fn record_checkpoint(&mut self, block: u64, state: Arc<S>) {
        self.history.insert(block, state);
    }

    /// Mark the current snapshot as untrusted until the next rollback or update.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    /// Clear the invalid flag.
    pub fn validate(&mut self) {
        self.invalid = false;
    }

    /// Put the subscriber to sleep. There is no way back.
    pub fn inactivate(&mut self) {
        self.inactive = true;
    }

    /// Prune history for a reorganization at `block`.
    ///
    /// While invalid, everything newer than `block` goes and the newest
    /// remaining checkpoint is requested as current. While valid, only other
    /// checkpoints newer than `block` go.
    pub fn rollback(&mut self, block: u64) -> Rewind<S> {
        if !self.invalid {
            let keep = self.current.as_ref().map(|_| self.block_number);
            let removed = self.history.remove_above(block, keep);
            debug!(to = block, removed, kept = ?keep, "Pruned history newer than rollback point");
            return Rewind::Keep;
        }

        let removed = self.history.remove_above(block, None);
        match self.history.latest_at_or_before(block) {
            Some((checkpoint, state)) => {
                info!(
                    to = block,
                    checkpoint,
                    removed,
                    "Rolling back invalid state to checkpoint"
                );
                Rewind::To {
                    block: checkpoint,
                    state,
                }
            }
            None => {
                info!(to = block, removed, "Rolling back invalid state, no checkpoint left");
                Rewind::Clear { block }
            }
        }
    }

    /// Slide the history window forward to `block`.
    ///
    /// Requests a clear when a current snapshot exists and is older than `block`.
    pub fn restart(&mut self, block: u64) -> Rewind<S> {
        let removed = self.history.remove_below(block);
        let stale = self.current.is_some() && self.block_number < block;
        info!(from = block, removed, stale_current = stale, "Restarted state history");
        if stale {
            Rewind::Clear { block }
        } else {
            Rewind::Keep
        }
    }

    /// Current snapshot if it is valid and fresh enough.
    ///
    /// `tracking` means the subscriber is considered always fresh.
    #[must_use]
    pub fn fresh_state(&self, min_block_number: u64, tracking: bool) -> Option<Arc<S>> {
        if self.invalid {
            return None;
        }
        if tracking || self.block_number >= min_block_number {
            self.current.clone()
        } else {
            None
        }
    }
}
