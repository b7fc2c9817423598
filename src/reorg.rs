//! Chain reorganization detection for drivers that deliver logs themselves.
//!
//! The engine never looks at block hashes; it only reacts to `invalidate`,
//! `rollback` and `restart`. [`ChainTracker`] is the piece that decides when
//! to call them: it keeps the headers of the recent canonical blocks and checks
//! that every new head links to them through its parent hash.
//!
//! ## Algorithm
//!
//! 1. A header whose parent is the tracked tip extends the chain.
//! 2. A header whose parent is an older tracked block replaces everything
//!    after that block: a reorg with a known fork point.
//! 3. A header linking to nothing tracked needs the canonical headers of the
//!    tracked range; [`ChainTracker::fork_point_against`] finds the newest
//!    block both sides agree on.
//!
//! ```text
//! tracked:   100 ── 101 ── 102 ── 103
//!                    │
//! new head:          └──── 102' ──> Reorg { fork_point: 101, depth: 2 }
//! ```

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::types::{BlockHeader, BlockHeaders};

/// Default number of recent headers kept for linkage checks.
pub const DEFAULT_TRACKING_DEPTH: u64 = 128;

/// Outcome of observing one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    /// The header extends the tracked tip.
    Extended,
    /// The header is already tracked with the same hash.
    Known,
    /// The header replaced tracked blocks after `fork_point`.
    Reorg {
        /// Newest block still canonical
        fork_point: u64,
        /// Number of tracked blocks replaced
        depth: u64,
    },
    /// The header's parent is not tracked; resolve with canonical headers.
    Unlinked {
        /// The offending header
        number: u64,
    },
}

/// Keeps recent canonical headers and detects reorganizations.
#[derive(Debug, Clone)]
pub struct ChainTracker {
    headers: BTreeMap<u64, BlockHeader>,
    depth: u64,
    reorg_count: u64,
}

impl ChainTracker {
    /// Track at most `depth` recent headers.
    #[must_use]
    pub fn new(depth: u64) -> Self {
        Self {
            headers: BTreeMap::new(),
            depth: depth.max(1),
            reorg_count: 0,
        }
    }

    /// Newest tracked header.
    #[must_use]
    pub fn tip(&self) -> Option<&BlockHeader> {
        self.headers.values().next_back()
    }

    /// Oldest tracked block number.
    #[must_use]
    pub fn oldest(&self) -> Option<u64> {
        self.headers.keys().next().copied()
    }

    /// Reorgs seen so far.
    #[must_use]
    pub const fn reorg_count(&self) -> u64 {
        self.reorg_count
    }

    /// Tracked header at `number`.
    #[must_use]
    pub fn header(&self, number: u64) -> Option<&BlockHeader> {
        self.headers.get(&number)
    }

    /// Check `header` against the tracked chain and record it when it links.
    pub fn observe(&mut self, header: BlockHeader) -> ChainEvent {
        let Some(tip) = self.tip().copied() else {
            self.record(header);
            return ChainEvent::Extended;
        };

        if self
            .headers
            .get(&header.number)
            .is_some_and(|known| known.hash == header.hash)
        {
            return ChainEvent::Known;
        }

        let parent = header.number.checked_sub(1).and_then(|n| self.headers.get(&n));
        match parent {
            Some(parent) if parent.hash == header.parent_hash => {
                let parent_number = parent.number;
                if header.number == tip.number + 1 {
                    self.record(header);
                    return ChainEvent::Extended;
                }

                let depth = tip.number - parent_number;
                self.reorg_count += 1;
                warn!(
                    fork_point = parent_number,
                    depth,
                    new_hash = %header.hash,
                    "Reorg detected, tracked blocks replaced"
                );
                self.rewind(parent_number);
                self.record(header);
                ChainEvent::Reorg {
                    fork_point: parent_number,
                    depth,
                }
            }
            None if header.number > tip.number + 1 => {
                warn!(
                    tip = tip.number,
                    number = header.number,
                    "Header gap, linkage cannot be checked"
                );
                ChainEvent::Unlinked {
                    number: header.number,
                }
            }
            _ => {
                warn!(
                    number = header.number,
                    parent_hash = %header.parent_hash,
                    "Header does not link to tracked chain"
                );
                ChainEvent::Unlinked {
                    number: header.number,
                }
            }
        }
    }

    /// Newest tracked block whose hash matches `canonical`.
    ///
    /// `None` means no tracked block survived.
    #[must_use]
    pub fn fork_point_against(&self, canonical: &BlockHeaders) -> Option<u64> {
        self.headers
            .iter()
            .rev()
            .find(|(number, tracked)| {
                canonical
                    .get(number)
                    .is_some_and(|c| c.hash == tracked.hash)
            })
            .map(|(number, _)| *number)
    }

    /// Forget tracked blocks after `fork_point`.
    pub fn rewind(&mut self, fork_point: u64) {
        let dropped = self.headers.split_off(&(fork_point + 1)).len();
        debug!(fork_point, dropped, "Rewound tracked chain");
    }

    /// Forget everything, e.g. after skipping ahead.
    pub fn reset(&mut self) {
        self.headers.clear();
        info!("Chain tracker reset");
    }

    /// Count a reorg resolved outside [`ChainTracker::observe`].
    pub fn note_reorg(&mut self) {
        self.reorg_count += 1;
    }

    fn record(&mut self, header: BlockHeader) {
        let number = header.number;
        self.headers.insert(number, header);
        if let Some(floor) = number.checked_sub(self.depth) {
            self.headers = self.headers.split_off(&(floor + 1));
        }
    }
}

impl Default for ChainTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKING_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn hash(n: u64, fork: u8) -> B256 {
        let mut bytes = [fork; 32];
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        B256::from(bytes)
    }

    fn header(n: u64, fork: u8, parent_fork: u8) -> BlockHeader {
        BlockHeader::new(n, hash(n, fork), hash(n - 1, parent_fork), n * 12)
    }

    fn tracker_100_to_103() -> ChainTracker {
        let mut tracker = ChainTracker::new(16);
        for n in 100..=103 {
            tracker.observe(header(n, 0, 0));
        }
        tracker
    }

    #[test]
    fn test_linked_headers_extend() {
        let tracker = tracker_100_to_103();
        assert_eq!(tracker.tip().map(|h| h.number), Some(103));
        assert_eq!(tracker.oldest(), Some(100));
        assert_eq!(tracker.reorg_count(), 0);
    }

    #[test]
    fn test_known_header_is_ignored() {
        let mut tracker = tracker_100_to_103();
        assert_eq!(tracker.observe(header(102, 0, 0)), ChainEvent::Known);
        assert_eq!(tracker.tip().map(|h| h.number), Some(103));
    }

    #[test]
    fn test_sibling_header_is_reorg() {
        let mut tracker = tracker_100_to_103();

        let event = tracker.observe(header(102, 1, 0));
        assert_eq!(
            event,
            ChainEvent::Reorg {
                fork_point: 101,
                depth: 2
            }
        );
        assert_eq!(tracker.tip().map(|h| h.hash), Some(hash(102, 1)));
        assert!(tracker.header(103).is_none());
        assert_eq!(tracker.reorg_count(), 1);

        // The new branch extends normally afterwards.
        assert_eq!(tracker.observe(header(103, 1, 1)), ChainEvent::Extended);
    }

    #[test]
    fn test_unlinked_header_resolved_against_canonical() {
        let mut tracker = tracker_100_to_103();

        assert_eq!(
            tracker.observe(header(104, 2, 2)),
            ChainEvent::Unlinked { number: 104 }
        );

        let canonical: BlockHeaders = [
            (100, header(100, 0, 0)),
            (101, header(101, 0, 0)),
            (102, header(102, 2, 0)),
            (103, header(103, 2, 2)),
        ]
        .into_iter()
        .collect();
        assert_eq!(tracker.fork_point_against(&canonical), Some(101));

        tracker.rewind(101);
        assert_eq!(tracker.tip().map(|h| h.number), Some(101));
    }

    #[test]
    fn test_depth_bounds_tracked_headers() {
        let mut tracker = ChainTracker::new(3);
        for n in 100..=110 {
            tracker.observe(header(n, 0, 0));
        }
        assert_eq!(tracker.oldest(), Some(108));
    }
}
