//! Log batch partitioning and validation.
//!
//! The delivery service hands the engine a flat list of logs plus the headers
//! of the blocks they belong to. Before folding, the engine splits the list
//! into runs of consecutive logs sharing a block number and checks that:
//!
//! - positions `(block_number, log_index)` never decrease
//! - every run has a header
//! - every log carries a block number
//!
//! What happens on a violation depends on the [`BatchPolicy`].

use alloy::rpc::types::Log;
use std::fmt;

use crate::types::{log_position, BlockHeaders};

/// Reaction to ordering and header violations in a log batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Log each violation and keep processing the batch.
    #[default]
    Lenient,
    /// Reject the whole batch before anything is applied.
    Strict,
}

/// A problem found in a log batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchViolation {
    /// A log is positioned before its predecessor.
    OutOfOrder {
        /// `(block_number, log_index)` of the preceding log
        previous: (u64, u64),
        /// `(block_number, log_index)` of the offending log
        found: (u64, u64),
    },
    /// No header was supplied for a block that has logs.
    MissingHeader {
        /// Block number without header
        block_number: u64,
    },
    /// A log has no block number at all.
    MissingBlockNumber {
        /// Position of the log in the batch
        position: usize,
    },
}

impl fmt::Display for BatchViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder { previous, found } => write!(
                f,
                "log ({}, {}) delivered after ({}, {})",
                found.0, found.1, previous.0, previous.1
            ),
            Self::MissingHeader { block_number } => {
                write!(f, "missing block header for block {block_number}")
            }
            Self::MissingBlockNumber { position } => {
                write!(f, "log at batch position {position} has no block number")
            }
        }
    }
}

/// Consecutive logs of one block.
#[derive(Debug, Clone, Copy)]
pub struct LogRun<'a> {
    /// Block the logs belong to
    pub block_number: u64,
    /// Logs in delivery order
    pub logs: &'a [Log],
}

/// Split `logs` into maximal runs of consecutive logs sharing a block number.
///
/// Logs without a block number end the current run and are left out.
#[must_use]
pub fn partition_runs(logs: &[Log]) -> Vec<LogRun<'_>> {
    let mut runs = Vec::new();
    let mut start = 0;

    while start < logs.len() {
        let Some(block_number) = logs[start].block_number else {
            start += 1;
            continue;
        };

        let mut end = start + 1;
        while end < logs.len() && logs[end].block_number == Some(block_number) {
            end += 1;
        }

        runs.push(LogRun {
            block_number,
            logs: &logs[start..end],
        });
        start = end;
    }

    runs
}

/// Collect every ordering and header violation in a batch.
#[must_use]
pub fn validate_batch(logs: &[Log], headers: &BlockHeaders) -> Vec<BatchViolation> {
    let mut violations = Vec::new();
    let mut previous: Option<(u64, u64)> = None;

    for (position, log) in logs.iter().enumerate() {
        let Some(found) = log_position(log) else {
            violations.push(BatchViolation::MissingBlockNumber { position });
            continue;
        };

        if let Some(prev) = previous {
            if found < prev {
                violations.push(BatchViolation::OutOfOrder {
                    previous: prev,
                    found,
                });
            }
        }
        previous = Some(found);
    }

    for run in partition_runs(logs) {
        let already_reported = violations.iter().any(|v| {
            matches!(v, BatchViolation::MissingHeader { block_number } if *block_number == run.block_number)
        });
        if !headers.contains_key(&run.block_number) && !already_reported {
            violations.push(BatchViolation::MissingHeader {
                block_number: run.block_number,
            });
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockHeader;
    use alloy::primitives::B256;

    fn log_at(block: u64, index: u64) -> Log {
        Log {
            block_number: Some(block),
            log_index: Some(index),
            ..Default::default()
        }
    }

    fn headers_for(blocks: &[u64]) -> BlockHeaders {
        blocks
            .iter()
            .map(|b| (*b, BlockHeader::new(*b, B256::ZERO, B256::ZERO, 0)))
            .collect()
    }

    #[test]
    fn test_partition_groups_consecutive_blocks() {
        let logs = vec![
            log_at(101, 0),
            log_at(101, 1),
            log_at(101, 2),
            log_at(103, 0),
            log_at(103, 1),
        ];

        let runs = partition_runs(&logs);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].block_number, 101);
        assert_eq!(runs[0].logs.len(), 3);
        assert_eq!(runs[1].block_number, 103);
        assert_eq!(runs[1].logs.len(), 2);
    }

    #[test]
    fn test_partition_skips_pending_logs() {
        let logs = vec![log_at(5, 0), Log::default(), log_at(5, 1)];

        let runs = partition_runs(&logs);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.block_number == 5));
    }

    #[test]
    fn test_validate_clean_batch() {
        let logs = vec![log_at(101, 0), log_at(101, 1), log_at(103, 0)];
        assert!(validate_batch(&logs, &headers_for(&[101, 103])).is_empty());
    }

    #[test]
    fn test_validate_reports_out_of_order_blocks() {
        let logs = vec![log_at(103, 0), log_at(101, 0)];
        let violations = validate_batch(&logs, &headers_for(&[101, 103]));

        assert_eq!(
            violations,
            vec![BatchViolation::OutOfOrder {
                previous: (103, 0),
                found: (101, 0),
            }]
        );
    }

    #[test]
    fn test_validate_reports_out_of_order_log_index() {
        let logs = vec![log_at(101, 3), log_at(101, 1)];
        let violations = validate_batch(&logs, &headers_for(&[101]));
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_validate_reports_missing_header_once() {
        let logs = vec![log_at(101, 0), log_at(102, 0), log_at(101, 5)];
        let violations = validate_batch(&logs, &headers_for(&[102]));

        let missing: Vec<_> = violations
            .iter()
            .filter(|v| matches!(v, BatchViolation::MissingHeader { .. }))
            .collect();
        assert_eq!(missing.len(), 1);
    }

    #[test]
    fn test_violation_display() {
        let v = BatchViolation::MissingHeader { block_number: 7 };
        assert_eq!(v.to_string(), "missing block header for block 7");
    }
}
