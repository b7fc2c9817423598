//! The capability set a venue adapter supplies to the engine.
//!
//! An adapter defines its snapshot type and two functions: how to build a
//! snapshot from scratch at a block, and how one log changes a snapshot. The
//! engine owns everything else (history, reorgs, caching, retries).
//!
//! ## Example
//!
//! ```
//! use alloy::primitives::Address;
//! use alloy::rpc::types::Log;
//! use async_trait::async_trait;
//! use dex_state_sync::error::SyncResult;
//! use dex_state_sync::sync::Protocol;
//! use dex_state_sync::types::BlockHeader;
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Protocol for Counter {
//!     type State = u64;
//!
//!     fn addresses_subscribed(&self) -> Vec<Address> {
//!         vec![Address::ZERO]
//!     }
//!
//!     async fn generate_state(&self, _block_number: u64) -> SyncResult<u64> {
//!         Ok(0)
//!     }
//!
//!     fn process_log(
//!         &self,
//!         state: &u64,
//!         _log: &Log,
//!         _header: Option<&BlockHeader>,
//!     ) -> SyncResult<Option<u64>> {
//!         Ok(Some(state + 1))
//!     }
//! }
//! ```

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use async_trait::async_trait;

use crate::error::SyncResult;
use crate::types::{BlockHeader, Snapshot};

/// Protocol-specific behaviour plugged into a [`StateSubscriber`].
///
/// [`StateSubscriber`]: crate::sync::StateSubscriber
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Immutable snapshot of the venue as of one block.
    type State: Snapshot;

    /// Contract addresses whose logs drive this subscriber.
    fn addresses_subscribed(&self) -> Vec<Address>;

    /// Build a snapshot from scratch as of `block_number`.
    ///
    /// Must not depend on any previously held snapshot. This is the only
    /// suspension point inside the engine's own methods.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote reads fail; the engine keeps its
    /// current state and the caller or the self-heal job retries.
    async fn generate_state(&self, block_number: u64) -> SyncResult<Self::State>;

    /// Apply one log to `state`.
    ///
    /// Returns `Ok(None)` when the log does not change the state. Recoverable
    /// decode problems should be reported that way too, because an error aborts
    /// the rest of the batch.
    ///
    /// # Errors
    ///
    /// Returns an error when the log cannot be applied at all.
    fn process_log(
        &self,
        state: &Self::State,
        log: &Log,
        header: Option<&BlockHeader>,
    ) -> SyncResult<Option<Self::State>>;

    /// Apply all logs of one block to `state`.
    ///
    /// The default threads the snapshot through [`Protocol::process_log`] in
    /// delivery order and returns the last changed snapshot, or `None` when no
    /// log changed anything. Adapters whose log groups must be applied
    /// atomically override this; the engine only relies on the `None` /
    /// `Some` contract.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Protocol::process_log`] error.
    fn process_block_logs(
        &self,
        state: &Self::State,
        logs: &[Log],
        header: Option<&BlockHeader>,
    ) -> SyncResult<Option<Self::State>> {
        let mut changed: Option<Self::State> = None;
        for log in logs {
            let base = changed.as_ref().unwrap_or(state);
            if let Some(next) = self.process_log(base, log, header)? {
                changed = Some(next);
            }
        }
        Ok(changed)
    }

    /// Whether the subscriber is under continuous active tracking.
    ///
    /// A tracking subscriber is considered fresh for any requested block.
    fn is_tracking(&self) -> bool {
        false
    }

    /// Identifier data included in discovery announcements.
    fn pool_identifier_data(&self) -> Option<serde_json::Value> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    /// Increments on logs from `Address::ZERO`, ignores others, fails on index 99.
    struct Selective;

    #[async_trait]
    impl Protocol for Selective {
        type State = u64;

        fn addresses_subscribed(&self) -> Vec<Address> {
            vec![Address::ZERO]
        }

        async fn generate_state(&self, _block_number: u64) -> SyncResult<u64> {
            Ok(0)
        }

        fn process_log(
            &self,
            state: &u64,
            log: &Log,
            _header: Option<&BlockHeader>,
        ) -> SyncResult<Option<u64>> {
            if log.log_index == Some(99) {
                return Err(SyncError::processing("poisoned log", None));
            }
            if log.address() == Address::ZERO {
                Ok(Some(state + 1))
            } else {
                Ok(None)
            }
        }
    }

    fn log_from(address: Address, index: u64) -> Log {
        let mut log = Log {
            block_number: Some(1),
            log_index: Some(index),
            ..Default::default()
        };
        log.inner.address = address;
        log
    }

    #[test]
    fn test_default_fold_threads_state() {
        let logs = vec![
            log_from(Address::ZERO, 0),
            log_from(Address::ZERO, 1),
            log_from(Address::ZERO, 2),
        ];
        let result = Selective.process_block_logs(&10, &logs, None);
        assert_eq!(result.ok().flatten(), Some(13));
    }

    #[test]
    fn test_default_fold_skips_unchanged_logs() {
        let other = Address::repeat_byte(0x11);
        let logs = vec![
            log_from(Address::ZERO, 0),
            log_from(other, 1),
            log_from(Address::ZERO, 2),
        ];
        let result = Selective.process_block_logs(&0, &logs, None);
        assert_eq!(result.ok().flatten(), Some(2));
    }

    #[test]
    fn test_default_fold_reports_no_change() {
        let logs = vec![log_from(Address::repeat_byte(0x11), 0)];
        let result = Selective.process_block_logs(&5, &logs, None);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_default_fold_propagates_errors() {
        let logs = vec![log_from(Address::ZERO, 0), log_from(Address::ZERO, 99)];
        let result = Selective.process_block_logs(&0, &logs, None);
        assert!(matches!(result, Err(SyncError::ProcessingError { .. })));
    }
}
