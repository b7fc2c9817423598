//! Toy protocol whose snapshot counts the logs emitted by one address.
//!
//! Drives the offline `simulate` command and the engine tests: every log from
//! the watched address bumps the counter by one, every other log is ignored.

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{SyncError, SyncResult};
use crate::sync::Protocol;
use crate::types::BlockHeader;

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Logs seen so far
    pub count: u64,
}

/// Counts logs of one address.
#[derive(Debug)]
pub struct CounterPool {
    address: Address,
    initial: u64,
    failures_left: AtomicU32,
    generations: AtomicU64,
}

impl CounterPool {
    /// Watch `address`, generating `{count: 0}`.
    #[must_use]
    pub const fn new(address: Address) -> Self {
        Self {
            address,
            initial: 0,
            failures_left: AtomicU32::new(0),
            generations: AtomicU64::new(0),
        }
    }

    /// Generate `{count: initial}` instead.
    #[must_use]
    pub const fn with_initial(mut self, initial: u64) -> Self {
        self.initial = initial;
        self
    }

    /// Fail the next `failures` generations, simulating an unreachable node.
    #[must_use]
    pub fn failing(self, failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            ..self
        }
    }

    /// Number of `generate_state` calls, failed ones included.
    #[must_use]
    pub fn generations(&self) -> u64 {
        self.generations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Protocol for CounterPool {
    type State = Counter;

    fn addresses_subscribed(&self) -> Vec<Address> {
        vec![self.address]
    }

    async fn generate_state(&self, block_number: u64) -> SyncResult<Counter> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::generation(
                format!("Counter source unavailable at block {block_number}"),
                None,
            ));
        }
        Ok(Counter {
            count: self.initial,
        })
    }

    fn process_log(
        &self,
        state: &Counter,
        log: &Log,
        _header: Option<&BlockHeader>,
    ) -> SyncResult<Option<Counter>> {
        if log.address() != self.address {
            return Ok(None);
        }
        Ok(Some(Counter {
            count: state.count + 1,
        }))
    }

    fn pool_identifier_data(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "kind": "counter", "address": self.address }))
    }
}
