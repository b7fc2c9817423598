//! Uniswap V2 pair reserves, synchronized from `Sync` events.
//!
//! Every swap, mint and burn on a pair ends with
//! `Sync(uint112 reserve0, uint112 reserve1)` carrying the post-operation
//! reserves, so the newest `Sync` log of a block fully determines the
//! snapshot. Generation therefore needs no contract calls: it scans back from
//! the requested block for the most recent `Sync` log of the pair.
//!
//! ## Example
//!
//! ```no_run
//! use dex_state_sync::pools::uniswap_v2::{UniswapV2Pool, UNISWAP_V2_WETH_USDT_PAIR};
//! use dex_state_sync::rpc::create_provider;
//! use dex_state_sync::sync::Protocol;
//!
//! # async fn example() -> dex_state_sync::error::SyncResult<()> {
//! let provider = create_provider("https://eth-mainnet.g.alchemy.com/v2/API_KEY").await?;
//! let pool = UniswapV2Pool::new(provider, UNISWAP_V2_WETH_USDT_PAIR, 5_000);
//! let reserves = pool.generate_state(19_000_000).await?;
//! println!("{} / {}", reserves.reserve0, reserves.reserve1);
//! # Ok(())
//! # }
//! ```

use alloy::primitives::{address, Address, Log as PrimitiveLog, U256};
use alloy::providers::Provider as _;
use alloy::rpc::types::{Filter, Log};
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::rpc::Provider;
use crate::sync::Protocol;
use crate::types::BlockHeader;

sol! {
    #[sol(rpc)]
    interface IUniswapV2Pair {
        /// Emitted after every swap, mint or burn with the new reserves.
        event Sync(uint112 reserve0, uint112 reserve1);
    }
}

pub use IUniswapV2Pair::Sync;

/// Canonical WETH/USDT pair on Ethereum mainnet.
pub const UNISWAP_V2_WETH_USDT_PAIR: Address = address!("0d4a11d5EEaaC28EC3F61d100daF4d40471f1852");

/// Reserves above 10^30 only come out of corrupted data.
const MAX_RESERVE_VALUE: u128 = 1_000_000_000_000_000_000_000_000_000_000;

/// Blocks per `eth_getLogs` request while scanning back.
const SCAN_CHUNK_BLOCKS: u64 = 1_000;

/// Pair reserves as of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    /// Reserve of token0
    pub reserve0: U256,
    /// Reserve of token1
    pub reserve1: U256,
}

impl Reserves {
    /// Validate and convert a decoded `Sync` event.
    ///
    /// # Errors
    ///
    /// Returns a processing error when a reserve exceeds the sanity bound.
    pub fn from_event(event: &Sync) -> SyncResult<Self> {
        let reserve0 = U256::from(event.reserve0);
        let reserve1 = U256::from(event.reserve1);

        let max = U256::from(MAX_RESERVE_VALUE);
        if reserve0 > max || reserve1 > max {
            return Err(SyncError::processing(
                format!("Reserves ({reserve0}, {reserve1}) exceed sanity bound {max}"),
                None,
            ));
        }

        Ok(Self { reserve0, reserve1 })
    }
}

/// Filter for `Sync` events of `pair` within `[from_block, to_block]`.
#[must_use]
pub fn sync_filter(pair: Address, from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .address(pair)
        .event_signature(Sync::SIGNATURE_HASH)
        .from_block(from_block)
        .to_block(to_block)
}

/// Decode a log as a `Sync` event.
///
/// # Errors
///
/// Returns a decoding error when the log is not a well-formed `Sync` event.
pub fn decode_sync(log: &Log) -> SyncResult<Sync> {
    let primitive_log = PrimitiveLog {
        address: log.address(),
        data: log.data().clone(),
    };

    Sync::decode_log(&primitive_log, true)
        .map(|decoded| decoded.data)
        .map_err(|e| SyncError::decoding(format!("Failed to decode Sync event: {e}"), None))
}

/// Protocol adapter for one Uniswap V2 pair.
pub struct UniswapV2Pool {
    provider: Provider,
    address: Address,
    lookback_blocks: u64,
}

impl UniswapV2Pool {
    /// Track `address`, scanning at most `lookback_blocks` back on generation.
    #[must_use]
    pub const fn new(provider: Provider, address: Address, lookback_blocks: u64) -> Self {
        Self {
            provider,
            address,
            lookback_blocks,
        }
    }

    /// Pair address.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Fetch the pair's `Sync` logs within `[from_block, to_block]`.
    ///
    /// # Errors
    ///
    /// Returns an RPC error when the request fails.
    pub async fn fetch_sync_logs(&self, from_block: u64, to_block: u64) -> SyncResult<Vec<Log>> {
        let filter = sync_filter(self.address, from_block, to_block);
        let logs = self.provider.get_logs(&filter).await.map_err(|e| {
            SyncError::rpc(
                format!("Failed to fetch Sync events for {from_block}..={to_block}"),
                Some(Box::new(e)),
            )
        })?;
        debug!(from_block, to_block, logs = logs.len(), "Fetched Sync logs");
        Ok(logs)
    }
}

#[async_trait]
impl Protocol for UniswapV2Pool {
    type State = Reserves;

    fn addresses_subscribed(&self) -> Vec<Address> {
        vec![self.address]
    }

    async fn generate_state(&self, block_number: u64) -> SyncResult<Reserves> {
        let start = Instant::now();
        let floor = block_number.saturating_sub(self.lookback_blocks);
        let mut to_block = block_number;

        loop {
            let from_block = to_block.saturating_sub(SCAN_CHUNK_BLOCKS - 1).max(floor);
            let logs = self
                .fetch_sync_logs(from_block, to_block)
                .await
                .map_err(|e| SyncError::generation(format!("Reserve scan failed: {e}"), Some(Box::new(e))))?;

            if let Some(last) = logs.last() {
                let reserves = Reserves::from_event(&decode_sync(last)?)?;
                info!(
                    pair = %self.address,
                    block = block_number,
                    found_at = ?last.block_number,
                    duration_ms = start.elapsed().as_millis(),
                    "Generated reserves from latest Sync event"
                );
                return Ok(reserves);
            }

            if from_block <= floor {
                return Err(SyncError::generation(
                    format!(
                        "No Sync event for {} in blocks {floor}..={block_number}",
                        self.address
                    ),
                    None,
                ));
            }
            to_block = from_block - 1;
        }
    }

    fn process_log(
        &self,
        _state: &Reserves,
        log: &Log,
        _header: Option<&BlockHeader>,
    ) -> SyncResult<Option<Reserves>> {
        if log.address() != self.address || log.topics().first() != Some(&Sync::SIGNATURE_HASH) {
            return Ok(None);
        }

        match decode_sync(log) {
            Ok(event) => Reserves::from_event(&event).map(Some),
            Err(e) => {
                warn!(pair = %self.address, block = ?log.block_number, error = %e, "Skipping undecodable Sync log");
                Ok(None)
            }
        }
    }

    fn pool_identifier_data(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "kind": "uniswap-v2", "address": self.address }))
    }
}
