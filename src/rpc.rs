//! HTTP provider helpers used by the Uniswap V2 adapter and the `watch` loop.
//!
//! ```no_run
//! use dex_state_sync::rpc::{create_provider, fetch_header, get_latest_block};
//!
//! # async fn example() -> dex_state_sync::error::SyncResult<()> {
//! let provider = create_provider("https://eth-mainnet.g.alchemy.com/v2/API_KEY").await?;
//! let latest = get_latest_block(&provider).await?;
//! let header = fetch_header(&provider, latest).await?;
//! println!("{} {}", header.number, header.hash);
//! # Ok(())
//! # }
//! ```

use alloy::providers::{Provider as _, ProviderBuilder, RootProvider};
use alloy::rpc::types::BlockTransactionsKind;
use alloy::transports::http::{Client, Http};
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::error::{SyncError, SyncResult};
use crate::types::{BlockHeader, BlockHeaders};

/// HTTP JSON-RPC provider.
pub type Provider = RootProvider<Http<Client>>;

/// Build an HTTP provider for `rpc_url`. No request is made.
///
/// # Errors
///
/// Returns an RPC error when the URL does not parse.
#[allow(clippy::unused_async)]
#[instrument(skip(rpc_url), fields(rpc_host = tracing::field::Empty))]
pub async fn create_provider(rpc_url: &str) -> SyncResult<Provider> {
    let host = rpc_url.split("/v2/").next().unwrap_or("unknown");
    tracing::Span::current().record("rpc_host", host);

    let url = rpc_url.parse().map_err(|e| {
        let msg = if rpc_url.starts_with("http") {
            format!("Failed to parse RPC URL: '{rpc_url}'")
        } else {
            format!("Invalid RPC URL: '{rpc_url}'. Set RPC_URL or ALCHEMY_API_KEY")
        };
        SyncError::rpc(msg, Some(Box::new(e)))
    })?;

    debug!(rpc_host = host, "HTTP provider created");
    Ok(ProviderBuilder::new().on_http(url))
}

/// Latest block number known to the node.
///
/// # Errors
///
/// Returns an RPC error when the request fails.
#[instrument(skip(provider))]
pub async fn get_latest_block(provider: &Provider) -> SyncResult<u64> {
    let start = Instant::now();
    let block_number = provider
        .get_block_number()
        .await
        .map_err(|e| SyncError::rpc("Failed to fetch latest block number", Some(Box::new(e))))?;

    debug!(
        block = block_number,
        duration_ms = start.elapsed().as_millis(),
        "Latest block fetched"
    );
    Ok(block_number)
}

/// Header of block `number`.
///
/// # Errors
///
/// Returns an RPC error when the request fails or the node does not know the block.
pub async fn fetch_header(provider: &Provider, number: u64) -> SyncResult<BlockHeader> {
    let block = provider
        .get_block_by_number(number.into(), BlockTransactionsKind::Hashes)
        .await
        .map_err(|e| SyncError::rpc(format!("Failed to fetch block {number}"), Some(Box::new(e))))?
        .ok_or_else(|| SyncError::rpc(format!("Block {number} not found"), None))?;

    Ok(BlockHeader::from_block(&block))
}

/// Headers of every block in `[from_block, to_block]`.
///
/// # Errors
///
/// Returns the first failed header fetch.
#[instrument(skip(provider))]
pub async fn fetch_headers(
    provider: &Provider,
    from_block: u64,
    to_block: u64,
) -> SyncResult<BlockHeaders> {
    let mut headers = BlockHeaders::new();
    for number in from_block..=to_block {
        headers.insert(number, fetch_header(provider, number).await?);
    }
    info!(from_block, to_block, count = headers.len(), "Fetched block headers");
    Ok(headers)
}
