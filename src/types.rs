//! Shared data types: block headers, subscriber identity, process role and the
//! snapshot bound every protocol state must satisfy.

use alloy::primitives::B256;
use alloy::rpc::types::{Block, Header, Log};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Marker bound for protocol snapshots.
///
/// A snapshot is an immutable value describing a venue's state as of one
/// block. The engine never mutates one in place; it only stores, shares and
/// serializes them. Implemented automatically for every qualifying type.
pub trait Snapshot: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Snapshot for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Minimal header information delivered alongside a log batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number
    pub number: u64,

    /// Block hash
    pub hash: B256,

    /// Parent block hash
    pub parent_hash: B256,

    /// Block timestamp (Unix epoch seconds)
    pub timestamp: u64,
}

impl BlockHeader {
    /// Create a header manually (useful for testing and synthetic chains).
    #[must_use]
    pub const fn new(number: u64, hash: B256, parent_hash: B256, timestamp: u64) -> Self {
        Self {
            number,
            hash,
            parent_hash,
            timestamp,
        }
    }

    /// Extract the fields the engine needs from an RPC header.
    #[must_use]
    pub fn from_rpc_header(header: &Header) -> Self {
        Self {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
        }
    }

    /// Extract the header of a full RPC block.
    #[must_use]
    pub fn from_block(block: &Block) -> Self {
        Self::from_rpc_header(&block.header)
    }
}

/// Block headers for one `update` call, keyed by block number.
pub type BlockHeaders = BTreeMap<u64, BlockHeader>;

/// Identity of one logical subscription.
///
/// `group_key` scopes the shared cache (typically network + venue); `name`
/// identifies the pool or subscription inside the group. Masters and slaves of
/// the same subscription share both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId {
    /// Cache group key
    pub group_key: String,

    /// Subscription name within the group
    pub name: String,
}

impl SubscriberId {
    /// Create a new subscriber identity.
    #[must_use]
    pub fn new(group_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_key, self.name)
    }
}

/// Process role with respect to the shared snapshot cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Generates state authoritatively and publishes it.
    #[default]
    Master,
    /// Prefers cached snapshots over regenerating them.
    Slave,
}

impl Role {
    /// Whether this process publishes snapshots.
    #[must_use]
    pub const fn is_master(self) -> bool {
        matches!(self, Self::Master)
    }

    /// Whether this process imports snapshots.
    #[must_use]
    pub const fn is_slave(self) -> bool {
        matches!(self, Self::Slave)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}

impl FromStr for Role {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "slave" => Ok(Self::Slave),
            other => Err(SyncError::config(
                format!("SYNC_ROLE must be 'master' or 'slave', got: {other}"),
                None,
            )),
        }
    }
}

/// Position of a log in the chain as `(block_number, log_index)`.
///
/// Returns `None` when the log carries no block number (pending logs). A
/// missing log index sorts first within its block.
#[must_use]
pub fn log_position(log: &Log) -> Option<(u64, u64)> {
    log.block_number
        .map(|block| (block, log.log_index.unwrap_or_default()))
}
