//! Configuration management for the synchronization engine.
//!
//! This module handles loading and validating configuration from environment variables
//! using the `dotenvy` crate. All operations return [`SyncResult`] for comprehensive
//! error handling.
//!
//! ## Environment Variables
//!
//! Engine settings ([`SyncConfig`], all optional):
//! - `SYNC_ROLE`: `master` or `slave` (default: master)
//! - `SHARE_CACHE`: Enable master/slave snapshot sharing (default: false)
//! - `RETENTION_WINDOW`: History retention in blocks (default: 1000)
//! - `CACHE_TTL_SECS`: TTL of cached snapshots, 0 disables expiry (default: 3600)
//! - `CACHE_REFRESH_DELAY_MS`: Coalescing window for slave refreshes (default: 100)
//! - `LOG_AGGREGATION_WINDOW_SECS`: Count-and-flush window for noisy logs (default: 60)
//! - `STRICT_BATCH_ORDERING`: Reject misordered batches instead of logging (default: false)
//! - `SELF_HEAL_INITIAL_DELAY_MS`: First self-heal retry delay (default: 1000)
//! - `SELF_HEAL_MAX_DELAY_MS`: Self-heal backoff cap (default: 60000)
//! - `DISCOVERY_CHANNEL`: Pub/sub topic for discovery announcements
//!   (default: "subscription-discovery")
//!
//! RPC settings for the CLI ([`RpcConfig`]):
//! - `RPC_URL` or `ALCHEMY_API_KEY`: Ethereum HTTP endpoint (one is required)
//! - `POOL_ADDRESS`: Uniswap V2 pair to watch (default: WETH/USDT pair)
//! - `GENERATION_LOOKBACK_BLOCKS`: Blocks scanned when rebuilding reserves (default: 5000)
//! - `RUST_LOG`: Logging level (default: "info")
//!
//! ## Example
//!
//! ```no_run
//! use dex_state_sync::config::SyncConfig;
//! use dex_state_sync::error::SyncResult;
//!
//! # fn main() -> SyncResult<()> {
//! let config = SyncConfig::from_env()?;
//! println!("Role: {}", config.role());
//! # Ok(())
//! # }
//! ```

use crate::error::{SyncError, SyncResult};
use crate::sync::BatchPolicy;
use crate::types::Role;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default history retention in blocks.
pub const DEFAULT_RETENTION_WINDOW: u64 = 1000;

/// Default discovery announcement topic.
pub const DEFAULT_DISCOVERY_CHANNEL: &str = "subscription-discovery";

/// Engine configuration shared by every subscriber of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Process role for the shared cache
    role: Role,

    /// Whether snapshots are exchanged through the shared cache
    share_cache: bool,

    /// History retention in blocks
    retention_window: u64,

    /// TTL applied to snapshot cache writes
    cache_ttl: Option<Duration>,

    /// Coalescing window for slave cache refreshes
    cache_refresh_delay: Duration,

    /// Count-and-flush window for repeated log messages
    log_aggregation_window: Duration,

    /// Reaction to misordered or headerless batches
    batch_policy: BatchPolicy,

    /// First self-heal retry delay
    self_heal_initial_delay: Duration,

    /// Self-heal backoff cap
    self_heal_max_delay: Duration,

    /// Discovery announcement topic
    discovery_channel: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            role: Role::Master,
            share_cache: false,
            retention_window: DEFAULT_RETENTION_WINDOW,
            cache_ttl: Some(Duration::from_secs(3600)),
            cache_refresh_delay: Duration::from_millis(100),
            log_aggregation_window: Duration::from_secs(60),
            batch_policy: BatchPolicy::Lenient,
            self_heal_initial_delay: Duration::from_millis(1000),
            self_heal_max_delay: Duration::from_millis(60_000),
            discovery_channel: DEFAULT_DISCOVERY_CHANNEL.to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// This function:
    /// 1. Loads `.env` file using `dotenvy` (if present)
    /// 2. Reads and validates all environment variables
    /// 3. Applies defaults for unset variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse,
    /// or if the retention window is zero.
    pub fn from_env() -> SyncResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let role = match env::var("SYNC_ROLE") {
            Ok(value) => value.parse::<Role>()?,
            Err(_) => defaults.role,
        };

        let share_cache = parse_var("SHARE_CACHE", defaults.share_cache)?;

        let retention_window = parse_var("RETENTION_WINDOW", defaults.retention_window)?;
        if retention_window == 0 {
            return Err(SyncError::config(
                "RETENTION_WINDOW must be at least 1 block",
                None,
            ));
        }

        let cache_ttl_secs = parse_var("CACHE_TTL_SECS", 3600_u64)?;
        let cache_ttl = (cache_ttl_secs > 0).then(|| Duration::from_secs(cache_ttl_secs));

        let cache_refresh_delay =
            Duration::from_millis(parse_var("CACHE_REFRESH_DELAY_MS", 100_u64)?);

        let log_aggregation_window =
            Duration::from_secs(parse_var("LOG_AGGREGATION_WINDOW_SECS", 60_u64)?);

        let batch_policy = if parse_var("STRICT_BATCH_ORDERING", false)? {
            BatchPolicy::Strict
        } else {
            BatchPolicy::Lenient
        };

        let self_heal_initial_delay =
            Duration::from_millis(parse_var("SELF_HEAL_INITIAL_DELAY_MS", 1000_u64)?);
        let self_heal_max_delay =
            Duration::from_millis(parse_var("SELF_HEAL_MAX_DELAY_MS", 60_000_u64)?);

        let discovery_channel =
            env::var("DISCOVERY_CHANNEL").unwrap_or(defaults.discovery_channel);

        Ok(Self {
            role,
            share_cache,
            retention_window,
            cache_ttl,
            cache_refresh_delay,
            log_aggregation_window,
            batch_policy,
            self_heal_initial_delay,
            self_heal_max_delay,
            discovery_channel,
        })
    }

    /// Set the process role.
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Enable or disable snapshot sharing.
    #[must_use]
    pub const fn with_share_cache(mut self, share_cache: bool) -> Self {
        self.share_cache = share_cache;
        self
    }

    /// Set the history retention window.
    #[must_use]
    pub const fn with_retention_window(mut self, blocks: u64) -> Self {
        self.retention_window = blocks;
        self
    }

    /// Set the batch policy.
    #[must_use]
    pub const fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    /// Set the slave refresh coalescing window.
    #[must_use]
    pub const fn with_cache_refresh_delay(mut self, delay: Duration) -> Self {
        self.cache_refresh_delay = delay;
        self
    }

    /// Set the self-heal backoff bounds.
    #[must_use]
    pub const fn with_self_heal_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.self_heal_initial_delay = initial;
        self.self_heal_max_delay = max;
        self
    }

    /// Get the process role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Check if snapshot sharing is enabled.
    #[must_use]
    pub const fn share_cache(&self) -> bool {
        self.share_cache
    }

    /// Get the history retention window in blocks.
    #[must_use]
    pub const fn retention_window(&self) -> u64 {
        self.retention_window
    }

    /// Get the TTL for snapshot cache writes.
    #[must_use]
    pub const fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Get the slave refresh coalescing window.
    #[must_use]
    pub const fn cache_refresh_delay(&self) -> Duration {
        self.cache_refresh_delay
    }

    /// Get the count-and-flush window.
    #[must_use]
    pub const fn log_aggregation_window(&self) -> Duration {
        self.log_aggregation_window
    }

    /// Get the batch policy.
    #[must_use]
    pub const fn batch_policy(&self) -> BatchPolicy {
        self.batch_policy
    }

    /// Get the first self-heal retry delay.
    #[must_use]
    pub const fn self_heal_initial_delay(&self) -> Duration {
        self.self_heal_initial_delay
    }

    /// Get the self-heal backoff cap.
    #[must_use]
    pub const fn self_heal_max_delay(&self) -> Duration {
        self.self_heal_max_delay
    }

    /// Get the discovery announcement topic.
    #[must_use]
    pub fn discovery_channel(&self) -> &str {
        &self.discovery_channel
    }
}

/// RPC settings used by the `watch` command.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Ethereum HTTP RPC URL
    rpc_url: String,

    /// Uniswap V2 pair address to watch
    pool_address: String,

    /// Blocks scanned backwards when rebuilding reserves from scratch
    generation_lookback_blocks: u64,
}

impl RpcConfig {
    /// Load RPC settings from environment variables.
    ///
    /// `RPC_URL` wins over `ALCHEMY_API_KEY`; one of them is required.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured, the API key is a
    /// placeholder, the pool address is malformed or the lookback does not parse.
    pub fn from_env() -> SyncResult<Self> {
        dotenvy::dotenv().ok();

        let rpc_url = match env::var("RPC_URL") {
            Ok(url) if !url.is_empty() => url,
            _ => {
                let alchemy_api_key = env::var("ALCHEMY_API_KEY").map_err(|e| {
                    SyncError::config(
                        "RPC_URL or ALCHEMY_API_KEY environment variable is required",
                        Some(Box::new(e)),
                    )
                })?;

                if alchemy_api_key.is_empty() || alchemy_api_key == "your_alchemy_api_key_here"
                {
                    return Err(SyncError::config(
                        "ALCHEMY_API_KEY must be set to a valid Alchemy API key",
                        None,
                    ));
                }

                format!("https://eth-mainnet.g.alchemy.com/v2/{alchemy_api_key}")
            }
        };

        let pool_address = env::var("POOL_ADDRESS")
            .unwrap_or_else(|_| "0x0d4a11d5EEaaC28EC3F61d100daF4d40471f1852".to_string());

        if !pool_address.starts_with("0x") || pool_address.len() != 42 {
            return Err(SyncError::config(
                format!(
                    "POOL_ADDRESS must be a valid Ethereum address (0x + 40 hex chars), got: {pool_address}"
                ),
                None,
            ));
        }

        let generation_lookback_blocks = parse_var("GENERATION_LOOKBACK_BLOCKS", 5000_u64)?;

        Ok(Self {
            rpc_url,
            pool_address,
            generation_lookback_blocks,
        })
    }

    /// Get the Ethereum RPC URL.
    #[must_use]
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Get the pool address.
    #[must_use]
    pub fn pool_address(&self) -> &str {
        &self.pool_address
    }

    /// Get the generation lookback in blocks.
    #[must_use]
    pub const fn generation_lookback_blocks(&self) -> u64 {
        self.generation_lookback_blocks
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> SyncResult<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            SyncError::config(
                format!("{name} has an invalid value: {raw}"),
                Some(Box::new(e)),
            )
        }),
        Err(_) => Ok(default),
    }
}
