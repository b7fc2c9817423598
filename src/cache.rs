//! Shared snapshot cache used by master and slave processes.
//!
//! One master process per subscription publishes every fresh snapshot under a
//! key derived from the subscriber's group key and name; slave processes read
//! it instead of regenerating state themselves. Consistency is best-effort:
//! cache failures are logged by the engine and never surface to callers.
//!
//! ## Wire format
//!
//! ```text
//! { "blockNumber": 19000000, "snapshot": <protocol-defined JSON> }
//! ```
//!
//! ## Reserved keys
//!
//! Each group has one reserved key, [`LATEST_BLOCK_KEY`], holding the latest
//! block the master fleet has processed. Slaves use it as the log subscription
//! baseline when they adopt a cached snapshot.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::types::SubscriberId;

/// Reserved key holding the latest block processed by the master fleet.
pub const LATEST_BLOCK_KEY: &str = "latest_block";

/// Serialized snapshot exchanged through the shared cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord<S> {
    /// Block the snapshot was taken at
    pub block_number: u64,

    /// Protocol-defined snapshot
    pub snapshot: S,
}

impl<S> CacheRecord<S> {
    /// Create a new record.
    pub const fn new(block_number: u64, snapshot: S) -> Self {
        Self {
            block_number,
            snapshot,
        }
    }
}

/// Serialize a record to its JSON wire form.
///
/// # Errors
///
/// Returns a serialization error if the snapshot cannot be encoded.
pub fn encode_record<S: Serialize>(record: &CacheRecord<S>) -> SyncResult<String> {
    serde_json::to_string(record)
        .map_err(|e| SyncError::serialization("Failed to encode cache record", Some(Box::new(e))))
}

/// Deserialize a record from its JSON wire form.
///
/// # Errors
///
/// Returns a serialization error if the payload is not a valid record.
pub fn decode_record<S: DeserializeOwned>(raw: &str) -> SyncResult<CacheRecord<S>> {
    serde_json::from_str(raw)
        .map_err(|e| SyncError::serialization("Failed to decode cache record", Some(Box::new(e))))
}

/// Payload announcing a subscription a slave had to generate itself.
///
/// Masters listening on the discovery channel pick the subscription up and
/// start publishing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAnnouncement {
    /// Cache group key
    pub group_key: String,

    /// Subscription name
    pub name: String,

    /// Block the slave generated state at
    pub block_number: u64,

    /// Protocol-specific pool identifier data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<serde_json::Value>,
}

impl DiscoveryAnnouncement {
    /// Build an announcement for `id` at `block_number`.
    #[must_use]
    pub fn new(
        id: &SubscriberId,
        block_number: u64,
        identifier: Option<serde_json::Value>,
    ) -> Self {
        Self {
            group_key: id.group_key.clone(),
            name: id.name.clone(),
            block_number,
            identifier,
        }
    }
}

/// Distributed key-value cache with pub/sub, as seen by the engine.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Read the value stored under `(group_key, name)`.
    async fn get(&self, group_key: &str, name: &str) -> SyncResult<Option<String>>;

    /// Store `value` under `(group_key, name)`, optionally expiring after `ttl`.
    async fn set(
        &self,
        group_key: &str,
        name: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> SyncResult<()>;

    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: String) -> SyncResult<()>;
}

/// Read the latest block processed by the master fleet for `group_key`.
///
/// Errors and malformed values are logged and reported as `None`.
pub async fn fetch_latest_block(cache: &dyn SharedCache, group_key: &str) -> Option<u64> {
    match cache.get(group_key, LATEST_BLOCK_KEY).await {
        Ok(Some(raw)) => match raw.trim().parse::<u64>() {
            Ok(block) => Some(block),
            Err(e) => {
                warn!(group = group_key, value = %raw, error = %e, "Malformed latest block in cache");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(group = group_key, error = %e, "Failed to read latest block from cache");
            None
        }
    }
}

/// Record the latest block processed by the master fleet for `group_key`.
///
/// # Errors
///
/// Propagates the cache write error.
pub async fn publish_latest_block(
    cache: &dyn SharedCache,
    group_key: &str,
    block_number: u64,
) -> SyncResult<()> {
    cache
        .set(group_key, LATEST_BLOCK_KEY, block_number.to_string(), None)
        .await
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Process-local [`SharedCache`] with TTL support and a broadcast pub/sub.
///
/// Useful for single-process deployments, simulations and tests. Published
/// messages are delivered to every receiver obtained from
/// [`InMemoryCache::subscribe`] as `(topic, payload)` pairs.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    published: broadcast::Sender<(String, String)>,
}

impl InMemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            entries: Mutex::new(HashMap::new()),
            published: tx,
        }
    }

    /// Receive every message published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.published.subscribe()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }

    /// Whether the cache holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, group_key: &str, name: &str) -> SyncResult<Option<String>> {
        let key = (group_key.to_string(), name.to_string());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = entries
            .get(&key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            entries.remove(&key);
            debug!(group = group_key, name, "Cache entry expired");
            return Ok(None);
        }

        Ok(entries.get(&key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        group_key: &str,
        name: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> SyncResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (group_key.to_string(), name.to_string()),
                Entry { value, expires_at },
            );
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: String) -> SyncResult<()> {
        // No receivers is not an error for a pub/sub channel.
        let receivers = self
            .published
            .send((topic.to_string(), payload))
            .unwrap_or(0);
        debug!(topic, receivers, "Published cache message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Reserves {
        reserve0: String,
        reserve1: String,
    }

    #[test]
    fn test_record_round_trip() {
        let record = CacheRecord::new(
            42,
            Reserves {
                reserve0: "1000000000000000000".to_string(),
                reserve1: "3000000000".to_string(),
            },
        );

        let decoded = encode_record(&record).and_then(|raw| decode_record::<Reserves>(&raw));
        assert_eq!(decoded.ok(), Some(record));
    }

    #[test]
    fn test_record_wire_field_names() {
        let raw = encode_record(&CacheRecord::new(7, 1_u64));
        assert_eq!(raw.ok().as_deref(), Some(r#"{"blockNumber":7,"snapshot":1}"#));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_record::<u64>("{\"block\":1}").is_err());
    }

    #[test]
    fn test_discovery_payload_shape() {
        let id = SubscriberId::new("mainnet_uniswapv2", "pair");
        let announcement = DiscoveryAnnouncement::new(&id, 100, None);
        let json = serde_json::to_string(&announcement).unwrap_or_default();
        assert_eq!(
            json,
            r#"{"groupKey":"mainnet_uniswapv2","name":"pair","blockNumber":100}"#
        );
    }

    #[tokio::test]
    async fn test_in_memory_get_set() {
        let cache = InMemoryCache::new();
        assert!(matches!(cache.get("g", "n").await, Ok(None)));

        cache.set("g", "n", "v".to_string(), None).await.ok();
        assert_eq!(cache.get("g", "n").await.ok().flatten().as_deref(), Some("v"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache
            .set("g", "n", "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .ok();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(cache.get("g", "n").await, Ok(None)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let cache = InMemoryCache::new();
        let mut rx = cache.subscribe();

        cache.publish("topic", "hello".to_string()).await.ok();
        let received = rx.recv().await.ok();
        assert_eq!(received, Some(("topic".to_string(), "hello".to_string())));
    }

    #[tokio::test]
    async fn test_latest_block_helpers() {
        let cache = InMemoryCache::new();
        assert_eq!(fetch_latest_block(&cache, "g").await, None);

        publish_latest_block(&cache, "g", 123).await.ok();
        assert_eq!(fetch_latest_block(&cache, "g").await, Some(123));

        cache
            .set("g", LATEST_BLOCK_KEY, "not-a-number".to_string(), None)
            .await
            .ok();
        assert_eq!(fetch_latest_block(&cache, "g").await, None);
    }
}
