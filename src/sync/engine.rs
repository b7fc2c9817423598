//! Subscriber lifecycle, log application and the master/slave cache bridge.
//!
//! ## Concurrency
//!
//! Every mutation of one subscriber (`initialize`, `update`, `rollback`,
//! `restart`, `invalidate`, `set_state`, self-heal attempts and slave cache
//! refreshes) runs under a single per-instance `tokio::sync::Mutex`, held across
//! `generate_state`. Two regenerations of the same subscriber therefore never
//! race; the second one observes the first one's result. Different subscribers
//! share nothing but the collaborators in [`SyncServices`] and run fully in
//! parallel.
//!
//! ## Cache bridge
//!
//! - **Master** with sharing: every non-null snapshot written through
//!   `set_state` is serialized and written to the shared cache in a detached
//!   task; failures are logged and dropped.
//! - **Slave** with sharing: a request to drop the snapshot instead schedules a
//!   coalesced cache read; a record found there is adopted through `set_state`
//!   unless it is older than a still-trusted local snapshot.

use alloy::rpc::types::Log;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::batch::{partition_runs, validate_batch, BatchPolicy};
use super::protocol::Protocol;
use super::state::{Rewind, SyncState};
use crate::cache::{decode_record, encode_record, fetch_latest_block, CacheRecord};
use crate::cache::{DiscoveryAnnouncement, SharedCache};
use crate::config::SyncConfig;
use crate::delivery::LogDelivery;
use crate::error::{SyncError, SyncResult};
use crate::log_aggregator::LogAggregator;
use crate::scheduler::{JobScheduler, RetryableJob};
use crate::types::{BlockHeaders, SubscriberId};

/// External collaborators shared by every subscriber of a process.
#[derive(Clone)]
pub struct SyncServices {
    /// Shared snapshot cache and pub/sub
    pub cache: Arc<dyn SharedCache>,
    /// Log delivery service registration
    pub delivery: Arc<dyn LogDelivery>,
    /// Retry scheduler for self-heal jobs
    pub scheduler: Arc<dyn JobScheduler>,
    /// Aggregator for repeated log messages
    pub log_aggregator: Arc<LogAggregator>,
}

impl SyncServices {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        cache: Arc<dyn SharedCache>,
        delivery: Arc<dyn LogDelivery>,
        scheduler: Arc<dyn JobScheduler>,
        log_aggregator: Arc<LogAggregator>,
    ) -> Self {
        Self {
            cache,
            delivery,
            scheduler,
            log_aggregator,
        }
    }
}

/// How `initialize` should establish the first snapshot.
#[derive(Debug, Clone)]
pub struct InitOptions<S> {
    /// Use this snapshot as-is.
    pub state: Option<S>,
    /// Ignore the cache and regenerate from scratch.
    pub force_regenerate: bool,
}

impl<S> Default for InitOptions<S> {
    fn default() -> Self {
        Self {
            state: None,
            force_regenerate: false,
        }
    }
}

impl<S> InitOptions<S> {
    /// Start from an explicitly supplied snapshot.
    #[must_use]
    pub const fn with_state(state: S) -> Self {
        Self {
            state: Some(state),
            force_regenerate: false,
        }
    }

    /// Regenerate from scratch, bypassing the cache.
    #[must_use]
    pub const fn regenerate() -> Self {
        Self {
            state: None,
            force_regenerate: true,
        }
    }
}

struct Inner<P: Protocol> {
    id: SubscriberId,
    protocol: P,
    config: SyncConfig,
    services: SyncServices,
    state: Mutex<SyncState<P::State>>,
    refresh_pending: AtomicBool,
}

/// Keeps one venue's snapshot synchronized with the chain.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```no_run
/// use dex_state_sync::pools::counter::CounterPool;
/// use dex_state_sync::sync::{InitOptions, StateSubscriber, SyncServices};
/// use dex_state_sync::{cache::InMemoryCache, config::SyncConfig};
/// use dex_state_sync::delivery::SubscriptionRegistry;
/// use dex_state_sync::log_aggregator::LogAggregator;
/// use dex_state_sync::scheduler::TokioScheduler;
/// use dex_state_sync::types::{BlockHeaders, SubscriberId};
/// use std::sync::Arc;
///
/// # async fn example() -> dex_state_sync::error::SyncResult<()> {
/// let services = SyncServices::new(
///     Arc::new(InMemoryCache::new()),
///     Arc::new(SubscriptionRegistry::new()),
///     Arc::new(TokioScheduler::default()),
///     Arc::new(LogAggregator::default()),
/// );
/// let subscriber = StateSubscriber::new(
///     SubscriberId::new("local", "counter"),
///     CounterPool::new(alloy::primitives::Address::ZERO),
///     SyncConfig::default(),
///     services,
/// );
///
/// subscriber.initialize(100, InitOptions::default()).await?;
/// subscriber.update(&[], &BlockHeaders::new()).await?;
/// let fresh = subscriber.get_state(100).await;
/// # Ok(())
/// # }
/// ```
pub struct StateSubscriber<P: Protocol> {
    inner: Arc<Inner<P>>,
}

impl<P: Protocol> Clone for StateSubscriber<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Protocol> StateSubscriber<P> {
    /// Create an uninitialized subscriber.
    #[must_use]
    pub fn new(id: SubscriberId, protocol: P, config: SyncConfig, services: SyncServices) -> Self {
        let retention = config.retention_window();
        Self {
            inner: Arc::new(Inner {
                id,
                protocol,
                config,
                services,
                state: Mutex::new(SyncState::new(retention)),
                refresh_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Subscriber identity.
    #[must_use]
    pub fn id(&self) -> &SubscriberId {
        &self.inner.id
    }

    /// The protocol adapter.
    #[must_use]
    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Establish the first snapshot and register with the delivery service.
    ///
    /// The snapshot comes from, in priority order:
    /// 1. `options.state`
    /// 2. `generate_state(block_number)` when `options.force_regenerate`
    /// 3. the shared cache on a slave with sharing enabled (adopted even when
    ///    older than `block_number`); on a miss the slave generates and
    ///    announces the subscription on the discovery channel
    /// 4. `generate_state(block_number)` otherwise
    ///
    /// Registration always happens, baselined at `block_number`, or for a
    /// cache hit at the fleet's latest processed block (falling back to the
    /// record's block).
    ///
    /// # Errors
    ///
    /// Returns the generation error, or the delivery service's registration error.
    #[instrument(skip_all, fields(subscriber = %self.inner.id, block = block_number))]
    pub async fn initialize(
        &self,
        block_number: u64,
        options: InitOptions<P::State>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let baseline = if let Some(snapshot) = options.state {
            debug!("Initializing from supplied snapshot");
            inner.set_state(&mut state, Some(Arc::new(snapshot)), block_number);
            block_number
        } else if options.force_regenerate {
            debug!("Forced regeneration requested");
            let fresh = inner.generate(block_number).await?;
            inner.set_state(&mut state, Some(fresh), block_number);
            block_number
        } else if inner.config.role().is_slave() && inner.config.share_cache() {
            match inner.read_cached_record().await {
                Some(record) => {
                    let record_block = record.block_number;
                    info!(
                        cached_block = record_block,
                        requested_block = block_number,
                        "Adopted cached snapshot"
                    );
                    inner.set_state(&mut state, Some(Arc::new(record.snapshot)), record_block);
                    fetch_latest_block(inner.services.cache.as_ref(), &inner.id.group_key)
                        .await
                        .unwrap_or(record_block)
                }
                None => {
                    info!("No cached snapshot, generating locally");
                    let fresh = inner.generate(block_number).await?;
                    inner.set_state(&mut state, Some(fresh), block_number);
                    inner.announce_discovery(block_number);
                    block_number
                }
            }
        } else {
            let fresh = inner.generate(block_number).await?;
            inner.set_state(&mut state, Some(fresh), block_number);
            block_number
        };

        let addresses = inner.protocol.addresses_subscribed();
        inner
            .services
            .delivery
            .subscribe_to_logs(&inner.id, &addresses, baseline)?;

        info!(
            baseline,
            state_block = state.block_number(),
            addresses = addresses.len(),
            "Subscriber initialized"
        );
        Ok(())
    }

    /// Apply a batch of logs.
    ///
    /// Logs are grouped into runs of one block. Each run is folded onto the
    /// newest checkpoint strictly older than its block; a changed result is
    /// stored as that block's checkpoint and becomes current when the block is
    /// the newest seen. Without any snapshot, one is generated for the run's
    /// block instead. The invalid flag is cleared once the whole batch went
    /// through.
    ///
    /// A master left without a snapshot schedules a self-heal job.
    ///
    /// # Errors
    ///
    /// - [`SyncError::OrderingError`] when the strict batch policy rejects the batch
    /// - the first `process_block_logs` error, which aborts the rest of the batch
    /// - the generation error when no snapshot could be built (after scheduling
    ///   the self-heal job)
    #[instrument(skip_all, fields(subscriber = %self.inner.id, logs = logs.len(), blocks = headers.len()))]
    pub async fn update(&self, logs: &[Log], headers: &BlockHeaders) -> SyncResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.is_inactive() {
            warn!("Update ignored, subscriber is inactive");
            return Ok(());
        }

        let violations = validate_batch(logs, headers);
        if !violations.is_empty() {
            match inner.config.batch_policy() {
                BatchPolicy::Strict => {
                    let summary = violations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    error!(violations = violations.len(), "Rejected log batch: {summary}");
                    return Err(SyncError::ordering(format!(
                        "{} violation(s) in batch for {}: {summary}",
                        violations.len(),
                        inner.id
                    )));
                }
                BatchPolicy::Lenient => {
                    for violation in &violations {
                        error!(violation = %violation, "Invalid log batch, continuing");
                    }
                }
            }
        }

        let mut generation_error: Option<SyncError> = None;
        let mut latest_seen = state.block_number();

        for run in partition_runs(logs) {
            latest_seen = latest_seen.max(run.block_number);

            if !state.has_state() {
                if generation_error.is_none() {
                    match inner.generate(run.block_number).await {
                        Ok(fresh) => inner.set_state(&mut state, Some(fresh), run.block_number),
                        Err(e) => generation_error = Some(e),
                    }
                }
                continue;
            }

            let Some((checkpoint, base)) = state.history().latest_before(run.block_number) else {
                debug!(
                    block = run.block_number,
                    "No checkpoint older than block, skipping its logs"
                );
                continue;
            };

            let header = headers.get(&run.block_number);
            let Some(next) = inner
                .protocol
                .process_block_logs(&base, run.logs, header)?
            else {
                continue;
            };

            let next = Arc::new(next);
            if run.block_number > state.block_number() {
                inner.set_state(&mut state, Some(next), run.block_number);
            } else {
                state.record_checkpoint(run.block_number, next);
            }
            debug!(
                block = run.block_number,
                checkpoint,
                logs = run.logs.len(),
                "Applied block logs"
            );
        }

        if let Some(&last_header) = headers.keys().next_back() {
            latest_seen = latest_seen.max(last_header);
            if !state.has_state() && generation_error.is_none() {
                match inner.generate(last_header).await {
                    Ok(fresh) => inner.set_state(&mut state, Some(fresh), last_header),
                    Err(e) => generation_error = Some(e),
                }
            }
        }

        state.validate();

        if !state.has_state() && inner.config.role().is_master() && latest_seen > 0 {
            inner.schedule_self_heal(latest_seen);
        }

        generation_error.map_or(Ok(()), Err)
    }

    /// React to a reorganization at `block_number`.
    ///
    /// While invalid, history newer than the block is discarded and the
    /// newest remaining checkpoint is written back as current, which clears the
    /// invalid flag and republishes it on a master. Without a checkpoint the
    /// snapshot is nulled (a sharing slave refreshes from the cache instead).
    /// While valid, the current snapshot is kept and only other newer
    /// checkpoints are discarded.
    #[instrument(skip_all, fields(subscriber = %self.inner.id, block = block_number))]
    pub async fn rollback(&self, block_number: u64) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.is_inactive() {
            debug!("Rollback ignored, subscriber is inactive");
            return;
        }

        let rewind = state.rollback(block_number);
        inner.rewind(&mut state, rewind);
    }

    /// Slide the history window forward to `block_number`.
    ///
    /// Checkpoints older than the block are discarded; a current snapshot
    /// older than the block is dropped as well (a sharing slave keeps it and
    /// refreshes from the cache instead).
    #[instrument(skip_all, fields(subscriber = %self.inner.id, block = block_number))]
    pub async fn restart(&self, block_number: u64) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.is_inactive() {
            debug!("Restart ignored, subscriber is inactive");
            return;
        }

        let rewind = state.restart(block_number);
        inner.rewind(&mut state, rewind);
    }

    /// Mark the current snapshot as untrusted; the next rollback rewinds.
    pub async fn invalidate(&self) {
        let mut state = self.inner.state.lock().await;
        if state.is_inactive() {
            return;
        }
        state.invalidate();
        debug!(subscriber = %self.inner.id, "State invalidated");
    }

    /// Put the subscriber to sleep for good.
    pub async fn inactivate(&self) {
        self.inner.state.lock().await.inactivate();
        info!(subscriber = %self.inner.id, "Subscriber inactivated");
    }

    /// Write path for the current snapshot.
    ///
    /// On a master with sharing, a non-null snapshot is also published to the
    /// cache. On a slave with sharing, `None` keeps the local snapshot and
    /// schedules a cache refresh instead.
    pub async fn set_state(&self, snapshot: Option<P::State>, block_number: u64) {
        let mut state = self.inner.state.lock().await;
        self.inner
            .set_state(&mut state, snapshot.map(Arc::new), block_number);
    }

    /// Current snapshot if valid and at least as new as `min_block_number`.
    ///
    /// A tracking protocol is always considered fresh enough. `None` tells the
    /// caller to regenerate out-of-band.
    pub async fn get_state(&self, min_block_number: u64) -> Option<Arc<P::State>> {
        let tracking = self.inner.protocol.is_tracking();
        self.inner
            .state
            .lock()
            .await
            .fresh_state(min_block_number, tracking)
    }

    /// Whatever snapshot is held, ignoring freshness and validity.
    pub async fn get_stale_state(&self) -> Option<Arc<P::State>> {
        self.inner.state.lock().await.current()
    }

    /// Block number of the current pointer.
    pub async fn state_block_number(&self) -> u64 {
        self.inner.state.lock().await.block_number()
    }

    /// Block numbers held in history, in increasing order.
    pub async fn history_blocks(&self) -> Vec<u64> {
        self.inner.state.lock().await.history().blocks()
    }

    /// Checkpoint stored for exactly `block_number`.
    pub async fn checkpoint(&self, block_number: u64) -> Option<Arc<P::State>> {
        self.inner
            .state
            .lock()
            .await
            .history()
            .get(block_number)
            .cloned()
    }

    /// Whether the current snapshot is marked untrusted.
    pub async fn is_invalid(&self) -> bool {
        self.inner.state.lock().await.is_invalid()
    }

    /// Whether the subscriber is inactive.
    pub async fn is_inactive(&self) -> bool {
        self.inner.state.lock().await.is_inactive()
    }
}

impl<P: Protocol> Inner<P> {
    fn set_state(
        self: &Arc<Self>,
        state: &mut SyncState<P::State>,
        snapshot: Option<Arc<P::State>>,
        block_number: u64,
    ) {
        if state.is_inactive() {
            debug!(subscriber = %self.id, block = block_number, "Ignoring state write, subscriber is inactive");
            return;
        }

        if snapshot.is_none() && self.config.role().is_slave() && self.config.share_cache() {
            self.schedule_cache_refresh();
            return;
        }

        state.apply(snapshot.clone(), block_number);

        if let Some(snapshot) = snapshot {
            if self.config.role().is_master() && self.config.share_cache() {
                self.publish_snapshot(block_number, &snapshot);
            }
        }
    }

    fn rewind(self: &Arc<Self>, state: &mut SyncState<P::State>, rewind: Rewind<P::State>) {
        match rewind {
            Rewind::Keep => {}
            Rewind::To { block, state: snapshot } => self.set_state(state, Some(snapshot), block),
            Rewind::Clear { block } => self.set_state(state, None, block),
        }
    }

    async fn generate(&self, block_number: u64) -> SyncResult<Arc<P::State>> {
        let start = Instant::now();
        match self.protocol.generate_state(block_number).await {
            Ok(fresh) => {
                info!(
                    subscriber = %self.id,
                    block = block_number,
                    duration_ms = start.elapsed().as_millis(),
                    "Generated state from scratch"
                );
                Ok(Arc::new(fresh))
            }
            Err(e) => {
                warn!(subscriber = %self.id, block = block_number, error = %e, "State generation failed");
                Err(e)
            }
        }
    }

    fn publish_snapshot(&self, block_number: u64, snapshot: &Arc<P::State>) {
        let payload = match encode_record(&CacheRecord::new(block_number, snapshot.as_ref())) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subscriber = %self.id, block = block_number, error = %e, "Failed to encode snapshot for cache");
                return;
            }
        };

        let cache = Arc::clone(&self.services.cache);
        let id = self.id.clone();
        let ttl = self.config.cache_ttl();
        tokio::spawn(async move {
            match cache.set(&id.group_key, &id.name, payload, ttl).await {
                Ok(()) => debug!(subscriber = %id, block = block_number, "Published snapshot to cache"),
                Err(e) => {
                    warn!(subscriber = %id, block = block_number, error = %e, "Failed to publish snapshot to cache");
                }
            }
        });
    }

    async fn read_cached_record(&self) -> Option<CacheRecord<P::State>> {
        let raw = match self
            .services
            .cache
            .get(&self.id.group_key, &self.id.name)
            .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(subscriber = %self.id, error = %e, "Failed to read snapshot from cache");
                return None;
            }
        };

        match decode_record(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(subscriber = %self.id, error = %e, "Discarding malformed cached snapshot");
                None
            }
        }
    }

    fn announce_discovery(&self, block_number: u64) {
        let announcement = DiscoveryAnnouncement::new(
            &self.id,
            block_number,
            self.protocol.pool_identifier_data(),
        );
        let payload = match serde_json::to_string(&announcement) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(subscriber = %self.id, error = %e, "Failed to encode discovery announcement");
                return;
            }
        };

        let cache = Arc::clone(&self.services.cache);
        let topic = self.config.discovery_channel().to_string();
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.publish(&topic, payload).await {
                warn!(subscriber = %id, topic = %topic, error = %e, "Failed to announce subscription");
            } else {
                info!(subscriber = %id, topic = %topic, "Announced subscription for master pickup");
            }
        });
    }

    fn schedule_cache_refresh(self: &Arc<Self>) {
        if self.refresh_pending.swap(true, Ordering::AcqRel) {
            self.services.log_aggregator.record(
                "cache-refresh-coalesced",
                "Coalesced slave cache refresh requests",
            );
            return;
        }
        self.services
            .log_aggregator
            .record("cache-refresh-scheduled", "Scheduled slave cache refreshes");

        let inner = Arc::clone(self);
        let delay = self.config.cache_refresh_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.refresh_pending.store(false, Ordering::Release);

            let Some(record) = inner.read_cached_record().await else {
                debug!(subscriber = %inner.id, "Cache refresh found no snapshot");
                return;
            };

            let mut state = inner.state.lock().await;
            let trusted = state.has_state() && !state.is_invalid();
            if trusted && record.block_number < state.block_number() {
                debug!(
                    subscriber = %inner.id,
                    cached_block = record.block_number,
                    state_block = state.block_number(),
                    "Cached snapshot older than local state, ignoring"
                );
                return;
            }
            let block = record.block_number;
            inner.set_state(&mut state, Some(Arc::new(record.snapshot)), block);
            debug!(subscriber = %inner.id, block, "Adopted snapshot from cache refresh");
        });
    }

    fn schedule_self_heal(self: &Arc<Self>, block_number: u64) {
        warn!(subscriber = %self.id, block = block_number, "No state after update, scheduling self-heal");
        self.services.scheduler.submit(Arc::new(SelfHealJob {
            subscriber: Arc::downgrade(self),
            key: format!("self-heal:{}", self.id),
            block_number,
        }));
    }
}

/// Keeps regenerating a master's missing snapshot until it succeeds.
///
/// Finishes early when the subscriber is dropped, went inactive or obtained a
/// snapshot some other way.
struct SelfHealJob<P: Protocol> {
    subscriber: Weak<Inner<P>>,
    key: String,
    block_number: u64,
}

#[async_trait]
impl<P: Protocol> RetryableJob for SelfHealJob<P> {
    fn key(&self) -> String {
        self.key.clone()
    }

    async fn run(&self) -> bool {
        let Some(inner) = self.subscriber.upgrade() else {
            return true;
        };

        let mut state = inner.state.lock().await;
        if state.is_inactive() {
            info!(subscriber = %inner.id, "Self-heal stopped, subscriber is inactive");
            return true;
        }
        if state.has_state() {
            debug!(subscriber = %inner.id, "Self-heal not needed anymore");
            return true;
        }

        match inner.generate(self.block_number).await {
            Ok(fresh) => {
                inner.set_state(&mut state, Some(fresh), self.block_number);
                info!(subscriber = %inner.id, block = self.block_number, "Self-heal restored state");
                true
            }
            Err(_) => false,
        }
    }
}
