//! Integration tests for the master/slave cache bridge and self-heal.
//!
//! # Test Strategy
//!
//! Masters and slaves talk through one [`InMemoryCache`]. Cache writes and
//! refreshes happen in detached tasks, so assertions poll with a short sleep
//! instead of relying on timing. Self-heal jobs are either captured by a
//! recording scheduler and run by hand, or left to a fast [`TokioScheduler`].

use alloy::primitives::{address, Address, B256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use dex_state_sync::{
    cache::{decode_record, encode_record, CacheRecord, InMemoryCache, SharedCache, LATEST_BLOCK_KEY},
    config::SyncConfig,
    delivery::SubscriptionRegistry,
    error::{SyncError, SyncResult},
    log_aggregator::LogAggregator,
    pools::counter::{Counter, CounterPool},
    scheduler::{JobScheduler, RetryableJob, TokioScheduler},
    sync::{InitOptions, StateSubscriber, SyncServices},
    types::{BlockHeader, BlockHeaders, Role, SubscriberId},
};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const POOL: Address = address!("00000000000000000000000000000000000000cc");
const GROUP: &str = "mainnet-counter";
const NAME: &str = "pool-cc";

/// Captures submitted jobs so tests decide when they run.
#[derive(Default)]
struct RecordingScheduler {
    jobs: Mutex<Vec<Arc<dyn RetryableJob>>>,
}

impl RecordingScheduler {
    fn jobs(&self) -> Vec<Arc<dyn RetryableJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl JobScheduler for RecordingScheduler {
    fn submit(&self, job: Arc<dyn RetryableJob>) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
    }
}

/// Cache whose every call fails.
struct FailingCache;

#[async_trait]
impl SharedCache for FailingCache {
    async fn get(&self, _group_key: &str, _name: &str) -> SyncResult<Option<String>> {
        Err(SyncError::cache("cache unreachable", None))
    }

    async fn set(
        &self,
        _group_key: &str,
        _name: &str,
        _value: String,
        _ttl: Option<Duration>,
    ) -> SyncResult<()> {
        Err(SyncError::cache("cache unreachable", None))
    }

    async fn publish(&self, _topic: &str, _payload: String) -> SyncResult<()> {
        Err(SyncError::cache("cache unreachable", None))
    }
}

struct Fixture {
    cache: Arc<InMemoryCache>,
    registry: Arc<SubscriptionRegistry>,
    aggregator: Arc<LogAggregator>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            cache: Arc::new(InMemoryCache::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            aggregator: Arc::new(LogAggregator::default()),
        }
    }

    fn services(&self, scheduler: Arc<dyn JobScheduler>) -> SyncServices {
        SyncServices::new(
            self.cache.clone(),
            self.registry.clone(),
            scheduler,
            self.aggregator.clone(),
        )
    }

    fn subscriber(&self, config: SyncConfig, pool: CounterPool) -> StateSubscriber<CounterPool> {
        self.subscriber_with(config, pool, Arc::new(TokioScheduler::default()))
    }

    fn subscriber_with(
        &self,
        config: SyncConfig,
        pool: CounterPool,
        scheduler: Arc<dyn JobScheduler>,
    ) -> StateSubscriber<CounterPool> {
        StateSubscriber::new(
            SubscriberId::new(GROUP, NAME),
            pool,
            config,
            self.services(scheduler),
        )
    }

    async fn seed(&self, block_number: u64, count: u64) {
        let record = encode_record(&CacheRecord::new(block_number, Counter { count }));
        if let Ok(raw) = record {
            self.cache.set(GROUP, NAME, raw, None).await.ok();
        }
    }

    async fn cached(&self) -> Option<CacheRecord<Counter>> {
        let raw = self.cache.get(GROUP, NAME).await.ok().flatten()?;
        decode_record(&raw).ok()
    }
}

fn master() -> SyncConfig {
    SyncConfig::default().with_share_cache(true)
}

fn slave() -> SyncConfig {
    SyncConfig::default()
        .with_role(Role::Slave)
        .with_share_cache(true)
        .with_cache_refresh_delay(Duration::from_millis(10))
}

fn batch(block: u64, count: u64) -> (Vec<Log>, BlockHeaders) {
    let logs = (0..count)
        .map(|index| {
            let mut log = Log {
                block_number: Some(block),
                log_index: Some(index),
                ..Default::default()
            };
            log.inner.address = POOL;
            log
        })
        .collect();
    let header = BlockHeader::new(block, B256::repeat_byte(2), B256::ZERO, block * 12);
    (logs, [(block, header)].into_iter().collect())
}

/// Poll `check` every 10ms for up to two seconds.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn snapshot(subscriber: &StateSubscriber<CounterPool>) -> Option<(u64, u64)> {
    let state = subscriber.get_stale_state().await?;
    Some((subscriber.state_block_number().await, state.count))
}

#[tokio::test]
async fn test_master_publishes_every_snapshot() {
    let fixture = Fixture::new();
    let master = fixture.subscriber(master(), CounterPool::new(POOL));

    assert!(master
        .initialize(100, InitOptions::with_state(Counter { count: 3 }))
        .await
        .is_ok());
    assert!(
        eventually(|| async { fixture.cached().await == Some(CacheRecord::new(100, Counter { count: 3 })) })
            .await
    );

    let (logs, headers) = batch(101, 2);
    assert!(master.update(&logs, &headers).await.is_ok());
    assert!(
        eventually(|| async { fixture.cached().await == Some(CacheRecord::new(101, Counter { count: 5 })) })
            .await
    );
}

#[tokio::test]
async fn test_master_without_sharing_never_publishes() {
    let fixture = Fixture::new();
    let master = fixture.subscriber(SyncConfig::default(), CounterPool::new(POOL));

    assert!(master.initialize(100, InitOptions::default()).await.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(fixture.cache.is_empty());
}

/// A slave adopts the cached snapshot even when it is older than requested and
/// registers from the fleet's latest block.
#[tokio::test]
async fn test_slave_init_adopts_cached_snapshot() {
    let fixture = Fixture::new();
    fixture.seed(90, 9).await;
    fixture
        .cache
        .set(GROUP, LATEST_BLOCK_KEY, "120".to_string(), None)
        .await
        .ok();

    let pool = CounterPool::new(POOL);
    let slave = fixture.subscriber(slave(), pool);
    assert!(slave.initialize(100, InitOptions::default()).await.is_ok());

    assert_eq!(snapshot(&slave).await, Some((90, 9)));
    assert_eq!(slave.protocol().generations(), 0);
    assert!(slave.get_state(100).await.is_none());

    let registration = fixture.registry.registration_for(slave.id());
    assert_eq!(registration.map(|r| r.from_block), Some(120));
}

#[tokio::test]
async fn test_slave_init_baseline_falls_back_to_record_block() {
    let fixture = Fixture::new();
    fixture.seed(90, 9).await;

    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave.initialize(100, InitOptions::default()).await.is_ok());

    let registration = fixture.registry.registration_for(slave.id());
    assert_eq!(registration.map(|r| r.from_block), Some(90));
}

#[tokio::test]
async fn test_slave_forced_regeneration_skips_cache() {
    let fixture = Fixture::new();
    fixture.seed(90, 9).await;

    let slave = fixture.subscriber(slave(), CounterPool::new(POOL).with_initial(4));
    assert!(slave.initialize(100, InitOptions::regenerate()).await.is_ok());

    assert_eq!(snapshot(&slave).await, Some((100, 4)));
    assert_eq!(slave.protocol().generations(), 1);
}

#[tokio::test]
async fn test_slave_miss_generates_and_announces() {
    let fixture = Fixture::new();
    let mut announcements = fixture.cache.subscribe();

    let config = slave();
    let topic = config.discovery_channel().to_string();
    let slave = fixture.subscriber(config, CounterPool::new(POOL).with_initial(2));
    assert!(slave.initialize(100, InitOptions::default()).await.is_ok());
    assert_eq!(snapshot(&slave).await, Some((100, 2)));

    let received = tokio::time::timeout(Duration::from_secs(2), announcements.recv()).await;
    assert!(matches!(received, Ok(Ok(_))), "no discovery announcement received");
    let Ok(Ok((published_topic, payload))) = received else {
        return;
    };
    assert_eq!(published_topic, topic);

    let json: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
    assert_eq!(json["groupKey"], GROUP);
    assert_eq!(json["name"], NAME);
    assert_eq!(json["blockNumber"], 100);
    assert_eq!(json["identifier"]["kind"], "counter");

    let registration = fixture.registry.registration_for(slave.id());
    assert_eq!(registration.map(|r| r.from_block), Some(100));
}

/// A restart dropping a slave's snapshot is answered from the cache.
#[tokio::test]
async fn test_slave_restart_refreshes_from_cache() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 1 }))
        .await
        .is_ok());

    fixture.seed(110, 7).await;
    slave.restart(105).await;

    assert!(eventually(|| async { snapshot(&slave).await == Some((110, 7)) }).await);
    assert_eq!(slave.protocol().generations(), 0);
}

/// A rewound master snapshot is written back to the cache, so slaves stop
/// seeing the reorged-out block.
#[tokio::test]
async fn test_master_republishes_rolled_back_snapshot() {
    let fixture = Fixture::new();
    let master = fixture.subscriber(master(), CounterPool::new(POOL));
    assert!(master
        .initialize(90, InitOptions::with_state(Counter { count: 0 }))
        .await
        .is_ok());
    for block in [95, 100] {
        let (logs, headers) = batch(block, 1);
        assert!(master.update(&logs, &headers).await.is_ok());
    }
    assert!(
        eventually(|| async { fixture.cached().await == Some(CacheRecord::new(100, Counter { count: 2 })) })
            .await
    );

    master.invalidate().await;
    master.rollback(97).await;

    assert!(!master.is_invalid().await);
    assert_eq!(master.get_state(95).await.map(|s| s.count), Some(1));
    assert!(
        eventually(|| async { fixture.cached().await == Some(CacheRecord::new(95, Counter { count: 1 })) })
            .await
    );
}

/// With nothing left to rewind to, a slave keeps its untrusted snapshot and
/// takes the master's rewound record even though it is older.
#[tokio::test]
async fn test_slave_rollback_without_checkpoint_adopts_rewound_record() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 4 }))
        .await
        .is_ok());

    fixture.seed(95, 1).await;
    slave.invalidate().await;
    slave.rollback(97).await;

    assert_eq!(snapshot(&slave).await, Some((100, 4)));
    assert!(slave.get_state(0).await.is_none());

    assert!(eventually(|| async { snapshot(&slave).await == Some((95, 1)) }).await);
    assert!(!slave.is_invalid().await);
}

#[tokio::test]
async fn test_restart_without_snapshot_skips_refresh() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL).failing(1));
    assert!(slave.initialize(100, InitOptions::default()).await.is_err());

    slave.restart(150).await;

    assert_eq!(fixture.aggregator.pending_count("cache-refresh-scheduled"), 0);
    assert_eq!(fixture.aggregator.pending_count("cache-refresh-coalesced"), 0);
}

#[tokio::test]
async fn test_slave_null_write_keeps_local_snapshot() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 1 }))
        .await
        .is_ok());

    slave.set_state(None, 120).await;

    assert_eq!(snapshot(&slave).await, Some((100, 1)));
}

#[tokio::test]
async fn test_slave_refresh_ignores_older_record() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 1 }))
        .await
        .is_ok());

    fixture.seed(95, 9).await;
    slave.set_state(None, 120).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(snapshot(&slave).await, Some((100, 1)));
}

#[tokio::test]
async fn test_slave_refresh_adopts_newer_record() {
    let fixture = Fixture::new();
    let slave = fixture.subscriber(slave(), CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 1 }))
        .await
        .is_ok());

    fixture.seed(130, 12).await;
    slave.set_state(None, 120).await;

    assert!(eventually(|| async { snapshot(&slave).await == Some((130, 12)) }).await);
}

#[tokio::test]
async fn test_slave_refresh_requests_coalesce() {
    let fixture = Fixture::new();
    let config = slave().with_cache_refresh_delay(Duration::from_millis(500));
    let slave = fixture.subscriber(config, CounterPool::new(POOL));
    assert!(slave
        .initialize(100, InitOptions::with_state(Counter { count: 1 }))
        .await
        .is_ok());

    for block in [101, 102, 103] {
        slave.set_state(None, block).await;
    }

    assert_eq!(fixture.aggregator.pending_count("cache-refresh-scheduled"), 1);
    assert_eq!(fixture.aggregator.pending_count("cache-refresh-coalesced"), 2);
}

#[tokio::test]
async fn test_cache_failures_never_surface() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let services = SyncServices::new(
        Arc::new(FailingCache),
        registry.clone(),
        Arc::new(TokioScheduler::default()),
        Arc::new(LogAggregator::default()),
    );

    let master = StateSubscriber::new(
        SubscriberId::new(GROUP, "master"),
        CounterPool::new(POOL),
        master(),
        services.clone(),
    );
    assert!(master.initialize(100, InitOptions::default()).await.is_ok());
    let (logs, headers) = batch(101, 1);
    assert!(master.update(&logs, &headers).await.is_ok());
    assert_eq!(snapshot(&master).await, Some((101, 1)));

    let slave = StateSubscriber::new(
        SubscriberId::new(GROUP, "slave"),
        CounterPool::new(POOL),
        slave(),
        services,
    );
    assert!(slave.initialize(100, InitOptions::default()).await.is_ok());
    assert_eq!(snapshot(&slave).await, Some((100, 0)));
    slave.restart(150).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(snapshot(&slave).await, Some((100, 0)));

    assert_eq!(registry.registrations().len(), 2);
}

/// Generation keeps failing through `initialize` and `update`; the self-heal
/// job recovers once the source is back.
#[tokio::test]
async fn test_master_self_heal_recovers() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let master = fixture.subscriber_with(
        SyncConfig::default(),
        CounterPool::new(POOL).with_initial(5).failing(3),
        scheduler.clone(),
    );

    let init = master.initialize(100, InitOptions::default()).await;
    assert!(matches!(init, Err(SyncError::GenerationError { .. })));
    assert!(fixture.registry.registrations().is_empty());

    let (logs, headers) = batch(101, 1);
    let update = master.update(&logs, &headers).await;
    assert!(matches!(update, Err(SyncError::GenerationError { .. })));
    assert!(master.get_stale_state().await.is_none());

    let jobs = scheduler.jobs();
    assert_eq!(jobs.len(), 1);
    let Some(job) = jobs.first() else {
        return;
    };
    assert_eq!(job.key(), format!("self-heal:{GROUP}/{NAME}"));

    assert!(!job.run().await);
    assert!(master.get_stale_state().await.is_none());

    assert!(job.run().await);
    assert_eq!(snapshot(&master).await, Some((101, 5)));
    assert_eq!(master.protocol().generations(), 4);

    // Nothing left to heal.
    assert!(job.run().await);
    assert_eq!(master.protocol().generations(), 4);
}

#[tokio::test]
async fn test_master_self_heal_with_tokio_scheduler() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(TokioScheduler::new(
        Duration::from_millis(5),
        Duration::from_millis(20),
    ));
    let master = fixture.subscriber_with(
        master(),
        CounterPool::new(POOL).with_initial(8).failing(4),
        scheduler.clone(),
    );

    let (logs, headers) = batch(200, 1);
    assert!(master.update(&logs, &headers).await.is_err());

    assert!(eventually(|| async { snapshot(&master).await == Some((200, 8)) }).await);
    assert!(eventually(|| async { scheduler.running_count() == 0 }).await);

    // The healed snapshot is published like any other.
    assert!(
        eventually(|| async { fixture.cached().await == Some(CacheRecord::new(200, Counter { count: 8 })) })
            .await
    );
}

#[tokio::test]
async fn test_self_heal_stops_when_inactive() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let master = fixture.subscriber_with(
        SyncConfig::default(),
        CounterPool::new(POOL).failing(10),
        scheduler.clone(),
    );

    let (logs, headers) = batch(101, 1);
    assert!(master.update(&logs, &headers).await.is_err());
    master.inactivate().await;

    let jobs = scheduler.jobs();
    assert_eq!(jobs.len(), 1);
    for job in &jobs {
        assert!(job.run().await);
    }
    assert!(master.get_stale_state().await.is_none());
    assert_eq!(master.protocol().generations(), 1);
}

#[tokio::test]
async fn test_self_heal_finishes_when_subscriber_dropped() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let master = fixture.subscriber_with(
        SyncConfig::default(),
        CounterPool::new(POOL).failing(10),
        scheduler.clone(),
    );

    let (logs, headers) = batch(101, 1);
    assert!(master.update(&logs, &headers).await.is_err());
    drop(master);

    for job in &scheduler.jobs() {
        assert!(job.run().await);
    }
}

#[tokio::test]
async fn test_slave_never_schedules_self_heal() {
    let fixture = Fixture::new();
    let scheduler = Arc::new(RecordingScheduler::default());
    let slave = fixture.subscriber_with(slave(), CounterPool::new(POOL).failing(10), scheduler.clone());

    assert!(slave.initialize(100, InitOptions::default()).await.is_err());
    let (logs, headers) = batch(101, 1);
    assert!(slave.update(&logs, &headers).await.is_err());

    assert!(scheduler.jobs().is_empty());
}
