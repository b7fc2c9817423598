//! Command-line interface.
//!
//! # Commands
//!
//! - `simulate`: offline master + slaves over an in-memory cache, with a
//!   synthetic reorg, printing every subscriber's counter per block
//! - `watch`: follow a Uniswap V2 pair over RPC, reacting to reorgs
//! - `config`: print the resolved configuration
//!
//! ```bash
//! dex-state-sync simulate --blocks 30 --slaves 3 --reorg-at 20
//! RPC_URL=https://... dex-state-sync watch --interval 12
//! ```

use alloy::primitives::{address, Address, B256};
use alloy::rpc::types::Log;
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures_util::future::join_all;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::{publish_latest_block, InMemoryCache, SharedCache};
use crate::config::{RpcConfig, SyncConfig};
use crate::delivery::SubscriptionRegistry;
use crate::error::{SyncError, SyncResult};
use crate::log_aggregator::LogAggregator;
use crate::pools::counter::{Counter, CounterPool};
use crate::pools::uniswap_v2::UniswapV2Pool;
use crate::reorg::{ChainEvent, ChainTracker};
use crate::rpc::{create_provider, fetch_header, fetch_headers, get_latest_block, Provider};
use crate::scheduler::TokioScheduler;
use crate::sync::{InitOptions, StateSubscriber, SyncServices};
use crate::types::{BlockHeader, BlockHeaders, Role, SubscriberId};

/// Blocks per RPC batch (Alchemy free tier limit).
const BATCH_SIZE: u64 = 10;

/// Address the simulated counter pool emits logs from.
const SIMULATED_POOL: Address = address!("c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0c0");

/// DEX state synchronization engine
#[derive(Parser, Debug)]
#[command(name = "dex-state-sync")]
#[command(about = "Keeps DEX pool snapshots in sync with the chain", long_about = None)]
#[command(version)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an offline master/slave simulation with a synthetic reorg
    Simulate {
        /// Number of blocks to simulate
        #[arg(short, long, default_value = "20")]
        blocks: u64,

        /// Number of slave subscribers
        #[arg(short, long, default_value = "2")]
        slaves: usize,

        /// Block at which the chain reorganizes (replacing it and its parent)
        #[arg(short, long)]
        reorg_at: Option<u64>,
    },

    /// Follow a Uniswap V2 pair over RPC
    Watch {
        /// Polling interval in seconds
        #[arg(short, long, default_value = "12")]
        interval: u64,

        /// Initialization block (default: latest)
        #[arg(short, long)]
        start_block: Option<u64>,

        /// Skip ahead with a restart when further behind than this
        #[arg(short, long, default_value = "500")]
        max_catch_up: u64,
    },

    /// Print the resolved configuration
    Config,
}

/// Parse CLI arguments and execute the selected command.
///
/// # Errors
///
/// Returns configuration, RPC and engine errors of the command.
pub async fn run() -> SyncResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            blocks,
            slaves,
            reorg_at,
        } => run_simulate_command(blocks, slaves, reorg_at).await,
        Commands::Watch {
            interval,
            start_block,
            max_catch_up,
        } => run_watch_command(interval, start_block, max_catch_up).await,
        Commands::Config => run_config_command(),
    }
}

/// Final state of a simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// Last simulated block
    pub final_block: u64,
    /// Master's final counter
    pub master: Option<Counter>,
    /// Each slave's final counter
    pub slaves: Vec<Option<Counter>>,
    /// Reorgs detected by the chain tracker
    pub reorgs: u64,
}

impl SimulationReport {
    /// Whether every slave ended on the master's snapshot.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.master.is_some() && self.slaves.iter().all(|s| *s == self.master)
    }
}

async fn run_simulate_command(blocks: u64, slaves: usize, reorg_at: Option<u64>) -> SyncResult<()> {
    println!("{}", "Simulating master/slave synchronization...".cyan().bold());
    println!();

    let config = SyncConfig::from_env()?.with_share_cache(true);
    let report = simulate(&config, 1_000, blocks, slaves, reorg_at, true).await?;

    println!();
    if report.converged() {
        println!(
            "{} all {} slaves match the master at block {} ({} reorgs)",
            "✅".green(),
            report.slaves.len(),
            report.final_block.to_string().yellow(),
            report.reorgs
        );
    } else {
        println!(
            "{} slaves diverged from the master at block {}",
            "⚠️".red(),
            report.final_block.to_string().yellow()
        );
    }
    Ok(())
}

/// Drive a counter master and `slave_count` slaves over a synthetic chain.
///
/// Blocks `start + 1 ..= start + blocks` carry a deterministic number of logs.
/// With `reorg_at`, that block and its parent are replaced by a sibling branch
/// right after being processed, and every subscriber is invalidated and rolled
/// back before the new branch is delivered.
///
/// # Errors
///
/// Returns the first engine error.
pub async fn simulate(
    config: &SyncConfig,
    start: u64,
    blocks: u64,
    slave_count: usize,
    reorg_at: Option<u64>,
    print: bool,
) -> SyncResult<SimulationReport> {
    let cache = Arc::new(InMemoryCache::new());
    let aggregator = Arc::new(LogAggregator::new(config.log_aggregation_window()));
    let _flusher = aggregator.spawn_flusher();
    let services = SyncServices::new(
        cache.clone(),
        Arc::new(SubscriptionRegistry::new()),
        Arc::new(TokioScheduler::new(
            config.self_heal_initial_delay(),
            config.self_heal_max_delay(),
        )),
        aggregator.clone(),
    );
    let id = SubscriberId::new("simulation", "counter");

    let master = StateSubscriber::new(
        id.clone(),
        CounterPool::new(SIMULATED_POOL),
        config.clone().with_role(Role::Master),
        services.clone(),
    );
    master.initialize(start, InitOptions::default()).await?;
    publish_latest_block(cache.as_ref(), &id.group_key, start).await?;
    // Let the detached cache write land before slaves look for it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let slaves: Vec<_> = (0..slave_count)
        .map(|_| {
            StateSubscriber::new(
                id.clone(),
                CounterPool::new(SIMULATED_POOL),
                config.clone().with_role(Role::Slave),
                services.clone(),
            )
        })
        .collect();
    for result in join_all(
        slaves
            .iter()
            .map(|s| s.initialize(start, InitOptions::default())),
    )
    .await
    {
        result?;
    }

    let mut subscribers = vec![master.clone()];
    subscribers.extend(slaves.iter().cloned());

    let mut tracker = ChainTracker::default();
    tracker.observe(synthetic_header(start, 0, 0));
    let mut branch: u8 = 0;

    for number in start + 1..=start + blocks {
        deliver_block(&subscribers, &mut tracker, synthetic_header(number, branch, branch), branch)
            .await?;
        publish_latest_block(cache.as_ref(), &id.group_key, number).await?;

        if reorg_at == Some(number) && number >= start + 2 {
            let replaced = number - 1;
            let fork = branch.wrapping_add(1);
            let sibling = synthetic_header(replaced, fork, branch);

            if let ChainEvent::Reorg { fork_point, depth } = tracker.observe(sibling) {
                if print {
                    println!(
                        "{} reorg at block {}, rolling back {} blocks to {}",
                        "🔀".magenta(),
                        replaced,
                        depth,
                        fork_point
                    );
                }
                for subscriber in &subscribers {
                    subscriber.invalidate().await;
                    subscriber.rollback(fork_point).await;
                }
                deliver_block(&subscribers, &mut tracker, sibling, fork).await?;
                deliver_block(&subscribers, &mut tracker, synthetic_header(number, fork, fork), fork)
                    .await?;
                branch = fork;
            }
        }

        if print {
            print_simulation_row(number, &subscribers).await;
        }
    }

    let mut slave_states = Vec::with_capacity(slaves.len());
    for slave in &slaves {
        slave_states.push(slave.get_stale_state().await.map(|s| *s));
    }
    aggregator.flush();

    Ok(SimulationReport {
        final_block: start + blocks,
        master: master.get_stale_state().await.map(|s| *s),
        slaves: slave_states,
        reorgs: tracker.reorg_count(),
    })
}

async fn deliver_block(
    subscribers: &[StateSubscriber<CounterPool>],
    tracker: &mut ChainTracker,
    header: BlockHeader,
    fork: u8,
) -> SyncResult<()> {
    if let ChainEvent::Unlinked { number } = tracker.observe(header) {
        warn!(number, "Synthetic header does not link, delivering anyway");
    }
    let headers: BlockHeaders = [(header.number, header)].into_iter().collect();
    let logs = synthetic_logs(&header, fork);
    for subscriber in subscribers {
        subscriber.update(&logs, &headers).await?;
    }
    Ok(())
}

/// Deterministic header of block `number` on branch `fork`, child of the
/// same block's parent on branch `parent_fork`.
fn synthetic_header(number: u64, fork: u8, parent_fork: u8) -> BlockHeader {
    BlockHeader::new(
        number,
        synthetic_hash(number, fork),
        synthetic_hash(number.saturating_sub(1), parent_fork),
        1_700_000_000 + number * 12,
    )
}

fn synthetic_hash(number: u64, fork: u8) -> B256 {
    let mut bytes = [fork; 32];
    bytes[..8].copy_from_slice(&number.to_be_bytes());
    B256::from(bytes)
}

/// Zero to three counter logs, depending on block and branch.
fn synthetic_logs(header: &BlockHeader, fork: u8) -> Vec<Log> {
    let count = (header.number * 7 + u64::from(fork) * 5) % 4;
    (0..count)
        .map(|index| {
            let mut log = Log {
                block_hash: Some(header.hash),
                block_number: Some(header.number),
                block_timestamp: Some(header.timestamp),
                log_index: Some(index),
                ..Default::default()
            };
            log.inner.address = SIMULATED_POOL;
            log
        })
        .collect()
}

async fn print_simulation_row(number: u64, subscribers: &[StateSubscriber<CounterPool>]) {
    let mut counts = Vec::with_capacity(subscribers.len());
    for subscriber in subscribers {
        counts.push(subscriber.get_stale_state().await.map(|s| s.count));
    }

    let master = counts.first().copied().flatten();
    let cells: Vec<String> = counts
        .iter()
        .enumerate()
        .map(|(i, count)| {
            let label = if i == 0 { "master".to_string() } else { format!("slave{i}") };
            let text = count.map_or_else(|| "-".to_string(), |c| c.to_string());
            if *count == master {
                format!("{label}={}", text.green())
            } else {
                format!("{label}={}", text.red())
            }
        })
        .collect();

    println!(
        "{} Block: {} | {}",
        chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
        number.to_string().yellow(),
        cells.join(" ")
    );
}

async fn run_watch_command(
    interval: u64,
    start_block: Option<u64>,
    max_catch_up: u64,
) -> SyncResult<()> {
    info!("Starting watch mode");
    println!("{}", "🔍 Watching pool reserves...".cyan().bold());
    println!();

    let config = SyncConfig::from_env()?;
    let rpc_config = RpcConfig::from_env()?;
    let provider = create_provider(rpc_config.rpc_url()).await?;
    let pool_address = Address::from_str(rpc_config.pool_address()).map_err(|e| {
        SyncError::config(
            format!("Invalid POOL_ADDRESS {}", rpc_config.pool_address()),
            Some(Box::new(e)),
        )
    })?;

    let cache = Arc::new(InMemoryCache::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let aggregator = Arc::new(LogAggregator::new(config.log_aggregation_window()));
    let _flusher = aggregator.spawn_flusher();
    let services = SyncServices::new(
        cache.clone(),
        registry.clone(),
        Arc::new(TokioScheduler::new(
            config.self_heal_initial_delay(),
            config.self_heal_max_delay(),
        )),
        aggregator.clone(),
    );
    let id = SubscriberId::new("mainnet", format!("uniswap-v2-{pool_address}"));
    let subscriber = StateSubscriber::new(
        id.clone(),
        UniswapV2Pool::new(
            provider.clone(),
            pool_address,
            rpc_config.generation_lookback_blocks(),
        ),
        config,
        services,
    );

    let latest_block = get_latest_block(&provider).await?;
    let start = start_block.unwrap_or(latest_block);
    subscriber.initialize(start, InitOptions::default()).await?;

    let mut last_processed = registry
        .registration_for(&id)
        .map_or(start, |r| r.from_block);
    let mut tracker = ChainTracker::default();
    tracker.observe(fetch_header(&provider, last_processed).await?);
    info!(from_block = last_processed, "Following chain");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                println!();
                println!("{}", "🛑 Shutting down...".yellow().bold());
                subscriber.inactivate().await;
                aggregator.flush();
                println!("{} Last processed block: {}", "📍".cyan(), last_processed);
                break;
            }

            () = tokio::time::sleep(Duration::ZERO) => {
                if let Err(e) = process_new_blocks(
                    &provider,
                    &subscriber,
                    cache.as_ref(),
                    &mut tracker,
                    &mut last_processed,
                    max_catch_up,
                )
                .await
                {
                    error!(error = %e, "Error processing blocks");
                    println!("{} {}", "⚠️  Error:".red().bold(), e);
                }
                debug!(interval, "Waiting for next poll");
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }
    }

    Ok(())
}

/// Deliver everything after `last_processed` to the subscriber.
async fn process_new_blocks(
    provider: &Provider,
    subscriber: &StateSubscriber<UniswapV2Pool>,
    cache: &dyn SharedCache,
    tracker: &mut ChainTracker,
    last_processed: &mut u64,
    max_catch_up: u64,
) -> SyncResult<()> {
    let latest = get_latest_block(provider).await?;
    if latest <= *last_processed {
        debug!(latest, last = *last_processed, "No new blocks");
        return Ok(());
    }

    if latest - *last_processed > max_catch_up {
        warn!(
            behind = latest - *last_processed,
            max_catch_up, "Too far behind, restarting at latest block"
        );
        subscriber.restart(latest).await;
        tracker.reset();
        *last_processed = latest - 1;
    }

    let mut from = *last_processed + 1;
    while from <= latest {
        let to = std::cmp::min(from + BATCH_SIZE - 1, latest);
        let headers = fetch_headers(provider, from, to).await?;

        for header in headers.values() {
            match tracker.observe(*header) {
                ChainEvent::Extended | ChainEvent::Known => {}
                ChainEvent::Reorg { fork_point, .. } => {
                    rewind_to(subscriber, tracker, last_processed, fork_point).await;
                    return Ok(());
                }
                ChainEvent::Unlinked { number } => {
                    let oldest = tracker.oldest().unwrap_or(number);
                    let canonical = fetch_headers(provider, oldest, number.saturating_sub(1)).await?;
                    match tracker.fork_point_against(&canonical) {
                        Some(fork_point) => {
                            tracker.note_reorg();
                            rewind_to(subscriber, tracker, last_processed, fork_point).await;
                            return Ok(());
                        }
                        None => {
                            warn!(number, "No common ancestor tracked, restarting");
                            subscriber.restart(number).await;
                            tracker.reset();
                            *last_processed = number.saturating_sub(1);
                            return Ok(());
                        }
                    }
                }
            }
        }

        let logs = subscriber.protocol().fetch_sync_logs(from, to).await?;
        subscriber.update(&logs, &headers).await?;
        publish_latest_block(cache, &subscriber.id().group_key, to).await?;

        if !logs.is_empty() {
            print_reserves_row(subscriber, logs.len()).await;
        }
        *last_processed = to;
        from = to + 1;
    }

    Ok(())
}

async fn rewind_to(
    subscriber: &StateSubscriber<UniswapV2Pool>,
    tracker: &mut ChainTracker,
    last_processed: &mut u64,
    fork_point: u64,
) {
    println!(
        "{} reorg detected, rolling back to block {}",
        "🔀".magenta(),
        fork_point.to_string().yellow()
    );
    tracker.rewind(fork_point);
    subscriber.invalidate().await;
    subscriber.rollback(fork_point).await;
    *last_processed = fork_point;
}

async fn print_reserves_row(subscriber: &StateSubscriber<UniswapV2Pool>, events: usize) {
    let block = subscriber.state_block_number().await;
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    match subscriber.get_stale_state().await {
        Some(reserves) => println!(
            "{} {} Block: {} | reserve0: {} | reserve1: {} | events: {}",
            "📊".cyan(),
            timestamp.to_string().dimmed(),
            block.to_string().yellow(),
            reserves.reserve0.to_string().blue(),
            reserves.reserve1.to_string().magenta(),
            events
        ),
        None => println!(
            "{} {} Block: {} | {}",
            "📊".cyan(),
            timestamp.to_string().dimmed(),
            block.to_string().yellow(),
            "no state, self-heal pending".red()
        ),
    }
}

fn run_config_command() -> SyncResult<()> {
    let config = SyncConfig::from_env()?;

    println!("{}", "Engine".cyan().bold());
    println!("  role:                 {}", config.role());
    println!("  share cache:          {}", config.share_cache());
    println!("  retention window:     {} blocks", config.retention_window());
    println!("  cache ttl:            {:?}", config.cache_ttl());
    println!("  cache refresh delay:  {:?}", config.cache_refresh_delay());
    println!("  log aggregation:      {:?}", config.log_aggregation_window());
    println!("  batch policy:         {:?}", config.batch_policy());
    println!(
        "  self-heal backoff:    {:?} .. {:?}",
        config.self_heal_initial_delay(),
        config.self_heal_max_delay()
    );
    println!("  discovery channel:    {}", config.discovery_channel());

    println!("{}", "RPC".cyan().bold());
    match RpcConfig::from_env() {
        Ok(rpc) => {
            let host = rpc.rpc_url().split("/v2/").next().unwrap_or("unknown");
            println!("  endpoint:             {host}");
            println!("  pool:                 {}", rpc.pool_address());
            println!(
                "  generation lookback:  {} blocks",
                rpc.generation_lookback_blocks()
            );
        }
        Err(e) => println!("  {}", e.to_string().yellow()),
    }
    Ok(())
}
