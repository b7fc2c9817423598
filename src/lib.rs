//! # DEX State Synchronization Engine
//!
//! Keeps versioned local snapshots of DEX pool state consistent with the chain
//! under asynchronous, at-least-once log delivery, chain reorganizations,
//! restarts and master/slave snapshot sharing.
//!
//! ## Features
//!
//! - **Generic over the protocol**: adapters implement [`sync::Protocol`]
//!   (`generate_state`, `process_log`), the engine does the rest
//! - **Bounded history** of per-block checkpoints, replay-safe folding
//! - **Reorg handling** through `invalidate`, `rollback` and `restart`
//! - **Master/slave cache bridge** with fire-and-forget publishing and
//!   coalesced slave refreshes
//! - **Self-heal** retries for masters left without a snapshot
//!
//! ## Architecture
//!
//! 1. **Data layer** ([`types`], [`history`]) - headers, identities, checkpoints
//! 2. **Engine layer** ([`sync`]) - state transitions, batches, lifecycle
//! 3. **Collaborators** ([`cache`], [`delivery`], [`scheduler`],
//!    [`log_aggregator`]) - boundaries to the outside world
//! 4. **Adapters** ([`pools`]) - Uniswap V2 reserves, toy counter
//! 5. **Drivers** ([`rpc`], [`reorg`], [`cli`]) - chain access and reorg detection
//!
//! ## Quick Start
//!
//! ```bash
//! # Offline master/slave simulation with a reorg
//! cargo run --release -- simulate --reorg-at 1010
//!
//! # Follow a Uniswap V2 pair
//! RPC_URL=https://... cargo run --release -- watch
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`error::SyncResult<T>`](error::SyncResult).
//! Cache failures are logged and never surface; generation and processing
//! failures are returned to the caller.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod history;
pub mod log_aggregator;
pub mod observability;
pub mod pools;
pub mod reorg;
pub mod rpc;
pub mod scheduler;
pub mod sync;
pub mod types;
