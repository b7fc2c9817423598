//! The generic state synchronization engine.
//!
//! A [`StateSubscriber`] keeps a versioned local snapshot of one venue
//! consistent with the chain under asynchronous, at-least-once log delivery,
//! reorganizations, restarts and master/slave cache sharing. Protocols plug in
//! through the [`Protocol`] trait.
//!
//! ## Layers
//!
//! 1. **State** ([`state`]) - history, current pointer, flags, reorg rules
//! 2. **Batch** ([`batch`]) - log partitioning and ordering validation
//! 3. **Protocol** ([`protocol`]) - snapshot generation and log folding
//! 4. **Engine** ([`engine`]) - lifecycle, `update`, cache bridge, self-heal
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Tracking <--invalidate/update--> Stale
//!                                   |
//!                               inactivate
//!                                   v
//!                               Inactive
//! ```

pub mod batch;
pub mod engine;
pub mod protocol;
pub mod state;

pub use batch::{partition_runs, validate_batch, BatchPolicy, BatchViolation, LogRun};
pub use engine::{InitOptions, StateSubscriber, SyncServices};
pub use protocol::Protocol;
pub use state::{Rewind, SyncState};
