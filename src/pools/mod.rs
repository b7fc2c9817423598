//! Protocol adapters.
//!
//! - [`uniswap_v2`]: pair reserves from `Sync` events
//! - [`counter`]: log counter for simulations and tests

pub mod counter;
pub mod uniswap_v2;
