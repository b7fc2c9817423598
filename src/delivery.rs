//! Boundary with the external log delivery service.
//!
//! The delivery service watches the chain, pushes ordered log batches into
//! subscribers and tells them about reorganizations. The engine calls back into
//! it exactly once per `initialize`, to register which addresses it wants logs
//! for and from which block.

use alloy::primitives::Address;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::SyncResult;
use crate::types::SubscriberId;

/// One subscriber's log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Subscriber identity
    pub subscriber: SubscriberId,
    /// Contract addresses to deliver logs for
    pub addresses: Vec<Address>,
    /// First block the subscriber needs logs after
    pub from_block: u64,
}

/// Log routing layer as seen by the engine.
pub trait LogDelivery: Send + Sync {
    /// Register `subscriber` for logs emitted by `addresses` after `from_block`.
    ///
    /// # Errors
    ///
    /// Returns a delivery error when the registration is rejected.
    fn subscribe_to_logs(
        &self,
        subscriber: &SubscriberId,
        addresses: &[Address],
        from_block: u64,
    ) -> SyncResult<()>;
}

/// In-memory [`LogDelivery`] that records registrations.
///
/// Drivers that fetch logs themselves (the CLI `watch` loop, tests) read the
/// registrations back to build their log filters.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    registrations: Mutex<Vec<Registration>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All registrations in arrival order.
    #[must_use]
    pub fn registrations(&self) -> Vec<Registration> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest registration of `subscriber`, if any.
    #[must_use]
    pub fn registration_for(&self, subscriber: &SubscriberId) -> Option<Registration> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|r| &r.subscriber == subscriber)
            .cloned()
    }
}

impl LogDelivery for SubscriptionRegistry {
    fn subscribe_to_logs(
        &self,
        subscriber: &SubscriberId,
        addresses: &[Address],
        from_block: u64,
    ) -> SyncResult<()> {
        debug!(
            subscriber = %subscriber,
            addresses = addresses.len(),
            from_block,
            "Registering log subscription"
        );
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                subscriber: subscriber.clone(),
                addresses: addresses.to_vec(),
                from_block,
            });
        Ok(())
    }
}
