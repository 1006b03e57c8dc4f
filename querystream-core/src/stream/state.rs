//! Subscription state and bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StreamError;

/// Unique identifier for a subscription.
///
/// Every call to `values()` gets a fresh ID, which tags the subscription's
/// tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a single subscription.
///
/// ```text
/// Idle ──first poll──▶ Subscribed ──failure──▶ Terminated(Err)
///   │                      │
///   │                   cancel
///   │                      ▼
///   └──────cancel───▶ Cancelling / Terminated(Ok)
/// ```
///
/// There is no way back to `Idle`: a subscription is single-use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Created but not yet polled; nothing is registered or running.
    Idle,

    /// The update signal is merged and the fetch loop is running.
    Subscribed,

    /// The consumer cancelled; waiting for the fetch loop to notice.
    Cancelling,

    /// The fetch loop has exited. `Ok` for cancellation or exhausted
    /// sources, `Err` for the failure that ended it.
    Terminated(Result<(), StreamError>),
}

impl SubscriptionState {
    /// Whether the fetch loop has exited.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Counters describing what a subscription has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Ticks taken from the merged update signal.
    pub ticks: u64,
    /// Fetches that completed, successfully or not.
    pub fetches: u64,
    /// Values stored in the output cell.
    pub published: u64,
    /// Published values that replaced an unread one.
    pub overwritten: u64,
    /// Fetch outcomes dropped because the consumer had cancelled.
    pub discarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        let id1 = SubscriptionId::new();
        let id2 = SubscriptionId::new();
        let id3 = SubscriptionId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn only_terminated_is_terminal() {
        assert!(!SubscriptionState::Idle.is_terminated());
        assert!(!SubscriptionState::Subscribed.is_terminated());
        assert!(!SubscriptionState::Cancelling.is_terminated());
        assert!(SubscriptionState::Terminated(Ok(())).is_terminated());
        let failed = SubscriptionState::Terminated(Err(StreamError::RegistrationClosed));
        assert!(failed.is_terminated());
    }
}
