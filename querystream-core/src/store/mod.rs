//! Persistent Store Interface
//!
//! The store is an external collaborator: querystream never owns its schema,
//! transactions or on-disk format. It needs exactly three things from it:
//!
//! - a cheap, side-effect-free read context per fetch,
//! - execution of a [`FetchDescriptor`] within that context,
//! - a long-lived stream of change notifications for a [`RelevanceKey`].
//!
//! Change streams must be created on whatever thread the store designates
//! for observer registration. Subscriptions route that call through a
//! [`RegistrationContext`](crate::dispatch::RegistrationContext).
//!
//! [`MemoryStore`] is an in-process implementation used by the tests and
//! suitable for hosts that keep their data in memory.

pub mod memory;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StoreResult;
use crate::query::{Entity, FetchDescriptor, RelevanceKey};

pub use memory::{MemoryReadContext, MemoryStore, Revision, RowId, Transaction};

/// A payload-free "re-evaluate now" signal.
///
/// The variant records where the tick came from; it never changes what a
/// subscription does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The synthetic first tick of every subscription.
    InitialLoad,
    /// The store reported a relevant change.
    Changed,
}

/// A stream of update ticks. An `Err` item means the source is unusable.
pub type UpdateStream = BoxStream<'static, StoreResult<Tick>>;

/// The persistent store a subscription reads from and observes.
pub trait Store: Send + Sync + 'static {
    /// Short-lived read handle opened for each fetch.
    type ReadContext: Send;

    /// Open a read context. Must be cheap and free of side effects.
    fn create_read_context(&self) -> StoreResult<Self::ReadContext>;

    /// Execute `descriptor` within `context`, returning rows in order.
    ///
    /// Stores that can abort a running fetch should watch `cancel` and
    /// return [`StoreError::Cancelled`](crate::error::StoreError::Cancelled).
    fn execute<T: Entity>(
        &self,
        context: &mut Self::ReadContext,
        descriptor: &FetchDescriptor<T>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<T>>;

    /// Start observing mutations relevant to `key`.
    ///
    /// Called on the store's registration context. The stream should stay
    /// open for as long as the store is usable.
    fn observe_changes(&self, key: &RelevanceKey) -> StoreResult<UpdateStream>;
}
