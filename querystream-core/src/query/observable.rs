//! Observable Queries
//!
//! An observable query is something a subscription can run over and over:
//! a synchronous fetch that turns the store's current rows into a result,
//! and a way to hear about changes that make that result stale.
//!
//! [`DescriptorQuery`] is the standard implementation, pairing a
//! [`FetchDescriptor`] with a pure [`Transform`]. It holds no mutable state,
//! so one value can back any number of concurrent subscriptions.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::descriptor::{Entity, FetchDescriptor};
use crate::error::StoreResult;
use crate::store::{Store, UpdateStream};

/// A pure function from fetched rows to a result.
///
/// Transforms run on worker threads, possibly for several subscriptions at
/// once, so they must not rely on shared mutable state.
pub type Transform<T, R> = Arc<dyn Fn(Vec<T>) -> R + Send + Sync>;

/// A query whose result can be recomputed whenever the store changes.
pub trait ObservableQuery<S: Store>: Send + Sync + 'static {
    /// The value produced by each fetch.
    type Output: Send + 'static;

    /// Load the current result from a fresh read context.
    fn fetch(&self, store: &S, cancel: &CancellationToken) -> StoreResult<Self::Output>;

    /// A stream that ticks whenever the result may have changed.
    ///
    /// Must be called on the store's registration context.
    fn make_updates_stream(&self, store: &S) -> StoreResult<UpdateStream>;
}

/// A [`FetchDescriptor`] paired with a transform of its rows.
pub struct DescriptorQuery<T, R> {
    descriptor: FetchDescriptor<T>,
    transform: Transform<T, R>,
}

impl<T: Entity, R> DescriptorQuery<T, R> {
    /// Pair `descriptor` with `transform`.
    pub fn new<F>(descriptor: FetchDescriptor<T>, transform: F) -> Self
    where
        F: Fn(Vec<T>) -> R + Send + Sync + 'static,
    {
        Self {
            descriptor,
            transform: Arc::new(transform),
        }
    }

    /// The descriptor each fetch executes.
    pub fn descriptor(&self) -> &FetchDescriptor<T> {
        &self.descriptor
    }
}

impl<T: Entity> DescriptorQuery<T, Vec<T>> {
    /// A query whose result is the fetched rows themselves.
    pub fn rows(descriptor: FetchDescriptor<T>) -> Self {
        Self::new(descriptor, |rows| rows)
    }
}

impl<T: Entity> DescriptorQuery<T, ()> {
    /// A query that only reports that something changed.
    pub fn changes(descriptor: FetchDescriptor<T>) -> Self {
        Self::new(descriptor, |_| ())
    }
}

impl<S, T, R> ObservableQuery<S> for DescriptorQuery<T, R>
where
    S: Store,
    T: Entity,
    R: Send + 'static,
{
    type Output = R;

    fn fetch(&self, store: &S, cancel: &CancellationToken) -> StoreResult<R> {
        let mut context = store.create_read_context()?;
        let rows = store.execute(&mut context, &self.descriptor, cancel)?;
        Ok((self.transform)(rows))
    }

    fn make_updates_stream(&self, store: &S) -> StoreResult<UpdateStream> {
        store.observe_changes(&self.descriptor.relevance_key())
    }
}

impl<T, R> Clone for DescriptorQuery<T, R> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T: Entity, R> fmt::Debug for DescriptorQuery<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorQuery")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
