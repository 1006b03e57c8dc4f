//! Fetch Stream Controller
//!
//! The controller turns an [`ObservableQuery`] into a [`ResultStream`]: a
//! stream that yields the query's result once up front and again after every
//! relevant store change.
//!
//! # How It Works
//!
//! 1. `values(store)` hands back an idle [`ResultStream`]. Nothing runs yet.
//!
//! 2. On the first poll a background task starts. It registers for change
//!    notifications on the [`RegistrationContext`], then merges an
//!    initial-load tick with that change stream.
//!
//! 3. For every tick, in order, the task runs the query's fetch and publishes
//!    the result into a [`LatestCell`]. The next tick is not taken until that
//!    fetch and publish are done, so fetches of one subscription never
//!    overlap and results are published in tick order.
//!
//! 4. The consumer reads from the cell at its own pace. Results it was too
//!    slow to read are overwritten, never queued.
//!
//! # Cancellation
//!
//! Cancelling (or dropping) the stream fires a [`CancellationToken`]. The
//! task checks it between ticks and stops immediately while waiting for one.
//! A fetch already running is not interrupted, but it receives the same
//! token so the store can give up early, and whatever it returns is dropped.
//! Leaving the task drops the merged signal, which releases the store's
//! change observer.
//!
//! # Failure
//!
//! A failed fetch, a failed update source or a failed registration ends the
//! stream with that error. There is no retry at this layer.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::buffer::{LatestCell, Publish};
use super::merge::{initial_load, merge};
use super::state::{SubscriptionId, SubscriptionState, SubscriptionStats};
use crate::config::{FetchMode, ObserverConfig};
use crate::dispatch::RegistrationContext;
use crate::error::{StreamError, StreamResult};
use crate::query::{DescriptorQuery, Entity, FetchDescriptor, ObservableQuery};
use crate::store::{Store, UpdateStream};

/// Starts subscriptions that keep re-running one query.
///
/// An observer is immutable. Each [`values`](Self::values) call starts an
/// independent subscription with its own update signal and buffer.
///
/// # Example
///
/// ```rust,ignore
/// let registration = RegistrationContext::spawn("store-observers")?;
/// let observer = FetchDescriptor::<Todo>::new()
///     .filter(|todo| !todo.done)
///     .observer(&registration, |todos| todos.len());
///
/// let mut open_count = observer.values(store.clone());
/// while let Some(count) = open_count.next().await {
///     println!("{} open", count?);
/// }
/// ```
pub struct FetchStreamObserver<Q> {
    query: Arc<Q>,
    registration: RegistrationContext,
    config: ObserverConfig,
}

impl<Q> FetchStreamObserver<Q> {
    /// Create an observer that registers for changes on `registration`.
    pub fn new(query: Q, registration: &RegistrationContext) -> Self {
        Self {
            query: Arc::new(query),
            registration: registration.clone(),
            config: ObserverConfig::default(),
        }
    }

    /// Replace the settings applied to every subscription.
    pub fn with_config(mut self, config: ObserverConfig) -> Self {
        self.config = config;
        self
    }

    /// The query each subscription runs.
    pub fn query(&self) -> &Q {
        &self.query
    }

    /// The observer's settings.
    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    /// The context change observers are registered on.
    pub fn registration(&self) -> &RegistrationContext {
        &self.registration
    }

    /// Start a new subscription against `store`.
    ///
    /// The subscription starts when the returned stream is first polled,
    /// which must happen inside a tokio runtime.
    pub fn values<S>(&self, store: Arc<S>) -> ResultStream<Q::Output>
    where
        S: Store,
        Q: ObservableQuery<S>,
    {
        let id = SubscriptionId::new();
        let cell = Arc::new(LatestCell::new());
        let cancel = CancellationToken::new();
        let state = Arc::new(watch::channel(SubscriptionState::Idle).0);
        let stats = Arc::new(watch::channel(SubscriptionStats::default()).0);

        let fetch_loop = FetchLoop {
            query: Arc::clone(&self.query),
            store,
            registration: self.registration.clone(),
            config: self.config.clone(),
            cell: Arc::clone(&cell),
            cancel: cancel.clone(),
            state: Arc::clone(&state),
            stats: Arc::clone(&stats),
        };
        let span = tracing::debug_span!(
            "subscription",
            id = id.get(),
            label = self.config.label.as_deref().unwrap_or_default(),
        );
        let launch: Launch = Box::new(move || {
            tokio::spawn(fetch_loop.run().instrument(span));
        });

        ResultStream {
            id,
            cell,
            cancel,
            state,
            stats,
            launch: Mutex::new(Some(launch)),
        }
    }
}

impl<Q> Clone for FetchStreamObserver<Q> {
    fn clone(&self) -> Self {
        Self {
            query: Arc::clone(&self.query),
            registration: self.registration.clone(),
            config: self.config.clone(),
        }
    }
}

impl<Q: fmt::Debug> fmt::Debug for FetchStreamObserver<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchStreamObserver")
            .field("query", &self.query)
            .field("registration", &self.registration.id())
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Entity> FetchDescriptor<T> {
    /// Observe this descriptor, mapping each fetch through `map`.
    pub fn observer<R, F>(
        self,
        registration: &RegistrationContext,
        map: F,
    ) -> FetchStreamObserver<DescriptorQuery<T, R>>
    where
        F: Fn(Vec<T>) -> R + Send + Sync + 'static,
    {
        FetchStreamObserver::new(DescriptorQuery::new(self, map), registration)
    }

    /// Observe only that this descriptor's rows changed.
    pub fn change_observer(
        self,
        registration: &RegistrationContext,
    ) -> FetchStreamObserver<DescriptorQuery<T, ()>> {
        FetchStreamObserver::new(DescriptorQuery::changes(self), registration)
    }
}

type Launch = Box<dyn FnOnce() + Send>;

/// The values of one subscription.
///
/// Yields `Ok` results until the subscription ends: `None` after
/// cancellation or once every update source is exhausted, or a single `Err`
/// followed by `None` on failure. At most one result is ever buffered.
///
/// Dropping the stream cancels the subscription.
pub struct ResultStream<R> {
    id: SubscriptionId,
    cell: Arc<LatestCell<R, StreamError>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
    stats: Arc<watch::Sender<SubscriptionStats>>,
    launch: Mutex<Option<Launch>>,
}

impl<R> ResultStream<R> {
    /// Get the subscription's unique ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscription's current lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Follow lifecycle changes. Keeps working after the stream is dropped.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// A snapshot of the subscription's counters.
    pub fn stats(&self) -> SubscriptionStats {
        *self.stats.borrow()
    }

    /// Follow the subscription's counters as they change.
    pub fn watch_stats(&self) -> watch::Receiver<SubscriptionStats> {
        self.stats.subscribe()
    }

    /// Stop the subscription.
    ///
    /// No value is delivered after this returns, including one that was
    /// already buffered. The stream then ends with `None`.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.cell.close();

        if self.launch.lock().take().is_some() {
            self.state.send_replace(SubscriptionState::Terminated(Ok(())));
            return;
        }

        self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Subscribed {
                *state = SubscriptionState::Cancelling;
                true
            } else {
                false
            }
        });
    }

    fn start(&self) {
        if let Some(launch) = self.launch.lock().take() {
            self.state.send_replace(SubscriptionState::Subscribed);
            launch();
        }
    }
}

impl<R> Stream for ResultStream<R> {
    type Item = StreamResult<R>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.start();
        self.cell.poll_take(cx)
    }
}

impl<R> Drop for ResultStream<R> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<R> fmt::Debug for ResultStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// The background task behind one [`ResultStream`].
struct FetchLoop<Q, S: Store>
where
    Q: ObservableQuery<S>,
{
    query: Arc<Q>,
    store: Arc<S>,
    registration: RegistrationContext,
    config: ObserverConfig,
    cell: Arc<LatestCell<Q::Output, StreamError>>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SubscriptionState>>,
    stats: Arc<watch::Sender<SubscriptionStats>>,
}

impl<Q, S> FetchLoop<Q, S>
where
    S: Store,
    Q: ObservableQuery<S>,
{
    async fn run(self) {
        tracing::debug!("subscription started");
        let result = self.drive().await;

        let outcome = if self.cancel.is_cancelled() {
            if let Err(err) = &result {
                tracing::trace!(error = %err, "ignoring failure after cancellation");
            }
            Ok(())
        } else {
            result
        };

        match &outcome {
            Ok(()) => tracing::debug!("subscription finished"),
            Err(err) => tracing::warn!(error = %err, "subscription failed"),
        }
        self.cell.finish(outcome.clone());
        self.state.send_replace(SubscriptionState::Terminated(outcome));
    }

    async fn drive(&self) -> StreamResult<()> {
        let changes = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            changes = self.register() => changes?,
        };
        let mut updates = merge([initial_load(), changes]);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!("cancellation observed");
                    return Ok(());
                }
                next = updates.next() => next,
            };
            let Some(tick) = next else {
                tracing::debug!("update sources exhausted");
                return Ok(());
            };
            let tick = tick?;
            self.stats.send_modify(|stats| stats.ticks += 1);
            tracing::trace!(?tick, "fetching");

            let fetched = self.fetch().await;
            self.stats.send_modify(|stats| stats.fetches += 1);

            if self.cancel.is_cancelled() {
                self.stats.send_modify(|stats| stats.discarded += 1);
                tracing::trace!("discarding fetch outcome after cancellation");
                return Ok(());
            }

            let published = self.cell.publish(fetched?);
            tracing::trace!(?published, "published");
            match published {
                Publish::Stored => self.stats.send_modify(|stats| stats.published += 1),
                Publish::Overwrote => self.stats.send_modify(|stats| {
                    stats.published += 1;
                    stats.overwritten += 1;
                }),
                Publish::Rejected => {
                    tracing::trace!("output closed");
                    return Ok(());
                }
            }
        }
    }

    async fn register(&self) -> StreamResult<UpdateStream> {
        let query = Arc::clone(&self.query);
        let store = Arc::clone(&self.store);
        let registering = self
            .registration
            .run(move || query.make_updates_stream(&*store));

        let changes = match self.config.registration_timeout() {
            Some(limit) => tokio::time::timeout(limit, registering)
                .await
                .map_err(|_| StreamError::RegistrationTimeout(limit))?,
            None => registering.await,
        }??;

        tracing::debug!("registered for change notifications");
        Ok(changes)
    }

    async fn fetch(&self) -> StreamResult<Q::Output> {
        match self.config.fetch_mode {
            FetchMode::Inline => {
                let fetched = catch_unwind(AssertUnwindSafe(|| {
                    self.query.fetch(&*self.store, &self.cancel)
                }));
                match fetched {
                    Ok(fetched) => Ok(fetched?),
                    Err(payload) => Err(StreamError::FetchPanicked(panic_message(&*payload))),
                }
            }
            FetchMode::Blocking => {
                let query = Arc::clone(&self.query);
                let store = Arc::clone(&self.store);
                let cancel = self.cancel.clone();
                let joined =
                    tokio::task::spawn_blocking(move || query.fetch(&*store, &cancel)).await;
                match joined {
                    Ok(fetched) => Ok(fetched?),
                    Err(err) => Err(join_failure(err)),
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn join_failure(err: JoinError) -> StreamError {
    if err.is_panic() {
        StreamError::FetchPanicked(panic_message(&*err.into_panic()))
    } else {
        StreamError::FetchAborted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panicked_worker_is_reported_as_panic() {
        let joined = tokio::task::spawn_blocking(|| -> u32 { panic!("worker exploded") }).await;
        let err = join_failure(joined.unwrap_err());
        assert_eq!(err, StreamError::FetchPanicked("worker exploded".into()));
    }

    #[tokio::test]
    async fn cancelled_worker_is_reported_as_aborted() {
        let worker = tokio::spawn(futures_util::future::pending::<()>());
        worker.abort();
        let err = join_failure(worker.await.unwrap_err());
        assert!(matches!(err, StreamError::FetchAborted(_)), "{err:?}");
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7u8), "non-string panic payload");
    }
}
