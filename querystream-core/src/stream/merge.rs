//! Signal Merge
//!
//! Fan-in of several update sources into one ordered tick sequence.
//!
//! # How It Works
//!
//! 1. Each source is first drained of whatever it has ready *right now*, in
//!    source order. An eager source such as [`initial_load`] therefore lands
//!    in the channel before anything a slower source produces later.
//!
//! 2. Every source that is not yet exhausted gets a forwarding task that
//!    pushes its ticks into a shared unbounded channel as they arrive.
//!
//! 3. The channel closes once every forwarder has finished, which ends the
//!    merged sequence.
//!
//! 4. The first source error is recorded, the shared token stops every other
//!    forwarder, and the merged sequence yields that error ahead of any ticks
//!    still queued, then ends.
//!
//! Dropping a [`MergedSignal`] stops and releases all of its sources.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream;
use futures_util::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{MergeError, StoreError};
use crate::store::{Tick, UpdateStream};

/// A source that yields a single [`Tick::InitialLoad`] and completes.
pub fn initial_load() -> UpdateStream {
    Box::pin(stream::iter([Ok(Tick::InitialLoad)]))
}

type Failure = Arc<Mutex<Option<MergeError>>>;

fn record_failure(failure: &Failure, cancel: &CancellationToken, index: usize, source: StoreError) {
    failure
        .lock()
        .get_or_insert(MergeError::SourceFailed { index, source });
    cancel.cancel();
}

/// Merge `sources`, interleaving their ticks by arrival.
///
/// Must be called within a tokio runtime.
pub fn merge<I>(sources: I) -> MergedSignal
where
    I: IntoIterator<Item = UpdateStream>,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let failure: Failure = Arc::new(Mutex::new(None));
    let cancel = CancellationToken::new();
    let mut producers = Vec::new();

    for (index, mut source) in sources.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        let exhausted = loop {
            match source.next().now_or_never() {
                Some(Some(Ok(tick))) => {
                    let _ = tx.send(tick);
                }
                Some(Some(Err(err))) => {
                    record_failure(&failure, &cancel, index, err);
                    break true;
                }
                Some(None) => break true,
                None => break false,
            }
        };

        if !exhausted {
            producers.push(tokio::spawn(forward(
                index,
                source,
                tx.clone(),
                Arc::clone(&failure),
                cancel.clone(),
            )));
        }
    }

    MergedSignal {
        rx,
        failure,
        producers,
        cancel,
        done: false,
    }
}

async fn forward(
    index: usize,
    mut source: UpdateStream,
    tx: mpsc::UnboundedSender<Tick>,
    failure: Failure,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = source.next() => item,
        };

        match item {
            Some(Ok(tick)) => {
                if tx.send(tick).is_err() {
                    return;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(source = index, error = %err, "update source failed");
                record_failure(&failure, &cancel, index, err);
                return;
            }
            None => return,
        }
    }
}

/// The merged tick sequence of several update sources.
pub struct MergedSignal {
    rx: mpsc::UnboundedReceiver<Tick>,
    failure: Failure,
    producers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    done: bool,
}

impl MergedSignal {
    /// Number of sources still being forwarded.
    pub fn active_sources(&self) -> usize {
        self.producers.iter().filter(|p| !p.is_finished()).count()
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.cancel.cancel();
        for producer in self.producers.drain(..) {
            producer.abort();
        }
        self.rx.close();
    }
}

impl Stream for MergedSignal {
    type Item = Result<Tick, MergeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        let failed = this.failure.lock().take();
        if let Some(err) = failed {
            this.shutdown();
            return Poll::Ready(Some(Err(err)));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(tick)) => Poll::Ready(Some(Ok(tick))),
            Poll::Ready(None) => {
                this.shutdown();
                let failed = this.failure.lock().take();
                Poll::Ready(failed.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MergedSignal {
    fn drop(&mut self) {
        self.shutdown();
    }
}
