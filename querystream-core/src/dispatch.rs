//! Registration Context
//!
//! Some stores only accept observer registration from one fixed thread. A
//! [`RegistrationContext`] is that thread: a dedicated OS thread that runs
//! closures shipped to it over a channel, one at a time, in submission order.
//!
//! # Implementation
//!
//! The worker thread marks itself in a thread-local with the context's
//! [`ContextId`]. Stores call [`RegistrationContext::current`] to check they
//! are being driven from the right place, so affinity is enforced by the
//! store rather than trusted.
//!
//! Fetches never run here. The context exists only to create change
//! notification streams, which keeps its queue short and its latency low.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tokio::sync::{mpsc, oneshot};

use crate::error::{StreamError, StreamResult};

thread_local! {
    /// The registration context the current thread belongs to, if any.
    static CURRENT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Unique identifier for a registration context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a dedicated observer-registration thread.
///
/// Handles are cheap to clone. The thread exits once every handle is gone
/// and the queued jobs have run.
#[derive(Debug, Clone)]
pub struct RegistrationContext {
    id: ContextId,
    jobs: mpsc::UnboundedSender<Job>,
}

impl RegistrationContext {
    /// Spawn a new registration thread with the given name.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let id = ContextId::next();
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new().name(name.into()).spawn(move || {
            CURRENT.with(|current| current.set(Some(id)));
            tracing::debug!(context = id.0, "registration context started");

            while let Some(job) = rx.blocking_recv() {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(context = id.0, "registration job panicked");
                }
            }

            tracing::debug!(context = id.0, "registration context stopped");
        })?;

        Ok(Self { id, jobs })
    }

    /// This context's identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The registration context the calling thread belongs to, if any.
    pub fn current() -> Option<ContextId> {
        CURRENT.with(|current| current.get())
    }

    /// Whether the calling thread is this context's thread.
    pub fn is_current(&self) -> bool {
        Self::current() == Some(self.id)
    }

    /// Run `f` on the registration thread and wait for its result.
    ///
    /// Called from the registration thread itself, `f` runs inline.
    pub async fn run<F, R>(&self, f: F) -> StreamResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }

        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| StreamError::RegistrationClosed)?;

        // A panicking job drops `tx` without answering.
        rx.await.map_err(|_| StreamError::RegistrationClosed)
    }
}
