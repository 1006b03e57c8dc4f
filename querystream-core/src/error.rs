//! Error types used throughout querystream.
//!
//! Every error here is fatal to the subscription that hits it. Errors are
//! `Clone` so the terminal outcome can be recorded in the subscription state
//! and handed to the consumer at the same time.

use std::time::Duration;

use thiserror::Error;

/// Result type returned by [`Store`](crate::store::Store) operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type carried by a [`ResultStream`](crate::stream::ResultStream).
pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// A failure reported by the persistent store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store was closed and can no longer be read, written or observed.
    #[error("store is closed")]
    Closed,

    /// A read context could not be opened.
    #[error("failed to open read context: {0}")]
    ReadContext(String),

    /// Executing a descriptor failed.
    #[error("fetch of `{entity}` failed: {message}")]
    Execute {
        /// Entity the descriptor targets.
        entity: &'static str,
        /// Human-readable error message.
        message: String,
    },

    /// A write addressed a row that does not exist.
    #[error("no `{entity}` row with id {id}")]
    NotFound {
        /// Entity of the addressed row.
        entity: &'static str,
        /// Raw row id.
        id: u64,
    },

    /// An observer was registered off the store's registration context.
    #[error("observer for `{entity}` must be registered on the registration context")]
    WrongContext {
        /// Entity of the relevance key being observed.
        entity: &'static str,
    },

    /// The store aborted a fetch because its cancellation token fired.
    #[error("fetch of `{entity}` was cancelled")]
    Cancelled {
        /// Entity the descriptor targets.
        entity: &'static str,
    },
}

/// A failure of one of the update sources feeding a merged signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Source `index` (in merge order) yielded an error.
    #[error("update source {index} failed: {source}")]
    SourceFailed {
        /// Position of the failed source in the merge.
        index: usize,
        /// The error the source reported.
        source: StoreError,
    },
}

/// The error a consumer of a result stream observes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Fetching or registering against the store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The merged update signal failed.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// The registration context shut down before answering.
    #[error("registration context is gone")]
    RegistrationClosed,

    /// Observer registration did not finish in time.
    #[error("observer registration timed out after {0:?}")]
    RegistrationTimeout(Duration),

    /// The fetch panicked on its worker thread.
    #[error("fetch panicked: {0}")]
    FetchPanicked(String),

    /// The fetch's worker task was cancelled before it finished, typically
    /// because the runtime is shutting down.
    #[error("fetch was aborted: {0}")]
    FetchAborted(String),
}

/// Malformed observer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("invalid observer config: {0}")]
    Parse(#[from] serde_json::Error),
}
