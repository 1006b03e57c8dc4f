//! Result Streams
//!
//! This module turns observable queries into push streams of results.
//!
//! # Pieces
//!
//! ## Merge
//!
//! Every subscription is driven by one tick sequence: a synthetic
//! initial-load tick merged with the store's change notifications. The merge
//! is a fan-in channel that ends when all of its sources end and fails as
//! soon as any of them fails.
//!
//! ## Latest-wins cell
//!
//! Results are handed to the consumer through a single-slot cell. A new
//! result overwrites an unread one, so a slow consumer skips stale results
//! instead of working through a backlog, and the producer never waits.
//!
//! ## Controller
//!
//! [`FetchStreamObserver`] owns the query and starts subscriptions. Each
//! subscription is a background task that fetches once per tick, strictly
//! one fetch at a time, and publishes into its cell. The consumer holds the
//! other end as a [`ResultStream`].

mod buffer;
mod controller;
mod merge;
mod state;

pub use buffer::{LatestCell, Publish};
pub use controller::{FetchStreamObserver, ResultStream};
pub use merge::{initial_load, merge, MergedSignal};
pub use state::{SubscriptionId, SubscriptionState, SubscriptionStats};
