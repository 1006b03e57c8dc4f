//! querystream Core
//!
//! This crate turns a "pull" query against a mutable store into a "push"
//! stream of results. The query runs once when the stream is first polled
//! and again every time the store reports a relevant change. The consumer
//! always gets the freshest result and never a backlog.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `query`: fetch descriptors and the observable-query abstraction
//! - `stream`: signal merging, the latest-wins buffer and the controller
//! - `store`: the store interface and an in-memory implementation
//! - `dispatch`: the dedicated thread used for observer registration
//! - `config`: per-observer settings
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use querystream_core::dispatch::RegistrationContext;
//! use querystream_core::query::{Entity, FetchDescriptor};
//! use querystream_core::store::MemoryStore;
//!
//! #[derive(Clone)]
//! struct Todo { title: String, done: bool }
//!
//! impl Entity for Todo {
//!     const ENTITY: &'static str = "todo";
//! }
//!
//! let registration = RegistrationContext::spawn("observers")?;
//! let store = Arc::new(MemoryStore::new());
//!
//! let open = FetchDescriptor::<Todo>::new()
//!     .filter(|todo| !todo.done)
//!     .observer(&registration, |todos| todos.len());
//!
//! let mut counts = open.values(store.clone());
//! assert_eq!(counts.next().await.unwrap()?, 0);
//!
//! store.insert(Todo { title: "write docs".into(), done: false })?;
//! assert_eq!(counts.next().await.unwrap()?, 1);
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod query;
pub mod store;
pub mod stream;

pub use config::{FetchMode, ObserverConfig};
pub use dispatch::RegistrationContext;
pub use error::{MergeError, StoreError, StreamError};
pub use query::{DescriptorQuery, Entity, FetchDescriptor, ObservableQuery};
pub use store::{MemoryStore, Store};
pub use stream::{FetchStreamObserver, ResultStream, SubscriptionState};
