//! Queries
//!
//! What a subscription fetches, and how it learns that it should fetch
//! again.
//!
//! - [`FetchDescriptor`]: immutable fetch criteria over one [`Entity`].
//! - [`RelevanceKey`]: the slice of the store a descriptor cares about.
//! - [`ObservableQuery`]: the fetch-plus-updates capability a subscription
//!   drives, with [`DescriptorQuery`] as the standard implementation.

mod descriptor;
mod observable;

pub use descriptor::{Entity, FetchDescriptor, RelevanceKey, SortDescriptor, SortOrder};
pub use observable::{DescriptorQuery, ObservableQuery, Transform};
