//! Fetch Descriptors
//!
//! A [`FetchDescriptor`] is an immutable description of what to fetch:
//! which rows of an entity match, in what order, and how many. Stores either
//! translate it into their own query language or evaluate it in process with
//! [`FetchDescriptor::apply`].
//!
//! Descriptors also carry the relevance key used to decide which store
//! mutations should trigger a re-fetch. By default that is the entity type as
//! a whole; [`FetchDescriptor::scoped`] narrows both the fetch and the
//! notifications to rows in one scope.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A type of row a store can hold.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Name of the entity, unique within a store.
    const ENTITY: &'static str;

    /// The scope this row belongs to, used to narrow relevance.
    fn scope(&self) -> Option<&str> {
        None
    }
}

/// Which mutations are relevant to a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelevanceKey {
    entity: &'static str,
    scope: Option<Arc<str>>,
}

impl RelevanceKey {
    /// Every mutation of `entity` is relevant.
    pub fn entity(entity: &'static str) -> Self {
        Self {
            entity,
            scope: None,
        }
    }

    /// Only mutations of rows in `scope` are relevant.
    pub fn scoped(mut self, scope: impl Into<Arc<str>>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// The entity this key observes.
    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    /// The scope relevance is narrowed to, if any.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Whether a mutation of a row of `entity` in `scope` is relevant.
    pub fn matches(&self, entity: &str, scope: Option<&str>) -> bool {
        if self.entity != entity {
            return false;
        }
        match self.scope.as_deref() {
            None => true,
            Some(wanted) => scope == Some(wanted),
        }
    }
}

/// Direction of a sort descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Forward,
    Reverse,
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// One sort key of a descriptor.
pub struct SortDescriptor<T> {
    compare: Comparator<T>,
    order: SortOrder,
}

impl<T> SortDescriptor<T> {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        let ordering = (self.compare)(a, b);
        match self.order {
            SortOrder::Forward => ordering,
            SortOrder::Reverse => ordering.reverse(),
        }
    }
}

impl<T> Clone for SortDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            compare: Arc::clone(&self.compare),
            order: self.order,
        }
    }
}

/// An immutable description of a fetch over rows of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let open_todos = FetchDescriptor::<Todo>::new()
///     .filter(|todo| !todo.done)
///     .sort_by(|a, b| a.created.cmp(&b.created), SortOrder::Reverse)
///     .limit(50);
/// ```
pub struct FetchDescriptor<T> {
    predicate: Option<Predicate<T>>,
    sort: Vec<SortDescriptor<T>>,
    offset: usize,
    limit: Option<usize>,
    scope: Option<Arc<str>>,
}

impl<T: Entity> FetchDescriptor<T> {
    /// A descriptor matching every row of `T` in insertion order.
    pub fn new() -> Self {
        Self {
            predicate: None,
            sort: Vec::new(),
            offset: 0,
            limit: None,
            scope: None,
        }
    }

    /// Keep only rows for which `predicate` holds.
    ///
    /// Calling `filter` again combines both predicates.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let combined: Predicate<T> = match self.predicate.take() {
            None => Arc::new(predicate),
            Some(previous) => Arc::new(move |row: &T| previous(row) && predicate(row)),
        };
        self.predicate = Some(combined);
        self
    }

    /// Add a sort key. Earlier keys take precedence; ties keep store order.
    pub fn sort_by<F>(mut self, compare: F, order: SortOrder) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.sort.push(SortDescriptor {
            compare: Arc::new(compare),
            order,
        });
        self
    }

    /// Skip the first `offset` matching rows.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Return at most `limit` rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restrict the fetch and its relevance to rows in `scope`.
    pub fn scoped(mut self, scope: impl Into<Arc<str>>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Number of matching rows skipped.
    pub fn fetch_offset(&self) -> usize {
        self.offset
    }

    /// Maximum number of rows returned, if bounded.
    pub fn fetch_limit(&self) -> Option<usize> {
        self.limit
    }

    /// The scope rows and relevance are narrowed to, if any.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// The key a store uses to decide whether a mutation concerns this
    /// descriptor.
    pub fn relevance_key(&self) -> RelevanceKey {
        let key = RelevanceKey::entity(T::ENTITY);
        match &self.scope {
            Some(scope) => key.scoped(Arc::clone(scope)),
            None => key,
        }
    }

    /// Whether `row` passes the scope and predicate.
    pub fn matches(&self, row: &T) -> bool {
        if let Some(scope) = self.scope.as_deref() {
            if row.scope() != Some(scope) {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |predicate| predicate(row))
    }

    /// Evaluate this descriptor over rows given in store order.
    pub fn apply<I>(&self, rows: I) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
    {
        let mut matched: Vec<T> = rows.into_iter().filter(|row| self.matches(row)).collect();

        if !self.sort.is_empty() {
            matched.sort_by(|a, b| {
                self.sort
                    .iter()
                    .map(|key| key.compare(a, b))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
        }

        let rows = matched.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}

impl<T: Entity> Default for FetchDescriptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FetchDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            sort: self.sort.clone(),
            offset: self.offset,
            limit: self.limit,
            scope: self.scope.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for FetchDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchDescriptor")
            .field("entity", &T::ENTITY)
            .field("filtered", &self.predicate.is_some())
            .field("sort_keys", &self.sort.len())
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Task {
        title: &'static str,
        priority: u8,
        list: &'static str,
    }

    impl Entity for Task {
        const ENTITY: &'static str = "task";

        fn scope(&self) -> Option<&str> {
            Some(self.list)
        }
    }

    fn task(title: &'static str, priority: u8, list: &'static str) -> Task {
        Task {
            title,
            priority,
            list,
        }
    }

    fn rows() -> Vec<Task> {
        vec![
            task("a", 2, "home"),
            task("b", 1, "work"),
            task("c", 3, "home"),
            task("d", 1, "home"),
        ]
    }

    fn titles(rows: &[Task]) -> Vec<&'static str> {
        rows.iter().map(|t| t.title).collect()
    }

    #[test]
    fn default_descriptor_keeps_store_order() {
        let result = FetchDescriptor::<Task>::new().apply(rows());
        assert_eq!(titles(&result), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn filters_combine() {
        let result = FetchDescriptor::<Task>::new()
            .filter(|t| t.priority < 3)
            .filter(|t| t.list == "home")
            .apply(rows());
        assert_eq!(titles(&result), vec!["a", "d"]);
    }

    #[test]
    fn sort_keys_apply_in_order_and_are_stable() {
        let result = FetchDescriptor::<Task>::new()
            .sort_by(|a, b| a.priority.cmp(&b.priority), SortOrder::Forward)
            .apply(rows());
        // b and d tie on priority and keep store order
        assert_eq!(titles(&result), vec!["b", "d", "a", "c"]);

        let result = FetchDescriptor::<Task>::new()
            .sort_by(|a, b| a.priority.cmp(&b.priority), SortOrder::Forward)
            .sort_by(|a, b| a.title.cmp(b.title), SortOrder::Reverse)
            .apply(rows());
        assert_eq!(titles(&result), vec!["d", "b", "a", "c"]);
    }

    #[test]
    fn offset_and_limit_page_after_sorting() {
        let result = FetchDescriptor::<Task>::new()
            .sort_by(|a, b| a.priority.cmp(&b.priority), SortOrder::Reverse)
            .offset(1)
            .limit(2)
            .apply(rows());
        assert_eq!(titles(&result), vec!["a", "b"]);

        let empty = FetchDescriptor::<Task>::new().offset(10).apply(rows());
        assert!(empty.is_empty());
    }

    #[test]
    fn scope_narrows_rows_and_relevance() {
        let descriptor = FetchDescriptor::<Task>::new().scoped("work");
        assert_eq!(titles(&descriptor.apply(rows())), vec!["b"]);

        let key = descriptor.relevance_key();
        assert_eq!(key.entity_name(), "task");
        assert_eq!(key.scope(), Some("work"));
        assert!(key.matches("task", Some("work")));
        assert!(!key.matches("task", Some("home")));
        assert!(!key.matches("task", None));
        assert!(!key.matches("note", Some("work")));
    }

    #[test]
    fn unscoped_key_matches_any_row_of_entity() {
        let key = FetchDescriptor::<Task>::new().relevance_key();
        assert!(key.matches("task", Some("home")));
        assert!(key.matches("task", None));
        assert!(!key.matches("note", None));
    }

    #[test]
    fn clones_share_criteria() {
        let descriptor = FetchDescriptor::<Task>::new()
            .filter(|t| t.list == "home")
            .limit(1);
        let copy = descriptor.clone();
        assert_eq!(descriptor.apply(rows()), copy.apply(rows()));
        assert_eq!(copy.fetch_limit(), Some(1));
    }
}
