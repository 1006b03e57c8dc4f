//! In-memory store.
//!
//! Rows of every entity live in one copy-on-write table map. Reads take an
//! `Arc` of the current map, so a read context is a consistent snapshot that
//! costs a reference-count bump to open and never blocks writers.
//!
//! Writes run inside [`MemoryStore::write`]: the closure mutates a private
//! copy of the tables, which is installed only if the closure succeeds. A
//! committed transaction bumps the [`Revision`] and sends at most one tick to
//! each observer whose relevance key it touched, however many rows changed.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures_util::Stream;
use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Store, Tick, UpdateStream};
use crate::dispatch::{ContextId, RegistrationContext};
use crate::error::{StoreError, StoreResult};
use crate::query::{Entity, FetchDescriptor, RelevanceKey};

/// Identifier of a stored row, unique across entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub u64);

/// Monotonic counter of committed transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(pub u64);

type Row = Arc<dyn Any + Send + Sync>;
type Table = IndexMap<RowId, Row>;
type Tables = HashMap<&'static str, Table>;

fn downcast<T: Entity>(row: &Row) -> StoreResult<T> {
    row.downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| StoreError::Execute {
            entity: T::ENTITY,
            message: format!("stored row is not a `{}`", std::any::type_name::<T>()),
        })
}

#[derive(Default)]
struct Snapshot {
    revision: Revision,
    tables: Arc<Tables>,
}

struct Observer {
    key: RelevanceKey,
    tx: mpsc::UnboundedSender<StoreResult<Tick>>,
}

type Observers = DashMap<u64, Observer>;

/// A thread-safe in-memory [`Store`].
pub struct MemoryStore {
    snapshot: RwLock<Snapshot>,
    next_row: AtomicU64,
    next_observer: AtomicU64,
    observers: Arc<Observers>,
    registration: Option<ContextId>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// An empty store accepting observers from any thread.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            next_row: AtomicU64::new(0),
            next_observer: AtomicU64::new(0),
            observers: Arc::new(DashMap::new()),
            registration: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Only accept observer registration from `context`'s thread.
    pub fn with_registration_context(mut self, context: &RegistrationContext) -> Self {
        self.registration = Some(context.id());
        self
    }

    /// The revision of the latest committed transaction.
    pub fn revision(&self) -> Revision {
        self.snapshot.read().revision
    }

    /// Number of live change observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Number of stored rows of `T`.
    pub fn len<T: Entity>(&self) -> usize {
        self.snapshot
            .read()
            .tables
            .get(T::ENTITY)
            .map_or(0, |table| table.len())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read one row.
    pub fn get<T: Entity>(&self, id: RowId) -> StoreResult<Option<T>> {
        self.ensure_open()?;
        let snapshot = self.snapshot.read();
        snapshot
            .tables
            .get(T::ENTITY)
            .and_then(|table| table.get(&id))
            .map(downcast::<T>)
            .transpose()
    }

    /// Run a transaction.
    ///
    /// If `f` fails nothing it did is kept and no observer is notified. The
    /// closure runs under the store's write lock and must not call back into
    /// the store.
    pub fn write<F, O>(&self, f: F) -> StoreResult<O>
    where
        F: FnOnce(&mut Transaction<'_>) -> StoreResult<O>,
    {
        let (output, touched, revision) = {
            let mut snapshot = self.snapshot.write();
            self.ensure_open()?;

            let mut tables = (*snapshot.tables).clone();
            let mut tx = Transaction {
                tables: &mut tables,
                next_row: &self.next_row,
                touched: SmallVec::new(),
            };
            let output = f(&mut tx)?;
            let touched = tx.touched;

            if !touched.is_empty() {
                snapshot.revision = Revision(snapshot.revision.0 + 1);
                snapshot.tables = Arc::new(tables);
            }
            (output, touched, snapshot.revision)
        };

        if !touched.is_empty() {
            tracing::trace!(revision = revision.0, touched = touched.len(), "committed");
            self.notify(&touched);
        }
        Ok(output)
    }

    /// Insert a row in its own transaction.
    pub fn insert<T: Entity>(&self, row: T) -> StoreResult<RowId> {
        self.write(|tx| Ok(tx.insert(row)))
    }

    /// Replace a row in its own transaction, returning the previous value.
    pub fn replace<T: Entity>(&self, id: RowId, row: T) -> StoreResult<T> {
        self.write(|tx| tx.replace(id, row))
    }

    /// Delete a row in its own transaction.
    pub fn delete<T: Entity>(&self, id: RowId) -> StoreResult<Option<T>> {
        self.write(|tx| tx.delete(id))
    }

    /// Make the store unusable.
    ///
    /// Reads and writes fail with [`StoreError::Closed`] from now on, and
    /// every observer receives that error as its final item.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.observers.retain(|_, observer| {
            let _ = observer.tx.send(Err(StoreError::Closed));
            false
        });
        tracing::debug!("memory store closed");
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn notify(&self, touched: &[Touched]) {
        self.observers.retain(|_, observer| {
            let relevant = touched
                .iter()
                .any(|t| observer.key.matches(t.entity, t.scope.as_deref()));
            if relevant {
                observer.tx.send(Ok(Tick::Changed)).is_ok()
            } else {
                !observer.tx.is_closed()
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("revision", &self.revision())
            .field("observers", &self.observer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Store for MemoryStore {
    type ReadContext = MemoryReadContext;

    fn create_read_context(&self) -> StoreResult<MemoryReadContext> {
        self.ensure_open()?;
        let snapshot = self.snapshot.read();
        Ok(MemoryReadContext {
            revision: snapshot.revision,
            tables: Arc::clone(&snapshot.tables),
        })
    }

    fn execute<T: Entity>(
        &self,
        context: &mut MemoryReadContext,
        descriptor: &FetchDescriptor<T>,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<T>> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled { entity: T::ENTITY });
        }
        let Some(table) = context.tables.get(T::ENTITY) else {
            return Ok(Vec::new());
        };
        let rows = table
            .values()
            .map(downcast::<T>)
            .collect::<StoreResult<Vec<T>>>()?;
        Ok(descriptor.apply(rows))
    }

    fn observe_changes(&self, key: &RelevanceKey) -> StoreResult<UpdateStream> {
        self.ensure_open()?;
        if let Some(required) = self.registration {
            if RegistrationContext::current() != Some(required) {
                return Err(StoreError::WrongContext {
                    entity: key.entity_name(),
                });
            }
        }

        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.insert(
            id,
            Observer {
                key: key.clone(),
                tx,
            },
        );

        // `close` may have drained the registry while we were inserting.
        if self.is_closed() {
            self.observers.remove(&id);
            return Err(StoreError::Closed);
        }

        tracing::trace!(
            observer = id,
            entity = key.entity_name(),
            scope = ?key.scope(),
            "observer registered"
        );
        Ok(Box::pin(Observation {
            id,
            rx,
            observers: Arc::downgrade(&self.observers),
        }))
    }
}

/// A consistent snapshot of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryReadContext {
    revision: Revision,
    tables: Arc<Tables>,
}

impl MemoryReadContext {
    /// The revision this snapshot was taken at.
    pub fn revision(&self) -> Revision {
        self.revision
    }
}

impl fmt::Debug for MemoryReadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReadContext")
            .field("revision", &self.revision)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Touched {
    entity: &'static str,
    scope: Option<Arc<str>>,
}

/// Mutable view of the store inside [`MemoryStore::write`].
pub struct Transaction<'a> {
    tables: &'a mut Tables,
    next_row: &'a AtomicU64,
    touched: SmallVec<[Touched; 4]>,
}

impl Transaction<'_> {
    /// Append a row, returning its new id.
    pub fn insert<T: Entity>(&mut self, row: T) -> RowId {
        let id = RowId(self.next_row.fetch_add(1, Ordering::Relaxed) + 1);
        self.touch(T::ENTITY, row.scope());
        self.tables
            .entry(T::ENTITY)
            .or_default()
            .insert(id, Arc::new(row));
        id
    }

    /// Read a row, including uncommitted changes of this transaction.
    pub fn get<T: Entity>(&self, id: RowId) -> StoreResult<Option<T>> {
        self.tables
            .get(T::ENTITY)
            .and_then(|table| table.get(&id))
            .map(downcast::<T>)
            .transpose()
    }

    /// Replace row `id`, keeping its position. Fails if it does not exist.
    pub fn replace<T: Entity>(&mut self, id: RowId, row: T) -> StoreResult<T> {
        let not_found = StoreError::NotFound {
            entity: T::ENTITY,
            id: id.0,
        };
        let slot = self
            .tables
            .get_mut(T::ENTITY)
            .and_then(|table| table.get_mut(&id))
            .ok_or(not_found)?;
        let previous = downcast::<T>(slot)?;
        *slot = Arc::new(row.clone());

        self.touch(T::ENTITY, previous.scope());
        self.touch(T::ENTITY, row.scope());
        Ok(previous)
    }

    /// Remove row `id`, returning it if it existed.
    pub fn delete<T: Entity>(&mut self, id: RowId) -> StoreResult<Option<T>> {
        let Some(table) = self.tables.get_mut(T::ENTITY) else {
            return Ok(None);
        };
        let Some(row) = table.shift_remove(&id) else {
            return Ok(None);
        };
        let previous = downcast::<T>(&row)?;
        self.touch(T::ENTITY, previous.scope());
        Ok(Some(previous))
    }

    fn touch(&mut self, entity: &'static str, scope: Option<&str>) {
        let seen = self
            .touched
            .iter()
            .any(|t| t.entity == entity && t.scope.as_deref() == scope);
        if !seen {
            self.touched.push(Touched {
                entity,
                scope: scope.map(Arc::from),
            });
        }
    }
}

/// Change stream handed out by [`MemoryStore::observe_changes`].
///
/// Unregisters its observer when dropped.
struct Observation {
    id: u64,
    rx: mpsc::UnboundedReceiver<StoreResult<Tick>>,
    observers: Weak<Observers>,
}

impl Stream for Observation {
    type Item = StoreResult<Tick>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{FutureExt, StreamExt};

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        text: &'static str,
        folder: &'static str,
    }

    impl Entity for Note {
        const ENTITY: &'static str = "note";

        fn scope(&self) -> Option<&str> {
            Some(self.folder)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(&'static str);

    impl Entity for Tag {
        const ENTITY: &'static str = "tag";
    }

    fn note(text: &'static str, folder: &'static str) -> Note {
        Note { text, folder }
    }

    fn fetch_all<T: Entity>(store: &MemoryStore) -> Vec<T> {
        let mut context = store.create_read_context().unwrap();
        store
            .execute(&mut context, &FetchDescriptor::new(), &CancellationToken::new())
            .unwrap()
    }

    /// Whether a tick is ready right now, without waiting.
    fn ready(stream: &mut UpdateStream) -> Option<Option<StoreResult<Tick>>> {
        stream.next().now_or_never()
    }

    #[test]
    fn insert_get_replace_delete() {
        let store = MemoryStore::new();
        let id = store.insert(note("milk", "shopping")).unwrap();
        assert_eq!(store.get::<Note>(id).unwrap(), Some(note("milk", "shopping")));
        assert_eq!(store.len::<Note>(), 1);

        let previous = store.replace(id, note("oat milk", "shopping")).unwrap();
        assert_eq!(previous.text, "milk");
        assert_eq!(store.get::<Note>(id).unwrap().unwrap().text, "oat milk");

        assert_eq!(store.delete::<Note>(id).unwrap().unwrap().text, "oat milk");
        assert_eq!(store.delete::<Note>(id).unwrap(), None);
        assert_eq!(store.len::<Note>(), 0);
        assert_eq!(store.revision(), Revision(3));
    }

    #[test]
    fn replace_missing_row_fails() {
        let store = MemoryStore::new();
        let err = store.replace(RowId(42), note("x", "y")).unwrap_err();
        assert_eq!(err, StoreError::NotFound { entity: "note", id: 42 });
        assert_eq!(store.revision(), Revision(0));
    }

    #[test]
    fn read_context_is_a_snapshot() {
        let store = MemoryStore::new();
        store.insert(note("a", "f")).unwrap();

        let mut before = store.create_read_context().unwrap();
        store.insert(note("b", "f")).unwrap();

        let descriptor = FetchDescriptor::<Note>::new();
        let cancel = CancellationToken::new();
        let old = store.execute(&mut before, &descriptor, &cancel).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(before.revision(), Revision(1));
        assert_eq!(fetch_all::<Note>(&store).len(), 2);
    }

    #[test]
    fn failed_transaction_keeps_nothing() {
        let store = MemoryStore::new();
        let result: StoreResult<()> = store.write(|tx| {
            tx.insert(note("a", "f"));
            Err(StoreError::Execute {
                entity: "note",
                message: "abort".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(store.len::<Note>(), 0);
        assert_eq!(store.revision(), Revision(0));
    }

    #[test]
    fn execute_honours_cancellation() {
        let store = MemoryStore::new();
        let mut context = store.create_read_context().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = store
            .execute(&mut context, &FetchDescriptor::<Note>::new(), &cancel)
            .unwrap_err();
        assert_eq!(err, StoreError::Cancelled { entity: "note" });
    }

    #[test]
    fn one_tick_per_transaction() {
        let store = MemoryStore::new();
        let mut changes = store.observe_changes(&RelevanceKey::entity("note")).unwrap();
        assert!(ready(&mut changes).is_none());

        store
            .write(|tx| {
                tx.insert(note("a", "f"));
                tx.insert(note("b", "g"));
                Ok(())
            })
            .unwrap();

        assert_eq!(ready(&mut changes), Some(Some(Ok(Tick::Changed))));
        assert!(ready(&mut changes).is_none());
    }

    #[test]
    fn only_relevant_mutations_notify() {
        let store = MemoryStore::new();
        let mut work = store
            .observe_changes(&RelevanceKey::entity("note").scoped("work"))
            .unwrap();
        let mut tags = store.observe_changes(&RelevanceKey::entity("tag")).unwrap();

        let id = store.insert(note("a", "home")).unwrap();
        assert!(ready(&mut work).is_none());
        assert!(ready(&mut tags).is_none());

        // moving a row into the scope is relevant to it
        store.replace(id, note("a", "work")).unwrap();
        assert_eq!(ready(&mut work), Some(Some(Ok(Tick::Changed))));

        // and so is moving it out again
        store.replace(id, note("a", "home")).unwrap();
        assert_eq!(ready(&mut work), Some(Some(Ok(Tick::Changed))));

        store.insert(Tag("urgent")).unwrap();
        assert_eq!(ready(&mut tags), Some(Some(Ok(Tick::Changed))));
        assert!(ready(&mut work).is_none());
    }

    #[test]
    fn dropping_the_stream_unregisters() {
        let store = MemoryStore::new();
        let changes = store.observe_changes(&RelevanceKey::entity("note")).unwrap();
        assert_eq!(store.observer_count(), 1);
        drop(changes);
        assert_eq!(store.observer_count(), 0);
    }

    #[test]
    fn close_fails_everything_and_ends_observers() {
        let store = MemoryStore::new();
        let mut changes = store.observe_changes(&RelevanceKey::entity("note")).unwrap();

        store.close();

        assert_eq!(ready(&mut changes), Some(Some(Err(StoreError::Closed))));
        assert_eq!(ready(&mut changes), Some(None));
        assert_eq!(store.observer_count(), 0);
        assert_eq!(store.insert(note("a", "f")).unwrap_err(), StoreError::Closed);
        assert_eq!(store.create_read_context().unwrap_err(), StoreError::Closed);
        assert!(store.observe_changes(&RelevanceKey::entity("note")).is_err());
    }

    #[tokio::test]
    async fn registration_affinity_is_enforced() {
        let context = RegistrationContext::spawn("memory-store-test").unwrap();
        let store = Arc::new(MemoryStore::new().with_registration_context(&context));

        let err = store
            .observe_changes(&RelevanceKey::entity("note"))
            .err()
            .unwrap();
        assert_eq!(err, StoreError::WrongContext { entity: "note" });

        let on_context = Arc::clone(&store);
        let changes = context
            .run(move || on_context.observe_changes(&RelevanceKey::entity("note")))
            .await
            .unwrap();
        assert!(changes.is_ok());
        assert_eq!(store.observer_count(), 1);
    }

    #[test]
    fn entity_name_collision_is_reported() {
        #[derive(Debug, Clone)]
        struct Impostor;
        impl Entity for Impostor {
            const ENTITY: &'static str = "note";
        }

        let store = MemoryStore::new();
        store.insert(note("a", "f")).unwrap();

        let mut context = store.create_read_context().unwrap();
        let err = store
            .execute(
                &mut context,
                &FetchDescriptor::<Impostor>::new(),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Execute { entity: "note", .. }));
    }
}
