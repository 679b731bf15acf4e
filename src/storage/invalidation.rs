// Shelves - Personal Library Catalog for Android
// Copyright (C) 2025 Shelves contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Change tracking and cursor invalidation
//!
//! Every live cursor declares a [`Dependency`] when it is opened. Write
//! actions describe what they touched as [`Change`]s, which the transaction
//! buffers until the outermost commit. The [`CursorRegistry`] then matches
//! each registered dependency against the committed changes and signals the
//! affected cursors, each at most once per commit.
//!
//! # Row keys
//! - `Books`, lookup tables: the row's own id
//! - Join tables and `Loans`: the **book** id, so a single book's detail
//!   view can depend on "loans of book 7" without knowing loan ids
//! - `None`: bulk change, matches every row dependency on that table
//!
//! # Registry lifetime
//! The registry holds only weak references to cursor signals. Cursors
//! unregister themselves on `close()` and on drop; entries whose signal is
//! gone are pruned during every dispatch and by [`CursorRegistry::sweep`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Tables whose changes can invalidate a live cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Books,
    Authors,
    Publishers,
    Subjects,
    Collections,
    Contacts,
    BookAuthors,
    BookPublishers,
    BookSubjects,
    BookCollections,
    Loans,
}

impl Table {
    /// SQL table name
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Books => "books",
            Table::Authors => "authors",
            Table::Publishers => "publishers",
            Table::Subjects => "subjects",
            Table::Collections => "collections",
            Table::Contacts => "contacts",
            Table::BookAuthors => "book_authors",
            Table::BookPublishers => "book_publishers",
            Table::BookSubjects => "book_subjects",
            Table::BookCollections => "book_collections",
            Table::Loans => "loans",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logically-affected table (and optionally row) of a committed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Change {
    pub table: Table,
    pub row: Option<i64>,
}

impl Change {
    pub fn row(table: Table, row: i64) -> Self {
        Self { table, row: Some(row) }
    }

    pub fn table(table: Table) -> Self {
        Self { table, row: None }
    }
}

/// What a live cursor's result depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Any change to the table
    WholeTable(Table),
    /// Changes to one row of the table, or bulk changes to it
    Row(Table, i64),
    /// Any of the contained dependencies
    Composite(Vec<Dependency>),
}

impl Dependency {
    pub fn matches(&self, change: &Change) -> bool {
        match self {
            Dependency::WholeTable(table) => *table == change.table,
            Dependency::Row(table, id) => {
                *table == change.table && change.row.map_or(true, |row| row == *id)
            }
            Dependency::Composite(parts) => parts.iter().any(|part| part.matches(change)),
        }
    }

    pub fn matches_any(&self, changes: &[Change]) -> bool {
        changes.iter().any(|change| self.matches(change))
    }

    /// Whole-table dependency on each of `tables`
    pub fn tables(tables: &[Table]) -> Self {
        Dependency::Composite(tables.iter().copied().map(Dependency::WholeTable).collect())
    }
}

/// Callback invoked when a cursor's content changed
pub trait ContentObserver: Send + Sync {
    fn on_change(&self);
}

impl<F> ContentObserver for F
where
    F: Fn() + Send + Sync,
{
    fn on_change(&self) {
        (self)()
    }
}

/// Handle returned by `register_observer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Stable handle of a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor#{}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared change state of one live cursor
///
/// Owned by the cursor; the registry only keeps a weak reference.
pub struct CursorSignal {
    stale: AtomicBool,
    next_observer: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Arc<dyn ContentObserver>)>>,
    generation: watch::Sender<u64>,
}

impl CursorSignal {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            stale: AtomicBool::new(false),
            next_observer: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
            generation,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Clear the stale flag, returning whether it was set
    pub fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Number of invalidations seen so far
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver that wakes on every invalidation
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn ContentObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.observers).push((id, observer));
        id
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    /// Mark stale, bump the generation and notify observers.
    ///
    /// Observers run outside the observer lock so they may register or
    /// unregister observers themselves.
    pub fn invalidate(&self) {
        self.mark_stale();
        self.generation.send_modify(|generation| *generation += 1);

        let observers: Vec<Arc<dyn ContentObserver>> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer.on_change();
        }
    }
}

impl Default for CursorSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CursorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorSignal")
            .field("stale", &self.is_stale())
            .field("generation", &self.generation())
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[derive(Debug)]
struct RegistryEntry {
    dependency: Dependency,
    signal: Weak<CursorSignal>,
}

/// Registry of live cursors, owned by the database access point
#[derive(Debug)]
pub struct CursorRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<CursorId, RegistryEntry>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Track `signal` under `dependency` without keeping it alive
    pub fn register(&self, dependency: Dependency, signal: &Arc<CursorSignal>) -> CursorId {
        let id = CursorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.entries).insert(
            id,
            RegistryEntry {
                dependency,
                signal: Arc::downgrade(signal),
            },
        );
        id
    }

    pub fn unregister(&self, id: CursorId) -> bool {
        lock(&self.entries).remove(&id).is_some()
    }

    pub fn is_registered(&self, id: CursorId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    /// Number of entries, including ones whose cursor is already gone
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose cursor no longer exists; returns how many
    pub fn sweep(&self) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.signal.strong_count() > 0);
        let pruned = before - entries.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = entries.len(), "swept stale cursor entries");
        }
        pruned
    }

    /// Invalidate every live cursor whose dependency matches `changes`.
    ///
    /// Each cursor is signalled at most once however many changes match.
    /// Dead entries met during the scan are pruned. Returns the number of
    /// cursors signalled.
    pub fn dispatch(&self, changes: &[Change]) -> usize {
        if changes.is_empty() {
            return 0;
        }

        let mut affected = Vec::new();
        let mut pruned = 0usize;
        {
            let mut entries = lock(&self.entries);
            entries.retain(|_, entry| match entry.signal.upgrade() {
                Some(signal) => {
                    if entry.dependency.matches_any(changes) {
                        affected.push(signal);
                    }
                    true
                }
                None => {
                    pruned += 1;
                    false
                }
            });
        }

        if pruned > 0 {
            tracing::warn!(pruned, "pruned cursors that were dropped without close");
        }
        tracing::debug!(changes = changes.len(), invalidated = affected.len(), "dispatching changes");

        for signal in &affected {
            signal.invalidate();
        }
        affected.len()
    }
}

impl Default for CursorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dependency_matching() {
        let whole = Dependency::WholeTable(Table::Books);
        assert!(whole.matches(&Change::row(Table::Books, 3)));
        assert!(whole.matches(&Change::table(Table::Books)));
        assert!(!whole.matches(&Change::row(Table::Loans, 3)));

        let row = Dependency::Row(Table::Books, 3);
        assert!(row.matches(&Change::row(Table::Books, 3)));
        assert!(row.matches(&Change::table(Table::Books)));
        assert!(!row.matches(&Change::row(Table::Books, 4)));
        assert!(!row.matches(&Change::row(Table::Loans, 3)));

        let detail = Dependency::Composite(vec![
            Dependency::Row(Table::Books, 3),
            Dependency::Row(Table::Loans, 3),
        ]);
        assert!(detail.matches(&Change::row(Table::Loans, 3)));
        assert!(!detail.matches(&Change::row(Table::Loans, 9)));
        assert!(!detail.matches(&Change::row(Table::Authors, 3)));
    }

    #[test]
    fn test_dispatch_signals_each_cursor_once() {
        let registry = CursorRegistry::new();
        let signal = Arc::new(CursorSignal::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        signal.register_observer(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        registry.register(Dependency::tables(&[Table::Books, Table::BookAuthors]), &signal);

        let invalidated = registry.dispatch(&[
            Change::row(Table::Books, 1),
            Change::row(Table::BookAuthors, 1),
            Change::row(Table::Authors, 2),
        ]);

        assert_eq!(invalidated, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(signal.is_stale());
        assert_eq!(signal.generation(), 1);
    }

    #[test]
    fn test_unrelated_change_is_ignored() {
        let registry = CursorRegistry::new();
        let signal = Arc::new(CursorSignal::new());
        registry.register(Dependency::Row(Table::Books, 1), &signal);

        assert_eq!(registry.dispatch(&[Change::row(Table::Books, 2)]), 0);
        assert!(!signal.is_stale());
    }

    #[test]
    fn test_dropped_signal_is_pruned_on_dispatch() {
        let registry = CursorRegistry::new();
        let kept = Arc::new(CursorSignal::new());
        let dropped = Arc::new(CursorSignal::new());
        registry.register(Dependency::WholeTable(Table::Books), &kept);
        registry.register(Dependency::WholeTable(Table::Books), &dropped);
        drop(dropped);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.dispatch(&[Change::table(Table::Books)]), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sweep_and_unregister() {
        let registry = CursorRegistry::new();
        let signal = Arc::new(CursorSignal::new());
        let id = registry.register(Dependency::WholeTable(Table::Loans), &signal);
        let orphan = Arc::new(CursorSignal::new());
        registry.register(Dependency::WholeTable(Table::Loans), &orphan);
        drop(orphan);

        assert_eq!(registry.sweep(), 1);
        assert!(registry.is_registered(id));
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_observer_unregister() {
        let signal = CursorSignal::new();
        let id = signal.register_observer(Arc::new(|| {}));
        assert_eq!(signal.observer_count(), 1);
        assert!(signal.unregister_observer(id));
        assert!(!signal.unregister_observer(id));
    }
}
