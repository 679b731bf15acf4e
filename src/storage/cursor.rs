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


//! Dependency-aware live cursor
//!
//! A [`LiveCursor`] is a materialized query result plus the [`Dependency`]
//! it was opened with. It is registered with the database's cursor
//! registry while open; a committed write matching the dependency marks it
//! stale and notifies its observers. Re-fetching is left to the owner:
//! call [`LiveCursor::requery`] or [`LiveCursor::refresh_if_stale`].
//!
//! # States
//! ```text
//! Active <--deactivate/activate--> Deactivated
//!    \                                 /
//!     +------------> Closed <---------+
//! ```
//! A deactivated cursor drops its rows but stays registered. Positional
//! access on a deactivated or closed cursor fails with `InvalidState`.
//! Closing twice is a no-op.

use crate::error::{LibraryError, Result};
use crate::storage::database::Database;
use crate::storage::invalidation::{
    ContentObserver, CursorId, CursorRegistry, CursorSignal, Dependency, ObserverId,
};
use futures_util::future::{BoxFuture, FutureExt};
use sqlx::SqlitePool;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Re-runnable query behind a cursor
pub type QueryFn<T> = Arc<dyn Fn(SqlitePool) -> BoxFuture<'static, Result<Vec<T>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Active,
    Deactivated,
    Closed,
}

pub struct LiveCursor<T> {
    id: CursorId,
    pool: SqlitePool,
    registry: Arc<CursorRegistry>,
    signal: Arc<CursorSignal>,
    dependency: Dependency,
    query: QueryFn<T>,
    rows: Vec<T>,
    /// -1 is before the first row, `rows.len()` after the last
    position: isize,
    saved_position: isize,
    state: CursorState,
}

impl<T: Send + 'static> LiveCursor<T> {
    /// Register a cursor for `dependency` and run `query` once.
    ///
    /// The cursor is registered before the first fetch so a write landing
    /// in between still marks it stale. If the fetch fails the registration
    /// is withdrawn and the error returned; no cursor exists afterwards.
    pub async fn open<F, Fut>(db: &Database, dependency: Dependency, query: F) -> Result<Self>
    where
        F: Fn(SqlitePool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
    {
        let query: QueryFn<T> = Arc::new(move |pool: SqlitePool| query(pool).boxed());
        let registry = Arc::clone(db.registry());
        let signal = Arc::new(CursorSignal::new());
        let id = registry.register(dependency.clone(), &signal);

        let rows = match query(db.pool().clone()).await {
            Ok(rows) => rows,
            Err(err) => {
                registry.unregister(id);
                debug!(%id, error = %err, "cursor query failed, not registered");
                return Err(err);
            }
        };

        Ok(Self {
            id,
            pool: db.pool().clone(),
            registry,
            signal,
            dependency,
            query,
            rows,
            position: -1,
            saved_position: -1,
            state: CursorState::Active,
        })
    }

    /// Re-run the query and move before the first row.
    ///
    /// On failure the previous rows are kept and the cursor stays stale.
    pub async fn requery(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Err(LibraryError::invalid_state(format!("{} is closed", self.id)));
        }

        self.signal.take_stale();
        match (self.query)(self.pool.clone()).await {
            Ok(rows) => {
                self.rows = rows;
                self.position = -1;
                self.state = CursorState::Active;
                Ok(())
            }
            Err(err) => {
                self.signal.mark_stale();
                Err(err)
            }
        }
    }

    /// Requery only if a matching change was committed since the last fetch
    pub async fn refresh_if_stale(&mut self) -> Result<bool> {
        self.ensure_active()?;
        if !self.signal.is_stale() {
            return Ok(false);
        }
        self.requery().await?;
        Ok(true)
    }

    /// Re-fetch after `deactivate`, restoring the position where it still exists
    pub async fn activate(&mut self) -> Result<()> {
        match self.state {
            CursorState::Closed => {
                Err(LibraryError::invalid_state(format!("{} is closed", self.id)))
            }
            CursorState::Active => Ok(()),
            CursorState::Deactivated => {
                let saved = self.saved_position;
                self.requery().await?;
                self.position = saved.min(self.rows.len() as isize);
                Ok(())
            }
        }
    }
}

impl<T> LiveCursor<T> {
    fn ensure_active(&self) -> Result<()> {
        match self.state {
            CursorState::Active => Ok(()),
            CursorState::Deactivated => Err(LibraryError::invalid_state(format!(
                "{} is deactivated",
                self.id
            ))),
            CursorState::Closed => Err(LibraryError::invalid_state(format!("{} is closed", self.id))),
        }
    }

    pub fn id(&self) -> CursorId {
        self.id
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    /// Whether a matching change was committed since the last fetch
    pub fn is_stale(&self) -> bool {
        self.signal.is_stale()
    }

    /// Invalidations seen since the cursor was opened
    pub fn generation(&self) -> u64 {
        self.signal.generation()
    }

    /// Receiver that changes on every invalidation of this cursor
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn ContentObserver>) -> ObserverId {
        self.signal.register_observer(observer)
    }

    /// Register a closure as observer
    pub fn on_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.signal.register_observer(Arc::new(callback))
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.signal.unregister_observer(id)
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.rows.len())
    }

    pub fn position(&self) -> Result<isize> {
        self.ensure_active()?;
        Ok(self.position)
    }

    pub fn move_to_position(&mut self, position: isize) -> Result<bool> {
        self.ensure_active()?;
        let count = self.rows.len() as isize;
        self.position = position.clamp(-1, count);
        Ok(position >= 0 && position < count)
    }

    pub fn move_to_first(&mut self) -> Result<bool> {
        self.move_to_position(0)
    }

    pub fn move_to_last(&mut self) -> Result<bool> {
        let last = self.count()? as isize - 1;
        self.move_to_position(last)
    }

    pub fn move_to_next(&mut self) -> Result<bool> {
        let next = self.position()? + 1;
        self.move_to_position(next)
    }

    pub fn move_to_previous(&mut self) -> Result<bool> {
        let previous = self.position()? - 1;
        self.move_to_position(previous)
    }

    pub fn is_before_first(&self) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.rows.is_empty() || self.position < 0)
    }

    pub fn is_after_last(&self) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.rows.is_empty() || self.position >= self.rows.len() as isize)
    }

    /// Row at the current position, `None` when off the ends
    pub fn current(&self) -> Result<Option<&T>> {
        self.ensure_active()?;
        if self.position < 0 {
            return Ok(None);
        }
        Ok(self.rows.get(self.position as usize))
    }

    pub fn get(&self, index: usize) -> Result<Option<&T>> {
        self.ensure_active()?;
        Ok(self.rows.get(index))
    }

    pub fn rows(&self) -> Result<&[T]> {
        self.ensure_active()?;
        Ok(&self.rows)
    }

    /// Release the rows while keeping the registration
    pub fn deactivate(&mut self) -> Result<()> {
        match self.state {
            CursorState::Closed => {
                Err(LibraryError::invalid_state(format!("{} is closed", self.id)))
            }
            CursorState::Deactivated => Ok(()),
            CursorState::Active => {
                self.saved_position = self.position;
                self.rows = Vec::new();
                self.state = CursorState::Deactivated;
                Ok(())
            }
        }
    }

    /// Unregister and release everything; later calls are no-ops
    pub fn close(&mut self) {
        if self.state == CursorState::Closed {
            return;
        }
        self.registry.unregister(self.id);
        self.rows = Vec::new();
        self.position = -1;
        self.state = CursorState::Closed;
    }
}

impl<T> Drop for LiveCursor<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for LiveCursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCursor")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("dependency", &self.dependency)
            .field("rows", &self.rows.len())
            .field("position", &self.position)
            .field("stale", &self.signal.is_stale())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::invalidation::Table;
    use crate::storage::models::BookEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn titles(pool: SqlitePool) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT title FROM books ORDER BY id")
            .fetch_all(&pool)
            .await?)
    }

    #[tokio::test]
    async fn test_positioning() {
        let db = Database::new_in_memory().await.unwrap();
        db.add_book(&BookEntry::new().title("One")).await.unwrap();
        db.add_book(&BookEntry::new().title("Two")).await.unwrap();

        let mut cursor = LiveCursor::open(&db, Dependency::WholeTable(Table::Books), titles)
            .await
            .unwrap();
        assert_eq!(cursor.count().unwrap(), 2);
        assert!(cursor.is_before_first().unwrap());
        assert_eq!(cursor.current().unwrap(), None);

        assert!(cursor.move_to_first().unwrap());
        assert_eq!(cursor.current().unwrap().map(String::as_str), Some("One"));
        assert!(cursor.move_to_next().unwrap());
        assert!(!cursor.move_to_next().unwrap());
        assert!(cursor.is_after_last().unwrap());
        assert!(!cursor.move_to_next().unwrap());
        assert!(cursor.move_to_previous().unwrap());
        assert_eq!(cursor.current().unwrap().map(String::as_str), Some("Two"));
    }

    #[tokio::test]
    async fn test_invalidation_and_requery() {
        let db = Database::new_in_memory().await.unwrap();
        let mut cursor = LiveCursor::open(&db, Dependency::WholeTable(Table::Books), titles)
            .await
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        cursor.on_change(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let changes = cursor.subscribe();

        db.add_book(&BookEntry::new().title("One")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(changes.has_changed().unwrap());
        assert!(cursor.is_stale());
        assert_eq!(cursor.count().unwrap(), 0, "rows are refreshed lazily");

        assert!(cursor.refresh_if_stale().await.unwrap());
        assert_eq!(cursor.count().unwrap(), 1);
        assert!(!cursor.refresh_if_stale().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_registration() {
        let db = Database::new_in_memory().await.unwrap();
        let result = LiveCursor::<String>::open(&db, Dependency::WholeTable(Table::Books), |_pool| async {
            Err(LibraryError::MalformedQuery("bad".to_string()))
        })
        .await;

        assert!(matches!(result, Err(LibraryError::MalformedQuery(_))));
        assert_eq!(db.live_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_close_and_drop_unregister() {
        let db = Database::new_in_memory().await.unwrap();
        let mut cursor = LiveCursor::open(&db, Dependency::WholeTable(Table::Books), titles)
            .await
            .unwrap();
        let other = LiveCursor::open(&db, Dependency::WholeTable(Table::Books), titles)
            .await
            .unwrap();
        assert_eq!(db.live_cursor_count(), 2);

        cursor.close();
        cursor.close();
        assert!(matches!(cursor.count(), Err(LibraryError::InvalidState(_))));
        assert!(matches!(cursor.move_to_first(), Err(LibraryError::InvalidState(_))));
        assert!(matches!(cursor.requery().await, Err(LibraryError::InvalidState(_))));

        drop(other);
        assert_eq!(db.live_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_and_activate() {
        let db = Database::new_in_memory().await.unwrap();
        db.add_book(&BookEntry::new().title("One")).await.unwrap();
        db.add_book(&BookEntry::new().title("Two")).await.unwrap();
        let mut cursor = LiveCursor::open(&db, Dependency::WholeTable(Table::Books), titles)
            .await
            .unwrap();
        cursor.move_to_last().unwrap();

        cursor.deactivate().unwrap();
        assert!(matches!(cursor.current(), Err(LibraryError::InvalidState(_))));
        assert_eq!(db.live_cursor_count(), 1);

        // Still hears about changes while deactivated
        db.add_book(&BookEntry::new().title("Three")).await.unwrap();
        assert!(cursor.is_stale());

        cursor.activate().await.unwrap();
        assert_eq!(cursor.count().unwrap(), 3);
        assert_eq!(cursor.current().unwrap().map(String::as_str), Some("Two"));
        assert!(!cursor.is_stale());
    }
}
