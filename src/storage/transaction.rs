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


//! Write scope with nested levels and buffered change notifications
//!
//! A [`Transaction`] is the only way to mutate the library. It holds the
//! database's single writer lock for its whole lifetime, so writers are
//! serialized no matter which thread or task they come from.
//!
//! # Nesting
//! Actions that call other actions open a nested level with
//! [`Transaction::begin_nested`] and close it with
//! [`Transaction::end_nested`]. All levels share one commit point:
//! - a level that ends without `set_transaction_successful` makes the whole
//!   transaction rollback-only
//! - only [`Transaction::end`] on the outermost level commits
//!
//! # Notifications
//! `notify_change` only queues. The queue is dispatched to the cursor
//! registry after the outermost commit succeeds and is discarded on
//! rollback, so observers never see a change that did not persist.
//!
//! Dropping a transaction without calling `end` rolls it back and releases
//! the writer lock.

use crate::error::{LibraryError, Result};
use crate::storage::invalidation::{Change, CursorRegistry, Table};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Open write scope on the library database
pub struct Transaction {
    inner: sqlx::Transaction<'static, Sqlite>,
    writer: OwnedMutexGuard<()>,
    registry: Arc<CursorRegistry>,
    /// Success flag per open level, outermost first
    levels: Vec<bool>,
    rollback_only: bool,
    pending: Vec<Change>,
}

impl Transaction {
    pub(crate) async fn begin(
        pool: &SqlitePool,
        writer: Arc<Mutex<()>>,
        registry: Arc<CursorRegistry>,
    ) -> Result<Self> {
        let writer = writer.lock_owned().await;
        let inner = pool
            .begin()
            .await
            .map_err(|e| LibraryError::TransactionFailed(format!("could not begin: {}", e)))?;

        Ok(Self {
            inner,
            writer,
            registry,
            levels: vec![false],
            rollback_only: false,
            pending: Vec::new(),
        })
    }

    /// Connection to run statements on
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.inner
    }

    /// Number of open levels (1 = outermost only)
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Open a nested level sharing this transaction's commit point
    pub fn begin_nested(&mut self) {
        self.levels.push(false);
    }

    /// Mark the innermost open level as successful
    pub fn set_transaction_successful(&mut self) {
        if let Some(level) = self.levels.last_mut() {
            *level = true;
        }
    }

    /// Close the innermost nested level.
    ///
    /// An unsuccessful level poisons the whole transaction.
    pub fn end_nested(&mut self) -> Result<()> {
        if self.levels.len() <= 1 {
            return Err(LibraryError::invalid_state(
                "end_nested called without a matching begin_nested",
            ));
        }
        if !self.levels.pop().unwrap_or(false) {
            self.rollback_only = true;
        }
        Ok(())
    }

    /// `set_transaction_successful` when `succeeded`, then `end_nested`
    pub fn end_nested_with(&mut self, succeeded: bool) -> Result<()> {
        if succeeded {
            self.set_transaction_successful();
        }
        self.end_nested()
    }

    /// Queue a change for dispatch after the outermost commit
    pub fn notify_change(&mut self, table: Table, row: Option<i64>) {
        let change = Change { table, row };
        if !self.pending.contains(&change) {
            self.pending.push(change);
        }
    }

    /// Changes queued so far
    pub fn pending_changes(&self) -> &[Change] {
        &self.pending
    }

    /// End the outermost level: commit if it was marked successful and no
    /// nested level failed, otherwise roll back.
    ///
    /// The writer lock is released before observers are notified. Returns
    /// whether the transaction committed.
    pub async fn end(self) -> Result<bool> {
        let Transaction {
            inner,
            writer,
            registry,
            levels,
            rollback_only,
            pending,
        } = self;

        let open_levels = levels.len();
        let commit = open_levels == 1 && !rollback_only && levels.first().copied().unwrap_or(false);

        if commit {
            let committed = inner.commit().await;
            drop(writer);
            committed.map_err(|e| LibraryError::TransactionFailed(format!("commit failed: {}", e)))?;
            debug!(changes = pending.len(), "transaction committed");
            registry.dispatch(&pending);
            return Ok(true);
        }

        let rolled_back = inner.rollback().await;
        drop(writer);
        if open_levels != 1 {
            warn!(open_levels, "transaction ended with nested levels still open; rolled back");
            return Err(LibraryError::invalid_state(format!(
                "transaction ended with {} nested level(s) still open",
                open_levels - 1
            )));
        }
        rolled_back.map_err(|e| LibraryError::TransactionFailed(format!("rollback failed: {}", e)))?;
        debug!(discarded = pending.len(), "transaction rolled back");
        Ok(false)
    }

    /// Commit on `Ok`, roll back on `Err`, and hand back the action result.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.set_transaction_successful();
                if self.end().await? {
                    Ok(value)
                } else {
                    Err(LibraryError::TransactionFailed(
                        "rolled back because a nested scope did not complete".to_string(),
                    ))
                }
            }
            Err(err) => {
                if let Err(end_err) = self.end().await {
                    warn!(error = %end_err, "rollback after failed action also failed");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;
    use crate::storage::invalidation::{CursorSignal, Dependency};

    async fn count_collections(db: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM collections")
            .fetch_one(db.pool())
            .await
            .expect("Failed to count collections")
    }

    async fn insert_collection(tx: &mut Transaction, name: &str) {
        sqlx::query("INSERT INTO collections (name, name_normalized) VALUES (?, ?)")
            .bind(name)
            .bind(name.to_lowercase())
            .execute(tx.conn())
            .await
            .expect("Failed to insert collection");
        tx.notify_change(Table::Collections, None);
    }

    #[tokio::test]
    async fn test_commit_dispatches_queued_changes() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Collections), &signal);

        let mut tx = db.begin_transaction().await.unwrap();
        insert_collection(&mut tx, "Travel").await;
        assert!(!signal.is_stale(), "notification must wait for commit");
        tx.set_transaction_successful();
        assert!(tx.end().await.unwrap());

        assert!(signal.is_stale());
        assert_eq!(count_collections(&db).await, 2); // seed + new
    }

    #[tokio::test]
    async fn test_unsuccessful_end_rolls_back_and_discards() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Collections), &signal);

        let mut tx = db.begin_transaction().await.unwrap();
        insert_collection(&mut tx, "Travel").await;
        assert!(!tx.end().await.unwrap());

        assert!(!signal.is_stale());
        assert_eq!(count_collections(&db).await, 1);
    }

    #[tokio::test]
    async fn test_failed_nested_level_rolls_back_everything() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Collections), &signal);

        let mut tx = db.begin_transaction().await.unwrap();
        insert_collection(&mut tx, "Outer").await;
        tx.begin_nested();
        insert_collection(&mut tx, "Inner").await;
        tx.end_nested().unwrap(); // not marked successful
        assert!(tx.is_rollback_only());
        tx.set_transaction_successful();
        assert!(!tx.end().await.unwrap());

        assert!(!signal.is_stale());
        assert_eq!(count_collections(&db).await, 1);
    }

    #[tokio::test]
    async fn test_nested_success_commits_once_at_outermost() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Collections), &signal);

        let mut tx = db.begin_transaction().await.unwrap();
        tx.begin_nested();
        insert_collection(&mut tx, "Inner").await;
        tx.end_nested_with(true).unwrap();
        assert!(!signal.is_stale());
        insert_collection(&mut tx, "Outer").await;
        assert_eq!(tx.pending_changes().len(), 1);
        tx.set_transaction_successful();
        assert!(tx.end().await.unwrap());

        assert_eq!(signal.generation(), 1);
        assert_eq!(count_collections(&db).await, 3);
    }

    #[tokio::test]
    async fn test_unbalanced_levels() {
        let db = Database::new_in_memory().await.expect("Failed to create database");

        let mut tx = db.begin_transaction().await.unwrap();
        assert!(matches!(tx.end_nested(), Err(LibraryError::InvalidState(_))));
        tx.begin_nested();
        tx.set_transaction_successful();
        assert!(matches!(tx.end().await, Err(LibraryError::InvalidState(_))));

        // The writer lock was released despite the error
        let tx = db.begin_transaction().await.unwrap();
        assert!(!tx.end().await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_releases_writer() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        {
            let mut tx = db.begin_transaction().await.unwrap();
            insert_collection(&mut tx, "Dropped").await;
        }
        let tx = db.begin_transaction().await.unwrap();
        tx.end().await.unwrap();
        assert_eq!(count_collections(&db).await, 1);
    }
}
