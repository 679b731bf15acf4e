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


//! Database connection and management
//!
//! [`Database`] is the single access point to the library: it owns the
//! connection pool, the writer lock every [`Transaction`] holds, and the
//! [`CursorRegistry`] that committed changes are dispatched to. Clones
//! share all three.
//!
//! # Database Location
//! - Android: app-specific data directory (context.getDatabasePath())
//! - Desktop (Linux): ~/.local/share/Shelves/library.db
//! - Desktop (macOS): ~/Library/Application Support/Shelves/library.db
//! - Desktop (Windows): %APPDATA%/Shelves/library.db
//!
//! # SQLite Configuration
//! - WAL mode so readers never wait for the writer
//! - Foreign keys enabled
//! - Incremental auto-vacuum for space efficiency
//! - Normal synchronous mode (balance safety/speed)

use crate::config::LibraryConfig;
use crate::error::{LibraryError, Result};
use crate::storage::invalidation::CursorRegistry;
use crate::storage::transaction::Transaction;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Library database access point
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>, // None for in-memory databases
    writer: Arc<Mutex<()>>,
    registry: Arc<CursorRegistry>,
}

impl Database {
    /// Open (creating if needed) the database file at `database_path`
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        Self::open(&LibraryConfig::with_path(database_path.as_ref())).await
    }

    /// Create in-memory database for testing
    pub async fn new_in_memory() -> Result<Self> {
        Self::open(&LibraryConfig::default()).await
    }

    /// Open a database as described by `config` and run migrations.
    ///
    /// Starts the background registry sweeper when
    /// `config.sweep_interval_secs` is set.
    ///
    /// # Errors
    /// Returns error if:
    /// - Parent directory doesn't exist and can't be created
    /// - Database file can't be opened
    /// - Migrations fail
    #[instrument(skip(config), fields(path = ?config.database_path))]
    pub async fn open(config: &LibraryConfig) -> Result<Self> {
        config.validate()?;

        let pool = match &config.database_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            LibraryError::FileIoError(format!(
                                "Failed to create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }

                let connection_string = format!("sqlite://{}?mode=rwc", path.display());
                let connect_opts = SqliteConnectOptions::from_str(&connection_string)?
                    .create_if_missing(true)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .foreign_keys(true)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .busy_timeout(config.busy_timeout())
                    .disable_statement_logging();

                SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.acquire_timeout())
                    .connect_with(connect_opts)
                    .await?
            }
            None => {
                let connect_opts = SqliteConnectOptions::from_str("sqlite::memory:")?
                    .foreign_keys(true)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .disable_statement_logging();

                // Every connection to :memory: is its own database, so the
                // pool keeps exactly one and never recycles it.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .acquire_timeout(config.acquire_timeout())
                    .connect_with(connect_opts)
                    .await?
            }
        };

        Self::configure_database(&pool).await?;

        let db = Self {
            pool,
            path: config.database_path.clone(),
            writer: Arc::new(Mutex::new(())),
            registry: Arc::new(CursorRegistry::new()),
        };
        db.migrate().await?;

        if let Some(interval) = config.sweep_interval() {
            db.spawn_sweeper(interval);
        }

        info!("library database opened");
        Ok(db)
    }

    /// Configure database with pragmas
    async fn configure_database(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        crate::storage::migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| LibraryError::MigrationFailed(e.to_string()))?;

        Ok(())
    }

    /// Get reference to the connection pool
    ///
    /// For reads only. Writes go through [`Database::begin_transaction`] so
    /// live cursors hear about them. On an in-memory database the pool has
    /// a single connection, which an open transaction occupies.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database file path
    ///
    /// Returns `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Registry of live cursors opened on this database
    pub fn registry(&self) -> &Arc<CursorRegistry> {
        &self.registry
    }

    /// Open a write transaction.
    ///
    /// Waits for any other open transaction to end first.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        Transaction::begin(&self.pool, Arc::clone(&self.writer), Arc::clone(&self.registry)).await
    }

    /// Number of registry entries (live cursors plus not-yet-pruned ones)
    pub fn live_cursor_count(&self) -> usize {
        self.registry.len()
    }

    /// Prune registry entries whose cursor was dropped
    pub fn sweep_cursors(&self) -> usize {
        self.registry.sweep()
    }

    /// Sweep the registry every `interval` until the database is dropped
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(&self.registry);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.sweep();
                    }
                    None => {
                        debug!("database dropped, stopping cursor sweeper");
                        break;
                    }
                }
            }
        })
    }

    /// Close database and release all connections
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    /// Get default database path for the platform
    ///
    /// Note: on Android the app passes `context.getDatabasePath()` instead
    pub fn get_default_path() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("Shelves")
                .join("library.db")
        }

        #[cfg(target_os = "linux")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("Shelves")
                .join("library.db")
        }

        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(appdata).join("Shelves").join("library.db")
        }

        #[cfg(target_os = "android")]
        {
            PathBuf::from("/data/data/app.shelves/databases/library.db")
        }

        #[cfg(not(any(
            target_os = "macos",
            target_os = "linux",
            target_os = "windows",
            target_os = "android"
        )))]
        {
            PathBuf::from("./library.db")
        }
    }

    /// Check database integrity
    ///
    /// Runs SQLite integrity check and returns true if database is okay.
    pub async fn check_integrity(&self) -> Result<bool> {
        let result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        Ok(result == "ok")
    }

    /// Compare every stored `ref_count` with the rows that reference it.
    ///
    /// Returns one message per mismatch; an empty list means the counts
    /// are consistent.
    pub async fn verify_reference_counts(&self) -> Result<Vec<String>> {
        crate::storage::lookups::verify_reference_counts(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::invalidation::{CursorSignal, Dependency, Table};

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new_in_memory().await.expect("Failed to create in-memory database");

        let result: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(db.pool())
            .await
            .expect("Failed to query database");

        assert_eq!(result, 1);
        assert!(db.path().is_none());
    }

    #[tokio::test]
    async fn test_file_database_reopens() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("library.db");

        {
            let db = Database::new(&path).await.expect("Failed to create database");
            let mut tx = db.begin_transaction().await.unwrap();
            sqlx::query("INSERT INTO authors (name, name_normalized) VALUES ('Frank Herbert', 'frank herbert')")
                .execute(tx.conn())
                .await
                .unwrap();
            tx.set_transaction_successful();
            assert!(tx.end().await.unwrap());
            db.close().await.unwrap();
        }

        let db = Database::new(&path).await.expect("Failed to reopen database");
        let authors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM authors")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(authors, 1);
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_integrity_check() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let is_ok = db.check_integrity().await.expect("Failed to check integrity");

        assert!(is_ok, "Database integrity check failed");
        assert!(db.verify_reference_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writers_are_serialized() {
        let db = Database::new_in_memory().await.expect("Failed to create database");

        let tx = db.begin_transaction().await.unwrap();
        let other = db.clone();
        let waiting = tokio::spawn(async move {
            let tx = other.begin_transaction().await.unwrap();
            tx.end().await.unwrap()
        });

        tokio::task::yield_now().await;
        assert!(!waiting.is_finished(), "second writer must wait for the first");
        tx.end().await.unwrap();
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_cursors() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Books), &signal);
        assert_eq!(db.live_cursor_count(), 1);

        drop(signal);
        assert_eq!(db.sweep_cursors(), 1);
        assert_eq!(db.live_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let db = Database::new_in_memory().await.expect("Failed to create database");
        let handle = db.spawn_sweeper(Duration::from_millis(20));

        let signal = Arc::new(CursorSignal::new());
        db.registry().register(Dependency::WholeTable(Table::Books), &signal);
        drop(signal);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(db.live_cursor_count(), 0);

        drop(db);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop once the database is gone")
            .unwrap();
    }
}
