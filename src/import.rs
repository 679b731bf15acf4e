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


//! Import batch
//!
//! Runs metadata lookups for a list of queries against an external
//! [`MetadataSource`] and persists every hit through the database access
//! point as soon as it arrives. Each persisted book is its own write
//! scope, so cancelling a batch stops the items still waiting for a lookup
//! and leaves the ones already committed in place.
//!
//! # Example
//! ```no_run
//! # use std::sync::Arc;
//! # use shelves_core::import::{ImportBatch, LookupQuery, MetadataSource};
//! # use shelves_core::storage::Database;
//! # async fn example(db: Database, source: Arc<dyn MetadataSource>) -> shelves_core::Result<()> {
//! let batch = ImportBatch::start(
//!     db,
//!     source,
//!     vec![LookupQuery::Isbn("9780261103573".into())],
//!     3,
//! );
//! let report = batch.wait().await?;
//! println!("{} imported", report.imported.len());
//! # Ok(())
//! # }
//! ```

use crate::config::LibraryConfig;
use crate::error::{LibraryError, Result};
use crate::storage::database::Database;
use crate::storage::models::BookRecord;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// What to look up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LookupQuery {
    Isbn(String),
    Text(String),
    GoogleId(String),
}

/// External book metadata search.
///
/// Returns `Ok(None)` when nothing matches. Implementations must be
/// cancel-safe: the future may be dropped at any await point.
pub trait MetadataSource: Send + Sync {
    fn lookup<'a>(&'a self, query: &'a LookupQuery) -> BoxFuture<'a, Result<Option<BookRecord>>>;
}

/// Outcome of a finished batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Ids of newly created books
    pub imported: Vec<i64>,
    /// Ids of books that were already in the library
    pub reused: Vec<i64>,
    pub not_found: Vec<LookupQuery>,
    /// Queries whose lookup or persistence failed, with the error message
    pub failed: Vec<(LookupQuery, String)>,
    /// Number of items stopped by `cancel()` before anything was written
    pub cancelled: usize,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.imported.len()
            + self.reused.len()
            + self.not_found.len()
            + self.failed.len()
            + self.cancelled
    }
}

enum ItemOutcome {
    Imported(i64),
    Reused(i64),
    NotFound(LookupQuery),
    Failed(LookupQuery, String),
    Cancelled,
}

/// A running import
pub struct ImportBatch {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<ImportReport>,
}

impl ImportBatch {
    /// Start looking up `queries`, at most `concurrency` at a time
    pub fn start(
        db: Database,
        source: Arc<dyn MetadataSource>,
        queries: Vec<LookupQuery>,
        concurrency: usize,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let total = queries.len();

        let handle = tokio::spawn(async move {
            let mut items = JoinSet::new();
            for query in queries {
                items.spawn(import_item(
                    db.clone(),
                    Arc::clone(&source),
                    Arc::clone(&semaphore),
                    cancel_rx.clone(),
                    query,
                ));
            }

            let mut report = ImportReport::default();
            while let Some(joined) = items.join_next().await {
                match joined {
                    Ok(ItemOutcome::Imported(id)) => report.imported.push(id),
                    Ok(ItemOutcome::Reused(id)) => report.reused.push(id),
                    Ok(ItemOutcome::NotFound(query)) => report.not_found.push(query),
                    Ok(ItemOutcome::Failed(query, message)) => {
                        warn!(?query, %message, "import item failed");
                        report.failed.push((query, message));
                    }
                    Ok(ItemOutcome::Cancelled) => report.cancelled += 1,
                    Err(e) => {
                        warn!(error = %e, "import item task aborted");
                        report.cancelled += 1;
                    }
                }
            }

            info!(
                total,
                imported = report.imported.len(),
                reused = report.reused.len(),
                not_found = report.not_found.len(),
                failed = report.failed.len(),
                cancelled = report.cancelled,
                "import batch finished"
            );
            report
        });

        Self { cancel_tx, handle }
    }

    /// Start with the concurrency limit configured for the library
    pub fn start_with_config(
        db: Database,
        source: Arc<dyn MetadataSource>,
        queries: Vec<LookupQuery>,
        config: &LibraryConfig,
    ) -> Self {
        Self::start(db, source, queries, config.import_concurrency)
    }

    /// Stop every item that has not started persisting yet
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for every item to settle
    pub async fn wait(self) -> Result<ImportReport> {
        self.handle
            .await
            .map_err(|e| LibraryError::internal(format!("import batch task failed: {}", e)))
    }
}

/// Resolves once the batch is cancelled; never resolves if the batch handle
/// was dropped without cancelling
async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    if cancel_rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn import_item(
    db: Database,
    source: Arc<dyn MetadataSource>,
    semaphore: Arc<Semaphore>,
    mut cancel_rx: watch::Receiver<bool>,
    query: LookupQuery,
) -> ItemOutcome {
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return ItemOutcome::Cancelled,
        },
        _ = cancelled(&mut cancel_rx) => return ItemOutcome::Cancelled,
    };
    if *cancel_rx.borrow() {
        return ItemOutcome::Cancelled;
    }

    let found = tokio::select! {
        found = source.lookup(&query) => found,
        _ = cancelled(&mut cancel_rx) => return ItemOutcome::Cancelled,
    };

    let record = match found {
        Ok(Some(record)) => record,
        Ok(None) => return ItemOutcome::NotFound(query),
        Err(e) => return ItemOutcome::Failed(query, e.to_string()),
    };
    if *cancel_rx.borrow() {
        return ItemOutcome::Cancelled;
    }

    // Past this point the item commits even if the batch is cancelled
    match db.add_book(&record.into()).await {
        Ok(added) if added.created => ItemOutcome::Imported(added.id),
        Ok(added) => {
            debug!(id = added.id, "import matched existing book");
            ItemOutcome::Reused(added.id)
        }
        Err(e) => ItemOutcome::Failed(query, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries;
    use futures_util::FutureExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers from a fixed table; queries listed in `stall` never answer
    #[derive(Default)]
    struct FakeSource {
        records: HashMap<String, BookRecord>,
        stall: Vec<String>,
    }

    impl FakeSource {
        fn with(mut self, key: &str, title: &str, google_id: &str) -> Self {
            self.records.insert(
                key.to_string(),
                BookRecord {
                    title: title.to_string(),
                    authors: vec!["Some Author".to_string()],
                    google_id: Some(google_id.to_string()),
                    ..BookRecord::default()
                },
            );
            self
        }

        fn stalling(mut self, key: &str) -> Self {
            self.stall.push(key.to_string());
            self
        }
    }

    fn key(query: &LookupQuery) -> &str {
        match query {
            LookupQuery::Isbn(s) | LookupQuery::Text(s) | LookupQuery::GoogleId(s) => s,
        }
    }

    impl MetadataSource for FakeSource {
        fn lookup<'a>(&'a self, query: &'a LookupQuery) -> BoxFuture<'a, Result<Option<BookRecord>>> {
            async move {
                let key = key(query);
                if key == "broken" {
                    return Err(LibraryError::internal("service unavailable"));
                }
                if self.stall.iter().any(|s| s == key) {
                    std::future::pending::<()>().await;
                }
                Ok(self.records.get(key).cloned())
            }
            .boxed()
        }
    }

    fn isbn(s: &str) -> LookupQuery {
        LookupQuery::Isbn(s.to_string())
    }

    #[tokio::test]
    async fn test_import_sorts_outcomes() {
        let db = Database::new_in_memory().await.unwrap();
        let source = FakeSource::default()
            .with("1", "Dune", "g-dune")
            .with("2", "Emma", "g-emma")
            .with("3", "Dune", "g-dune");

        let batch = ImportBatch::start(
            db.clone(),
            Arc::new(source),
            vec![isbn("1"), isbn("2"), isbn("missing"), isbn("broken")],
            2,
        );
        let report = batch.wait().await.unwrap();

        assert_eq!(report.imported.len(), 2);
        assert!(report.reused.is_empty());
        assert_eq!(report.not_found, vec![isbn("missing")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, isbn("broken"));
        assert_eq!(report.cancelled, 0);
        assert_eq!(queries::count_books(db.pool()).await.unwrap(), 2);

        // Same external id again is reused
        let source = FakeSource::default().with("3", "Dune", "g-dune");
        let report = ImportBatch::start(db.clone(), Arc::new(source), vec![isbn("3")], 1)
            .wait()
            .await
            .unwrap();
        assert_eq!(report.reused.len(), 1);
        assert_eq!(queries::count_books(db.pool()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_keeps_committed_items() {
        let db = Database::new_in_memory().await.unwrap();
        let source = FakeSource::default()
            .with("fast", "Dune", "g-dune")
            .stalling("slow")
            .stalling("slower");

        let batch = ImportBatch::start(
            db.clone(),
            Arc::new(source),
            vec![isbn("fast"), isbn("slow"), isbn("slower")],
            3,
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while queries::count_books(db.pool()).await.unwrap() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        batch.cancel();
        assert!(batch.is_cancelled());
        let report = tokio::time::timeout(Duration::from_secs(5), batch.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.imported.len(), 1);
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.total(), 3);
        assert_eq!(queries::count_books(db.pool()).await.unwrap(), 1);
        assert!(db.verify_reference_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let db = Database::new_in_memory().await.unwrap();
        let report = ImportBatch::start(db, Arc::new(FakeSource::default()), Vec::new(), 3)
            .wait()
            .await
            .unwrap();
        assert_eq!(report, ImportReport::default());
    }

    /// Records how many lookups run at the same time
    struct GatedSource {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MetadataSource for GatedSource {
        fn lookup<'a>(&'a self, query: &'a LookupQuery) -> BoxFuture<'a, Result<Option<BookRecord>>> {
            async move {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(BookRecord {
                    title: key(query).to_string(),
                    google_id: Some(key(query).to_string()),
                    ..BookRecord::default()
                }))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_config_limits_concurrency() {
        let db = Database::new_in_memory().await.unwrap();
        let config = LibraryConfig::from_json(r#"{"import_concurrency": 2}"#).unwrap();
        let source = Arc::new(GatedSource {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let queries = (0..6).map(|i| isbn(&format!("book-{}", i))).collect();
        let report = ImportBatch::start_with_config(db, source.clone(), queries, &config)
            .wait()
            .await
            .unwrap();

        assert_eq!(report.imported.len(), 6);
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }
}
