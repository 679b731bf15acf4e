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


//! Database storage and models
//!
//! This module handles every database operation of the catalogue using
//! SQLite through sqlx.
//!
//! # Layout
//! - `database` - access point: pool, writer lock, cursor registry
//! - `transaction` - write scope with nested counting and buffered change notifications
//! - `invalidation` - tables, dependencies and the live cursor registry
//! - `cursor` - `LiveCursor`, a query result that knows when it went stale
//! - `lookups` - reference-counted authors, publishers, subjects and collections
//! - `actions` / `loans` - write operations
//! - `queries` / `views` - plain reads and their live counterparts
//!
//! # Usage Example
//! ```no_run
//! use shelves_core::storage::{BookEntry, BookOrder, Database};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new("./library.db").await?;
//!
//! let mut books = db.watch_books(BookOrder::Title).await?;
//! db.add_book(&BookEntry::new().title("The Hobbit").authors(["J. R. R. Tolkien"]))
//!     .await?;
//!
//! if books.refresh_if_stale().await? {
//!     println!("{} books", books.count()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod cursor;
pub mod database;
pub mod invalidation;
pub mod loans;
pub mod lookups;
pub mod migrations;
pub mod models;
pub mod queries;
pub mod transaction;
pub mod views;

// Re-export commonly used types
pub use actions::AddedBook;
pub use cursor::{CursorState, LiveCursor, QueryFn};
pub use database::Database;
pub use invalidation::{
    Change, ContentObserver, CursorId, CursorRegistry, CursorSignal, Dependency, ObserverId, Table,
};
pub use models::{
    Book, BookDetail, BookEntry, BookField, BookOrder, BookRecord, BookSummary, Collection,
    Contact, ContactRef, FieldValue, Loan, LoanState, LoanSummary, LookupEntry, LookupKind,
};
pub use transaction::Transaction;
