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


//! Live views
//!
//! One [`LiveCursor`] constructor per screen-level query, each declaring
//! exactly the tables (and rows) its projected columns come from:
//!
//! | View                | Depends on                                         |
//! |---------------------|----------------------------------------------------|
//! | book list, search   | `books`, `book_authors`                            |
//! | book detail         | rows keyed by the book id in `books`, every join table and `loans` |
//! | lookup list         | the lookup table                                   |
//! | books for a lookup  | `books`, the lookup's join table                   |
//! | collections         | `collections`                                      |
//! | contacts            | `contacts`                                         |
//! | loan history        | `loans` rows of the book                           |
//! | loan lists          | `loans`, `books`                                   |

use crate::error::{LibraryError, Result};
use crate::storage::cursor::LiveCursor;
use crate::storage::database::Database;
use crate::storage::invalidation::{Dependency, Table};
use crate::storage::models::*;
use crate::storage::queries;
use crate::text::validate_search_expression;
use chrono::NaiveDate;
use sqlx::SqlitePool;

/// Dependency of a single book's detail view
pub fn book_detail_dependency(book_id: i64) -> Dependency {
    Dependency::Composite(
        [
            Table::Books,
            Table::BookAuthors,
            Table::BookPublishers,
            Table::BookSubjects,
            Table::BookCollections,
            Table::Loans,
        ]
        .into_iter()
        .map(|table| Dependency::Row(table, book_id))
        .collect(),
    )
}

impl Database {
    /// All books, kept in sync with inserts, edits, deletes and author changes
    pub async fn watch_books(&self, order: BookOrder) -> Result<LiveCursor<BookSummary>> {
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Books, Table::BookAuthors]),
            move |pool: SqlitePool| async move { queries::list_books(&pool, order).await },
        )
        .await
    }

    /// One book's detail; zero rows once the book is deleted
    pub async fn watch_book_detail(&self, book_id: i64) -> Result<LiveCursor<BookDetail>> {
        LiveCursor::open(
            self,
            book_detail_dependency(book_id),
            move |pool: SqlitePool| async move {
                let detail = queries::get_book_detail(&pool, book_id).await?;
                Ok::<Vec<BookDetail>, LibraryError>(detail.into_iter().collect())
            },
        )
        .await
    }

    /// Free-text search over titles and authors
    pub async fn watch_search(&self, text: &str) -> Result<LiveCursor<BookSummary>> {
        let text = text.to_string();
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Books, Table::BookAuthors]),
            move |pool: SqlitePool| {
                let text = text.clone();
                async move { queries::search_books(&pool, &text).await }
            },
        )
        .await
    }

    /// Full-text expression search.
    ///
    /// A malformed expression fails with `MalformedQuery` before anything
    /// is registered.
    pub async fn watch_search_expression(&self, expression: &str) -> Result<LiveCursor<BookSummary>> {
        validate_search_expression(expression)?;
        let expression = expression.to_string();
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Books, Table::BookAuthors]),
            move |pool: SqlitePool| {
                let expression = expression.clone();
                async move { queries::search_books_expression(&pool, &expression).await }
            },
        )
        .await
    }

    /// Authors, publishers, subjects or collections with their book counts
    pub async fn watch_lookups(&self, kind: LookupKind) -> Result<LiveCursor<LookupEntry>> {
        LiveCursor::open(
            self,
            Dependency::WholeTable(kind.table()),
            move |pool: SqlitePool| async move { queries::list_lookups(&pool, kind).await },
        )
        .await
    }

    pub async fn watch_books_for_lookup(
        &self,
        kind: LookupKind,
        lookup_id: i64,
    ) -> Result<LiveCursor<BookSummary>> {
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Books, kind.join_table()]),
            move |pool: SqlitePool| async move {
                queries::books_for_lookup(&pool, kind, lookup_id).await
            },
        )
        .await
    }

    pub async fn watch_collections(&self) -> Result<LiveCursor<Collection>> {
        LiveCursor::open(
            self,
            Dependency::WholeTable(Table::Collections),
            |pool: SqlitePool| async move { queries::list_collections(&pool).await },
        )
        .await
    }

    pub async fn watch_contacts(&self) -> Result<LiveCursor<Contact>> {
        LiveCursor::open(
            self,
            Dependency::WholeTable(Table::Contacts),
            |pool: SqlitePool| async move { queries::list_contacts(&pool).await },
        )
        .await
    }

    /// Every loan of one book, newest first
    pub async fn watch_loan_history(&self, book_id: i64) -> Result<LiveCursor<Loan>> {
        LiveCursor::open(
            self,
            Dependency::Row(Table::Loans, book_id),
            move |pool: SqlitePool| async move { queries::loan_history(&pool, book_id).await },
        )
        .await
    }

    pub async fn watch_active_loans(&self) -> Result<LiveCursor<LoanSummary>> {
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Loans, Table::Books]),
            |pool: SqlitePool| async move { queries::active_loans(&pool).await },
        )
        .await
    }

    /// Open loans due before `now`; `now` is fixed for the cursor's lifetime
    pub async fn watch_expired_loans(&self, now: NaiveDate) -> Result<LiveCursor<LoanSummary>> {
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Loans, Table::Books]),
            move |pool: SqlitePool| async move { queries::expired_loans(&pool, now).await },
        )
        .await
    }

    pub async fn watch_loans_by_contact(
        &self,
        contact_id: i64,
        active: bool,
    ) -> Result<LiveCursor<LoanSummary>> {
        LiveCursor::open(
            self,
            Dependency::tables(&[Table::Loans, Table::Books]),
            move |pool: SqlitePool| async move {
                queries::loans_by_contact(&pool, contact_id, active).await
            },
        )
        .await
    }
}
