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


//! Book and collection write actions
//!
//! Each action takes an open [`Transaction`] so callers can compose several
//! of them into one commit. The `Database` methods at the bottom of this
//! file run a single action in its own transaction.

use crate::error::{LibraryError, Result};
use crate::storage::database::Database;
use crate::storage::invalidation::Table;
use crate::storage::lookups::{self, set_book_lookups};
use crate::storage::loans;
use crate::storage::models::{Book, BookEntry, BookField, FieldValue, LookupKind};
use crate::storage::transaction::Transaction;
use crate::text::{clean_isbn, normalize_name, normalize_title};
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;
use tracing::{debug, info};

/// Outcome of adding a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedBook {
    pub id: i64,
    /// False when a book with the same external id already existed
    pub created: bool,
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &FieldValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Text(text) => query.bind(text.clone()),
        FieldValue::Integer(number) => query.bind(*number),
        FieldValue::Real(number) => query.bind(*number),
        FieldValue::Date(date) => query.bind(*date),
    }
}

/// Map unique-constraint failures to `Conflict`
fn conflict_on_unique(err: sqlx::Error, what: &str) -> LibraryError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            LibraryError::conflict(format!("{} already exists", what))
        }
        _ => LibraryError::from(err),
    }
}

/// Validate and canonicalize the scalar values of an entry
fn prepared_values(entry: &BookEntry) -> Result<Vec<(BookField, FieldValue)>> {
    entry
        .values()
        .iter()
        .map(|(field, value)| match (field, value) {
            (BookField::Title, FieldValue::Text(None)) => {
                Err(LibraryError::invalid_input("title must not be empty"))
            }
            (BookField::Isbn10 | BookField::Isbn13, FieldValue::Text(Some(isbn))) => {
                let cleaned = clean_isbn(isbn)
                    .ok_or_else(|| LibraryError::invalid_input(format!("invalid ISBN: {}", isbn)))?;
                Ok((*field, FieldValue::Text(Some(cleaned))))
            }
            (BookField::PageCount, FieldValue::Integer(Some(pages))) if *pages < 0 => {
                Err(LibraryError::invalid_input("page count must not be negative"))
            }
            _ => Ok((*field, value.clone())),
        })
        .collect()
}

fn current_value(book: &Book, field: BookField) -> FieldValue {
    match field {
        BookField::Title => FieldValue::Text(Some(book.title.clone())),
        BookField::Subtitle => FieldValue::Text(book.subtitle.clone()),
        BookField::Description => FieldValue::Text(book.description.clone()),
        BookField::Dimensions => FieldValue::Text(book.dimensions.clone()),
        BookField::Isbn10 => FieldValue::Text(book.isbn10.clone()),
        BookField::Isbn13 => FieldValue::Text(book.isbn13.clone()),
        BookField::PageCount => FieldValue::Integer(book.page_count),
        BookField::CoverUrl => FieldValue::Text(book.cover_url.clone()),
        BookField::Rating => FieldValue::Real(book.rating),
        BookField::ReleaseDate => FieldValue::Date(book.release_date),
        BookField::Notes => FieldValue::Text(book.notes.clone()),
        BookField::GoogleId => FieldValue::Text(book.google_id.clone()),
    }
}

pub(crate) async fn fetch_book(tx: &mut Transaction, book_id: i64) -> Result<Book> {
    sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = ?")
        .bind(book_id)
        .fetch_optional(tx.conn())
        .await?
        .ok_or_else(|| LibraryError::not_found(format!("book {}", book_id)))
}

async fn apply_lookups(tx: &mut Transaction, book_id: i64, entry: &BookEntry) -> Result<bool> {
    let mut changed = false;
    for kind in LookupKind::ALL {
        if let Some(names) = entry.lookup_names(kind) {
            changed |= set_book_lookups(tx, book_id, kind, &names).await?;
        }
    }
    Ok(changed)
}

// ============================================================================
// BOOK ACTIONS
// ============================================================================

/// Insert a book with its relations.
///
/// A book whose external id is already stored is returned as-is without
/// any write.
pub async fn insert_book(tx: &mut Transaction, entry: &BookEntry) -> Result<AddedBook> {
    let title = match entry.title_value() {
        Some(Some(title)) => title.to_string(),
        _ => return Err(LibraryError::invalid_input("a book needs a title")),
    };

    if let Some(google_id) = entry.google_id_value() {
        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM books WHERE google_id = ?")
            .bind(google_id)
            .fetch_optional(tx.conn())
            .await?;
        if let Some(id) = existing {
            debug!(id, google_id, "book already in library");
            return Ok(AddedBook { id, created: false });
        }
    }

    let values = prepared_values(entry)?;
    let mut columns: Vec<&str> = values.iter().map(|(field, _)| field.column()).collect();
    columns.push("title_normalized");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO books ({}) VALUES ({})",
        columns.join(", "),
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for (_, value) in &values {
        query = bind_value(query, value);
    }
    let id = query
        .bind(normalize_title(&title))
        .execute(tx.conn())
        .await
        .map_err(|e| conflict_on_unique(e, "a book with this external id"))?
        .last_insert_rowid();

    tx.notify_change(Table::Books, Some(id));
    apply_lookups(tx, id, entry).await?;

    info!(id, "added book");
    Ok(AddedBook { id, created: true })
}

/// Apply the fields and relation lists set on `entry` to an existing book.
///
/// Values equal to the stored ones are skipped, so re-applying an entry
/// writes and notifies nothing. Returns whether anything changed.
pub async fn update_book(tx: &mut Transaction, book_id: i64, entry: &BookEntry) -> Result<bool> {
    let book = fetch_book(tx, book_id).await?;
    let values = prepared_values(entry)?;

    let changed: Vec<&(BookField, FieldValue)> = values
        .iter()
        .filter(|(field, value)| current_value(&book, *field) != *value)
        .collect();

    let mut updated = false;
    if !changed.is_empty() {
        let mut assignments: Vec<String> = changed
            .iter()
            .map(|(field, _)| format!("{} = ?", field.column()))
            .collect();
        let new_title = changed.iter().find_map(|(field, value)| match (field, value) {
            (BookField::Title, FieldValue::Text(Some(title))) => Some(normalize_title(title)),
            _ => None,
        });
        if new_title.is_some() {
            assignments.push("title_normalized = ?".to_string());
        }

        let sql = format!("UPDATE books SET {} WHERE id = ?", assignments.join(", "));
        let mut query = sqlx::query(&sql);
        for (_, value) in &changed {
            query = bind_value(query, value);
        }
        if let Some(title) = new_title {
            query = query.bind(title);
        }
        query
            .bind(book_id)
            .execute(tx.conn())
            .await
            .map_err(|e| conflict_on_unique(e, "a book with this external id"))?;

        tx.notify_change(Table::Books, Some(book_id));
        updated = true;
    }

    updated |= apply_lookups(tx, book_id, entry).await?;
    if updated {
        debug!(book_id, "updated book");
    }
    Ok(updated)
}

/// Delete a book, releasing every lookup row and contact it referenced
pub async fn delete_book(tx: &mut Transaction, book_id: i64) -> Result<()> {
    fetch_book(tx, book_id).await?;

    lookups::release_all(tx, book_id).await?;
    loans::delete_loans_of_book(tx, book_id).await?;

    sqlx::query("DELETE FROM books WHERE id = ?")
        .bind(book_id)
        .execute(tx.conn())
        .await?;

    tx.notify_change(Table::Books, Some(book_id));
    info!(book_id, "deleted book");
    Ok(())
}

// ============================================================================
// COLLECTION ACTIONS
// ============================================================================

async fn collection_is_protected(tx: &mut Transaction, collection_id: i64) -> Result<bool> {
    let protected: Option<bool> =
        sqlx::query_scalar("SELECT is_protected FROM collections WHERE id = ?")
            .bind(collection_id)
            .fetch_optional(tx.conn())
            .await?;
    match protected {
        Some(protected) => Ok(protected),
        None => Err(LibraryError::not_found(format!("collection {}", collection_id))),
    }
}

/// Create an empty collection, or return the one with the same name
pub async fn add_collection(tx: &mut Transaction, name: &str) -> Result<i64> {
    let (id, created) = lookups::find_or_create(tx, LookupKind::Collection, name).await?;
    if created {
        info!(id, "added collection");
    }
    Ok(id)
}

/// Rename a user collection.
///
/// Fails with `Conflict` for a protected collection or when another
/// collection already has the name.
pub async fn rename_collection(tx: &mut Transaction, collection_id: i64, name: &str) -> Result<bool> {
    if collection_is_protected(tx, collection_id).await? {
        return Err(LibraryError::conflict("protected collections cannot be renamed"));
    }

    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return Err(LibraryError::invalid_input("collection name must not be empty"));
    }
    let clash: Option<i64> =
        sqlx::query_scalar("SELECT id FROM collections WHERE name_normalized = ? AND id != ?")
            .bind(&normalized)
            .bind(collection_id)
            .fetch_optional(tx.conn())
            .await?;
    if clash.is_some() {
        return Err(LibraryError::conflict(format!("collection \"{}\" already exists", name.trim())));
    }

    let display = crate::text::display_name(name);
    let result = sqlx::query(
        "UPDATE collections SET name = ?, name_normalized = ? WHERE id = ? AND name != ?",
    )
    .bind(&display)
    .bind(&normalized)
    .bind(collection_id)
    .bind(&display)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    tx.notify_change(Table::Collections, Some(collection_id));
    // Book details show collection names
    tx.notify_change(Table::BookCollections, None);
    Ok(true)
}

/// Remove a user collection and every membership in it
pub async fn remove_collection(tx: &mut Transaction, collection_id: i64) -> Result<()> {
    if collection_is_protected(tx, collection_id).await? {
        return Err(LibraryError::conflict("protected collections cannot be removed"));
    }

    let members: Vec<i64> =
        sqlx::query_scalar("SELECT book_id FROM book_collections WHERE collection_id = ?")
            .bind(collection_id)
            .fetch_all(tx.conn())
            .await?;
    sqlx::query("DELETE FROM book_collections WHERE collection_id = ?")
        .bind(collection_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM collections WHERE id = ?")
        .bind(collection_id)
        .execute(tx.conn())
        .await?;

    for book_id in members {
        tx.notify_change(Table::BookCollections, Some(book_id));
    }
    tx.notify_change(Table::Collections, Some(collection_id));
    info!(collection_id, "removed collection");
    Ok(())
}

/// Put a book into a collection; returns false if it already was
pub async fn add_book_to_collection(
    tx: &mut Transaction,
    book_id: i64,
    collection_id: i64,
) -> Result<bool> {
    fetch_book(tx, book_id).await?;
    collection_is_protected(tx, collection_id).await?;

    let result = sqlx::query(
        "INSERT OR IGNORE INTO book_collections (book_id, collection_id, position) \
         SELECT ?, ?, COALESCE(MAX(position) + 1, 0) FROM book_collections WHERE book_id = ?",
    )
    .bind(book_id)
    .bind(collection_id)
    .bind(book_id)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    lookups::acquire(tx, LookupKind::Collection, collection_id).await?;
    tx.notify_change(Table::BookCollections, Some(book_id));
    Ok(true)
}

/// Take a book out of a collection; returns false if it was not in it.
///
/// A user collection whose last book leaves is deleted.
pub async fn remove_book_from_collection(
    tx: &mut Transaction,
    book_id: i64,
    collection_id: i64,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM book_collections WHERE book_id = ? AND collection_id = ?")
        .bind(book_id)
        .bind(collection_id)
        .execute(tx.conn())
        .await?;
    if result.rows_affected() == 0 {
        return Ok(false);
    }

    lookups::release(tx, LookupKind::Collection, collection_id).await?;
    tx.notify_change(Table::BookCollections, Some(book_id));
    Ok(true)
}

// ============================================================================
// SINGLE-ACTION TRANSACTIONS
// ============================================================================

impl Database {
    /// Add a book (or find it by external id) in its own transaction
    pub async fn add_book(&self, entry: &BookEntry) -> Result<AddedBook> {
        let mut tx = self.begin_transaction().await?;
        let result = insert_book(&mut tx, entry).await;
        tx.finish(result).await
    }

    pub async fn update_book(&self, book_id: i64, entry: &BookEntry) -> Result<bool> {
        let mut tx = self.begin_transaction().await?;
        let result = update_book(&mut tx, book_id, entry).await;
        tx.finish(result).await
    }

    pub async fn delete_book(&self, book_id: i64) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        let result = delete_book(&mut tx, book_id).await;
        tx.finish(result).await
    }

    /// Replace one relation list of a book
    pub async fn set_book_lookups(
        &self,
        book_id: i64,
        kind: LookupKind,
        names: &[String],
    ) -> Result<bool> {
        let mut tx = self.begin_transaction().await?;
        let result = match fetch_book(&mut tx, book_id).await {
            Ok(_) => set_book_lookups(&mut tx, book_id, kind, names).await,
            Err(err) => Err(err),
        };
        tx.finish(result).await
    }

    pub async fn set_book_authors(&self, book_id: i64, names: &[String]) -> Result<bool> {
        self.set_book_lookups(book_id, LookupKind::Author, names).await
    }

    pub async fn set_book_subjects(&self, book_id: i64, names: &[String]) -> Result<bool> {
        self.set_book_lookups(book_id, LookupKind::Subject, names).await
    }

    pub async fn set_book_collections(&self, book_id: i64, names: &[String]) -> Result<bool> {
        self.set_book_lookups(book_id, LookupKind::Collection, names).await
    }

    pub async fn set_book_publisher(&self, book_id: i64, name: Option<&str>) -> Result<bool> {
        let names: Vec<String> = name.into_iter().map(str::to_string).collect();
        self.set_book_lookups(book_id, LookupKind::Publisher, &names).await
    }

    pub async fn add_collection(&self, name: &str) -> Result<i64> {
        let mut tx = self.begin_transaction().await?;
        let result = add_collection(&mut tx, name).await;
        tx.finish(result).await
    }

    pub async fn rename_collection(&self, collection_id: i64, name: &str) -> Result<bool> {
        let mut tx = self.begin_transaction().await?;
        let result = rename_collection(&mut tx, collection_id, name).await;
        tx.finish(result).await
    }

    pub async fn remove_collection(&self, collection_id: i64) -> Result<()> {
        let mut tx = self.begin_transaction().await?;
        let result = remove_collection(&mut tx, collection_id).await;
        tx.finish(result).await
    }

    pub async fn add_book_to_collection(&self, book_id: i64, collection_id: i64) -> Result<bool> {
        let mut tx = self.begin_transaction().await?;
        let result = add_book_to_collection(&mut tx, book_id, collection_id).await;
        tx.finish(result).await
    }

    pub async fn remove_book_from_collection(
        &self,
        book_id: i64,
        collection_id: i64,
    ) -> Result<bool> {
        let mut tx = self.begin_transaction().await?;
        let result = remove_book_from_collection(&mut tx, book_id, collection_id).await;
        tx.finish(result).await
    }
}
