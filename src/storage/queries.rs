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


//! Database query functions
//!
//! Read-only queries returning plain values. Live, self-invalidating
//! versions of the list queries are in [`crate::storage::views`].
//!
//! # Query Patterns
//! - Free functions taking the pool, one per screen-level read
//! - Lists come back fully materialized as `Vec`s
//! - Full-text errors surface as `MalformedQuery`

use crate::error::{LibraryError, Result};
use crate::storage::models::*;
use crate::text::{clean_isbn, search_terms, validate_search_expression};
use chrono::NaiveDate;
use sqlx::{SqliteConnection, SqlitePool};

/// Columns of a [`BookSummary`] selected from `books b`
const BOOK_SUMMARY_COLUMNS: &str = r#"
    b.id, b.title, b.subtitle,
    (SELECT GROUP_CONCAT(name, ', ') FROM (
        SELECT a.name FROM book_authors ba
        JOIN authors a ON a.id = ba.author_id
        WHERE ba.book_id = b.id
        ORDER BY ba.position
    )) AS authors,
    b.cover_url,
    b.active_loan_id IS NOT NULL AS is_loaned
"#;

const LOAN_SUMMARY_COLUMNS: &str = r#"
    l.id, l.book_id, b.title AS book_title, l.contact_id, l.contact_name,
    l.loan_date, l.due_date, l.return_date
"#;

// ============================================================================
// BOOK QUERIES
// ============================================================================

/// Find book by ID
pub async fn find_book_by_id(pool: &SqlitePool, book_id: i64) -> Result<Option<Book>> {
    let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = ?")
        .bind(book_id)
        .fetch_optional(pool)
        .await?;

    Ok(book)
}

/// Find book by its external metadata id
///
/// Used to detect books already in the library before importing them.
pub async fn find_book_by_google_id(pool: &SqlitePool, google_id: &str) -> Result<Option<Book>> {
    let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE google_id = ?")
        .bind(google_id)
        .fetch_optional(pool)
        .await?;

    Ok(book)
}

/// Find book by ISBN-10 or ISBN-13 (separators ignored)
pub async fn find_book_by_isbn(pool: &SqlitePool, isbn: &str) -> Result<Option<Book>> {
    let isbn = clean_isbn(isbn)
        .ok_or_else(|| LibraryError::invalid_input(format!("invalid ISBN: {}", isbn)))?;

    let book = sqlx::query_as::<_, Book>(
        "SELECT * FROM books WHERE isbn10 = ? OR isbn13 = ? ORDER BY id LIMIT 1",
    )
    .bind(&isbn)
    .bind(&isbn)
    .fetch_optional(pool)
    .await?;

    Ok(book)
}

/// All books in the requested order
pub async fn list_books(pool: &SqlitePool, order: BookOrder) -> Result<Vec<BookSummary>> {
    let sql = format!(
        "SELECT {} FROM books b ORDER BY {}",
        BOOK_SUMMARY_COLUMNS,
        order.order_clause()
    );
    let books = sqlx::query_as::<_, BookSummary>(&sql).fetch_all(pool).await?;

    Ok(books)
}

pub async fn count_books(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(pool)
        .await?;

    Ok(count)
}

fn lookup_names_sql(kind: LookupKind) -> String {
    format!(
        "SELECT l.name FROM {join} j JOIN {table} l ON l.id = j.{fk} \
         WHERE j.book_id = ? ORDER BY j.position, l.id",
        join = kind.join_table().as_str(),
        table = kind.table().as_str(),
        fk = kind.foreign_key(),
    )
}

async fn lookup_names_on(
    conn: &mut SqliteConnection,
    book_id: i64,
    kind: LookupKind,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(&lookup_names_sql(kind))
        .bind(book_id)
        .fetch_all(conn)
        .await?;

    Ok(names)
}

/// Names linked to a book for one lookup kind, in display order
pub async fn book_lookup_names(
    pool: &SqlitePool,
    book_id: i64,
    kind: LookupKind,
) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(&lookup_names_sql(kind))
        .bind(book_id)
        .fetch_all(pool)
        .await?;

    Ok(names)
}

/// Book with ordered authors, subjects, collections and its open loan.
///
/// All parts are read in one read transaction, so they come from the same
/// committed state even while other connections write.
pub async fn get_book_detail(pool: &SqlitePool, book_id: i64) -> Result<Option<BookDetail>> {
    let mut tx = pool.begin().await?;

    let book = sqlx::query_as::<_, Book>("SELECT * FROM books WHERE id = ?")
        .bind(book_id)
        .fetch_optional(&mut *tx)
        .await?;
    let book = match book {
        Some(book) => book,
        None => {
            tx.rollback().await?;
            return Ok(None);
        }
    };

    let active_loan = match book.active_loan_id {
        Some(loan_id) => {
            sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = ?")
                .bind(loan_id)
                .fetch_optional(&mut *tx)
                .await?
        }
        None => None,
    };
    let authors = lookup_names_on(&mut tx, book_id, LookupKind::Author).await?;
    let subjects = lookup_names_on(&mut tx, book_id, LookupKind::Subject).await?;
    let collections = lookup_names_on(&mut tx, book_id, LookupKind::Collection).await?;
    tx.rollback().await?;

    Ok(Some(BookDetail {
        book,
        authors,
        subjects,
        collections,
        active_loan,
    }))
}

// ============================================================================
// SEARCH
// ============================================================================

async fn run_search(pool: &SqlitePool, expression: &str) -> Result<Vec<BookSummary>> {
    let sql = format!(
        "SELECT {} FROM books_fts JOIN books b ON b.id = books_fts.rowid \
         WHERE books_fts MATCH ? ORDER BY books_fts.rank, b.title_normalized",
        BOOK_SUMMARY_COLUMNS
    );
    sqlx::query_as::<_, BookSummary>(&sql)
        .bind(expression)
        .fetch_all(pool)
        .await
        .map_err(LibraryError::from_search_error)
}

/// Books whose title or authors contain every word of `text` (as a prefix)
pub async fn search_books(pool: &SqlitePool, text: &str) -> Result<Vec<BookSummary>> {
    match search_terms(text) {
        Some(expression) => run_search(pool, &expression).await,
        None => Ok(Vec::new()),
    }
}

/// Books matching a full-text expression (`AND`, `OR`, `NOT`, phrases,
/// `prefix*`, `title:`/`creators:` column filters)
pub async fn search_books_expression(pool: &SqlitePool, expression: &str) -> Result<Vec<BookSummary>> {
    validate_search_expression(expression)?;
    run_search(pool, expression).await
}

// ============================================================================
// LOOKUP QUERIES
// ============================================================================

/// Rows of one lookup table with their book counts, by name
pub async fn list_lookups(pool: &SqlitePool, kind: LookupKind) -> Result<Vec<LookupEntry>> {
    let sql = format!(
        "SELECT id, name, name_normalized, ref_count FROM {} ORDER BY name_normalized",
        kind.table().as_str()
    );
    let entries = sqlx::query_as::<_, LookupEntry>(&sql).fetch_all(pool).await?;

    Ok(entries)
}

/// Books linked to one lookup row
pub async fn books_for_lookup(
    pool: &SqlitePool,
    kind: LookupKind,
    lookup_id: i64,
) -> Result<Vec<BookSummary>> {
    let sql = format!(
        "SELECT {} FROM books b JOIN {join} j ON j.book_id = b.id \
         WHERE j.{fk} = ? ORDER BY b.title_normalized, b.id",
        BOOK_SUMMARY_COLUMNS,
        join = kind.join_table().as_str(),
        fk = kind.foreign_key(),
    );
    let books = sqlx::query_as::<_, BookSummary>(&sql)
        .bind(lookup_id)
        .fetch_all(pool)
        .await?;

    Ok(books)
}

/// Collections, protected ones first
pub async fn list_collections(pool: &SqlitePool) -> Result<Vec<Collection>> {
    let collections = sqlx::query_as::<_, Collection>(
        "SELECT * FROM collections ORDER BY is_protected DESC, name_normalized",
    )
    .fetch_all(pool)
    .await?;

    Ok(collections)
}

pub async fn find_collection_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Collection>> {
    let collection = sqlx::query_as::<_, Collection>(
        "SELECT * FROM collections WHERE name_normalized = ?",
    )
    .bind(crate::text::normalize_name(name))
    .fetch_optional(pool)
    .await?;

    Ok(collection)
}

pub async fn list_contacts(pool: &SqlitePool) -> Result<Vec<Contact>> {
    let contacts = sqlx::query_as::<_, Contact>("SELECT * FROM contacts ORDER BY name_normalized, id")
        .fetch_all(pool)
        .await?;

    Ok(contacts)
}

// ============================================================================
// LOAN QUERIES
// ============================================================================

/// Every loan of a book, newest first
pub async fn loan_history(pool: &SqlitePool, book_id: i64) -> Result<Vec<Loan>> {
    let loans = sqlx::query_as::<_, Loan>(
        "SELECT * FROM loans WHERE book_id = ? ORDER BY loan_date DESC, id DESC",
    )
    .bind(book_id)
    .fetch_all(pool)
    .await?;

    Ok(loans)
}

/// Open loans, soonest due first
pub async fn active_loans(pool: &SqlitePool) -> Result<Vec<LoanSummary>> {
    let sql = format!(
        "SELECT {} FROM loans l JOIN books b ON b.id = l.book_id \
         WHERE l.return_date IS NULL ORDER BY l.due_date, l.id",
        LOAN_SUMMARY_COLUMNS
    );
    let loans = sqlx::query_as::<_, LoanSummary>(&sql).fetch_all(pool).await?;

    Ok(loans)
}

/// Open loans due strictly before `now`
pub async fn expired_loans(pool: &SqlitePool, now: NaiveDate) -> Result<Vec<LoanSummary>> {
    let sql = format!(
        "SELECT {} FROM loans l JOIN books b ON b.id = l.book_id \
         WHERE l.return_date IS NULL AND l.due_date < ? ORDER BY l.due_date, l.id",
        LOAN_SUMMARY_COLUMNS
    );
    let loans = sqlx::query_as::<_, LoanSummary>(&sql)
        .bind(now)
        .fetch_all(pool)
        .await?;

    Ok(loans)
}

/// Loans naming a contact: open ones when `active`, returned ones otherwise
pub async fn loans_by_contact(
    pool: &SqlitePool,
    contact_id: i64,
    active: bool,
) -> Result<Vec<LoanSummary>> {
    let filter = if active {
        "l.return_date IS NULL"
    } else {
        "l.return_date IS NOT NULL"
    };
    let sql = format!(
        "SELECT {} FROM loans l JOIN books b ON b.id = l.book_id \
         WHERE l.contact_id = ? AND {} ORDER BY l.loan_date DESC, l.id DESC",
        LOAN_SUMMARY_COLUMNS, filter
    );
    let loans = sqlx::query_as::<_, LoanSummary>(&sql)
        .bind(contact_id)
        .fetch_all(pool)
        .await?;

    Ok(loans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    async fn seeded() -> (Database, i64, i64) {
        let db = Database::new_in_memory().await.unwrap();
        let foo = db
            .add_book(
                &BookEntry::new()
                    .title("The Foo")
                    .isbn13("978-0-441-47812-5")
                    .google_id("foo-1")
                    .authors(["Zed Writer", "Author One"])
                    .subjects(["Fiction"])
                    .publisher("Tor"),
            )
            .await
            .unwrap()
            .id;
        let bar = db
            .add_book(&BookEntry::new().title("Bar").authors(["Author One"]))
            .await
            .unwrap()
            .id;
        (db, foo, bar)
    }

    #[tokio::test]
    async fn test_find_book_variants() {
        let (db, foo, _) = seeded().await;
        let pool = db.pool();

        assert_eq!(find_book_by_id(pool, foo).await.unwrap().unwrap().title, "The Foo");
        assert_eq!(find_book_by_google_id(pool, "foo-1").await.unwrap().unwrap().id, foo);
        assert_eq!(find_book_by_isbn(pool, "9780441478125").await.unwrap().unwrap().id, foo);
        assert!(find_book_by_isbn(pool, "0441478123").await.unwrap().is_none());
        assert!(matches!(
            find_book_by_isbn(pool, "nope").await,
            Err(LibraryError::InvalidInput(_))
        ));
        assert_eq!(count_books(pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_list_orders_and_author_text() {
        let (db, foo, bar) = seeded().await;

        let by_title = list_books(db.pool(), BookOrder::Title).await.unwrap();
        assert_eq!(by_title.iter().map(|b| b.id).collect::<Vec<_>>(), vec![bar, foo]);
        assert_eq!(by_title[1].authors.as_deref(), Some("Zed Writer, Author One"));
        assert!(!by_title[1].is_loaned);

        let by_author = list_books(db.pool(), BookOrder::Author).await.unwrap();
        assert_eq!(by_author[0].id, bar); // "author one" < "zed writer author one"

        let recent = list_books(db.pool(), BookOrder::RecentlyAdded).await.unwrap();
        assert_eq!(recent[0].id, bar);
    }

    #[tokio::test]
    async fn test_book_detail() {
        let (db, foo, _) = seeded().await;
        let detail = get_book_detail(db.pool(), foo).await.unwrap().unwrap();

        assert_eq!(detail.authors, vec!["Zed Writer", "Author One"]);
        assert_eq!(detail.subjects, vec!["Fiction"]);
        assert_eq!(detail.book.publisher.as_deref(), Some("Tor"));
        assert!(detail.collections.is_empty());
        assert!(detail.active_loan.is_none());
        assert!(get_book_detail(db.pool(), 999).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_book_detail_reads_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("library.db")).await.unwrap();
        let book = db
            .add_book(&BookEntry::new().title("X0").authors(["X0"]))
            .await
            .unwrap()
            .id;

        let writer = {
            let db = db.clone();
            tokio::spawn(async move {
                for i in 1..=200 {
                    let name = format!("X{}", i);
                    db.update_book(book, &BookEntry::new().title(name.clone()).authors([name]))
                        .await
                        .unwrap();
                }
            })
        };

        loop {
            let finished = writer.is_finished();
            let detail = get_book_detail(db.pool(), book).await.unwrap().unwrap();
            assert_eq!(
                detail.authors,
                vec![detail.book.title.clone()],
                "detail mixes two commits"
            );
            if finished {
                break;
            }
        }
        writer.await.unwrap();

        let detail = get_book_detail(db.pool(), book).await.unwrap().unwrap();
        assert_eq!(detail.book.title, "X200");
        assert_eq!(detail.authors, vec!["X200"]);
    }

    #[tokio::test]
    async fn test_search() {
        let (db, foo, bar) = seeded().await;
        let pool = db.pool();

        let hits = search_books(pool, "auth").await.unwrap();
        assert_eq!(hits.len(), 2);
        let hits = search_books(pool, "zed foo").await.unwrap();
        assert_eq!(hits.iter().map(|b| b.id).collect::<Vec<_>>(), vec![foo]);
        assert!(search_books(pool, "   ").await.unwrap().is_empty());

        let hits = search_books_expression(pool, "bar OR zed").await.unwrap();
        assert_eq!(hits.len(), 2);
        let hits = search_books_expression(pool, "title:bar").await.unwrap();
        assert_eq!(hits.iter().map(|b| b.id).collect::<Vec<_>>(), vec![bar]);

        assert!(matches!(
            search_books_expression(pool, "\"unterminated").await,
            Err(LibraryError::MalformedQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_lists() {
        let (db, foo, bar) = seeded().await;
        let authors = list_lookups(db.pool(), LookupKind::Author).await.unwrap();
        let counts: Vec<(String, i64)> =
            authors.iter().map(|a| (a.name.clone(), a.ref_count)).collect();
        assert_eq!(
            counts,
            vec![("Author One".to_string(), 2), ("Zed Writer".to_string(), 1)]
        );

        let books = books_for_lookup(db.pool(), LookupKind::Author, authors[0].id)
            .await
            .unwrap();
        assert_eq!(books.iter().map(|b| b.id).collect::<Vec<_>>(), vec![bar, foo]);

        let collections = list_collections(db.pool()).await.unwrap();
        assert_eq!(collections[0].name, "Favorites");
        assert!(collections[0].is_protected);
        assert!(find_collection_by_name(db.pool(), "FAVORITES").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_loan_queries() {
        let (db, foo, bar) = seeded().await;
        let sam = crate::storage::models::ContactRef::new("Sam");
        db.start_loan(foo, &sam, day(1), day(10)).await.unwrap();
        db.start_loan(bar, &sam, day(2), day(20)).await.unwrap();
        db.return_book(bar, None, day(5)).await.unwrap();

        let active = active_loans(db.pool()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].book_title, "The Foo");

        assert!(expired_loans(db.pool(), day(10)).await.unwrap().is_empty());
        assert_eq!(expired_loans(db.pool(), day(11)).await.unwrap().len(), 1);

        let contact = list_contacts(db.pool()).await.unwrap().remove(0);
        assert_eq!(contact.ref_count, 2);
        assert_eq!(loans_by_contact(db.pool(), contact.id, true).await.unwrap().len(), 1);
        let returned = loans_by_contact(db.pool(), contact.id, false).await.unwrap();
        assert_eq!(returned[0].book_id, bar);

        assert_eq!(loan_history(db.pool(), bar).await.unwrap().len(), 1);
        let detail = get_book_detail(db.pool(), foo).await.unwrap().unwrap();
        assert_eq!(detail.active_loan.map(|l| l.due_date), Some(day(10)));
    }
}
