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


//! Database migrations
//!
//! Schema creation and upgrades, run at open time.
//!
//! # Migration Strategy
//! sqlx's compile-time migrations need a database at build time, which the
//! Android cross-build does not have. Migrations are plain SQL executed at
//! runtime and recorded in the `_migrations` table.
//!
//! # Reference counting
//! Every lookup table carries `ref_count`, the number of join rows (for
//! contacts: loan rows) that point at it. Counts are maintained by the
//! write actions, not by triggers, so the actions can emit change
//! notifications for exactly the rows they touched.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};

/// Run all database migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    run_migration(pool, 1, "initial_schema", create_initial_schema(pool)).await?;
    run_migration(pool, 2, "books_fts", create_search_index(pool)).await?;

    Ok(())
}

/// Create migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .await?;

    Ok(())
}

/// Run a single migration if it hasn't been applied yet
async fn run_migration(
    pool: &SqlitePool,
    id: i32,
    name: &str,
    migration_fn: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let applied: Option<i32> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    if applied.is_some() {
        return Ok(());
    }

    migration_fn.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

    tracing::info!(id, name, "applied migration");
    Ok(())
}

/// Create the catalog tables, their indexes and the seed rows
async fn create_initial_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
-- ============================================================================
-- MAIN ENTITIES
-- ============================================================================

CREATE TABLE IF NOT EXISTS books (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    title TEXT NOT NULL,
    subtitle TEXT,
    description TEXT,
    dimensions TEXT,
    isbn10 TEXT,
    isbn13 TEXT,
    page_count INTEGER,
    publisher TEXT,  -- display copy of the linked publisher
    cover_url TEXT,
    rating REAL,
    release_date TEXT,  -- YYYY-MM-DD
    notes TEXT,
    google_id TEXT UNIQUE,

    -- Searchable and sortable text
    title_normalized TEXT NOT NULL DEFAULT '',
    creators_normalized TEXT NOT NULL DEFAULT '',

    -- Open loan, NULL when the book is on the shelf
    active_loan_id INTEGER,

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ============================================================================
-- LOOKUP ENTITIES (reference counted)
-- ============================================================================

CREATE TABLE IF NOT EXISTS authors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL UNIQUE,
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0)
);

CREATE TABLE IF NOT EXISTS publishers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL UNIQUE,
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0)
);

CREATE TABLE IF NOT EXISTS subjects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL UNIQUE,
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0)
);

-- Protected collections survive reaching a count of zero
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL UNIQUE,
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    is_protected INTEGER NOT NULL DEFAULT 0
);

-- Borrowers; the same display name may belong to different people
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    name_normalized TEXT NOT NULL,
    external_id TEXT,
    ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0)
);

-- ============================================================================
-- JOIN TABLES
-- ============================================================================

CREATE TABLE IF NOT EXISTS book_authors (
    book_id INTEGER NOT NULL,
    author_id INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, author_id),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (author_id) REFERENCES authors(id)
);

CREATE TABLE IF NOT EXISTS book_publishers (
    book_id INTEGER NOT NULL,
    publisher_id INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, publisher_id),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (publisher_id) REFERENCES publishers(id)
);

CREATE TABLE IF NOT EXISTS book_subjects (
    book_id INTEGER NOT NULL,
    subject_id INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, subject_id),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (subject_id) REFERENCES subjects(id)
);

CREATE TABLE IF NOT EXISTS book_collections (
    book_id INTEGER NOT NULL,
    collection_id INTEGER NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, collection_id),
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (collection_id) REFERENCES collections(id)
);

-- ============================================================================
-- LOANS
-- ============================================================================

-- Contact name and external id are copied so history reads without a join
CREATE TABLE IF NOT EXISTS loans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    book_id INTEGER NOT NULL,
    contact_id INTEGER NOT NULL,
    contact_name TEXT NOT NULL,
    contact_external_id TEXT,
    loan_date TEXT NOT NULL,
    due_date TEXT NOT NULL,
    return_date TEXT,
    FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
    FOREIGN KEY (contact_id) REFERENCES contacts(id)
);

-- ============================================================================
-- INDEXES
-- ============================================================================

CREATE INDEX IF NOT EXISTS idx_books_title ON books(title_normalized);
CREATE INDEX IF NOT EXISTS idx_books_creators ON books(creators_normalized);
CREATE INDEX IF NOT EXISTS idx_books_isbn10 ON books(isbn10);
CREATE INDEX IF NOT EXISTS idx_books_isbn13 ON books(isbn13);

CREATE INDEX IF NOT EXISTS idx_book_authors_author ON book_authors(author_id);
CREATE INDEX IF NOT EXISTS idx_book_publishers_publisher ON book_publishers(publisher_id);
CREATE INDEX IF NOT EXISTS idx_book_subjects_subject ON book_subjects(subject_id);
CREATE INDEX IF NOT EXISTS idx_book_collections_collection ON book_collections(collection_id);

CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(name_normalized);
CREATE INDEX IF NOT EXISTS idx_contacts_external_id ON contacts(external_id);

CREATE INDEX IF NOT EXISTS idx_loans_book ON loans(book_id, loan_date);
CREATE INDEX IF NOT EXISTS idx_loans_contact ON loans(contact_id);
CREATE INDEX IF NOT EXISTS idx_loans_due ON loans(due_date) WHERE return_date IS NULL;

-- At most one open loan per book
CREATE UNIQUE INDEX IF NOT EXISTS idx_loans_one_active
ON loans(book_id) WHERE return_date IS NULL;

-- ============================================================================
-- TRIGGERS for Automatic Timestamp Updates
-- ============================================================================

CREATE TRIGGER IF NOT EXISTS update_books_timestamp
AFTER UPDATE ON books
FOR EACH ROW
BEGIN
    UPDATE books SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

-- ============================================================================
-- SEED DATA
-- ============================================================================

INSERT OR IGNORE INTO collections (name, name_normalized, ref_count, is_protected)
VALUES ('Favorites', 'favorites', 0, 1);
        "#,
    )
    .await?;

    Ok(())
}

/// Full-text index over title and creators, kept in sync by triggers
async fn create_search_index(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
CREATE VIRTUAL TABLE IF NOT EXISTS books_fts USING fts5(
    title,
    creators,
    tokenize = 'unicode61 remove_diacritics 2'
);

CREATE TRIGGER IF NOT EXISTS books_fts_insert
AFTER INSERT ON books
FOR EACH ROW
BEGIN
    INSERT INTO books_fts (rowid, title, creators)
    VALUES (NEW.id, NEW.title, NEW.creators_normalized);
END;

CREATE TRIGGER IF NOT EXISTS books_fts_update
AFTER UPDATE OF title, creators_normalized ON books
FOR EACH ROW
BEGIN
    DELETE FROM books_fts WHERE rowid = OLD.id;
    INSERT INTO books_fts (rowid, title, creators)
    VALUES (NEW.id, NEW.title, NEW.creators_normalized);
END;

CREATE TRIGGER IF NOT EXISTS books_fts_delete
AFTER DELETE ON books
FOR EACH ROW
BEGIN
    DELETE FROM books_fts WHERE rowid = OLD.id;
END;

-- Index rows that existed before this migration
INSERT INTO books_fts (rowid, title, creators)
SELECT id, title, creators_normalized FROM books;
        "#,
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::Database;

    #[tokio::test]
    async fn test_migrations() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' \
             AND name NOT LIKE 'books_fts%' AND name != '_migrations' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .expect("Failed to query tables");

        let expected_tables = vec![
            "authors",
            "book_authors",
            "book_collections",
            "book_publishers",
            "book_subjects",
            "books",
            "collections",
            "contacts",
            "loans",
            "publishers",
            "subjects",
        ];

        assert_eq!(tables, expected_tables, "Missing or extra tables");

        let fts: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'books_fts'",
        )
        .fetch_one(db.pool())
        .await
        .expect("Failed to query search index");
        assert_eq!(fts, 1);
    }

    #[tokio::test]
    async fn test_migration_tracking() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _migrations")
            .fetch_one(db.pool())
            .await
            .expect("Failed to query migrations");
        assert_eq!(count, 2);

        // Re-running is a no-op
        run_migrations(db.pool()).await.expect("Failed to re-run migrations");
        let protected: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM collections WHERE is_protected = 1")
                .fetch_one(db.pool())
                .await
                .expect("Failed to count collections");
        assert_eq!(protected, 1);
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");

        let fk_enabled: i32 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .expect("Failed to check foreign keys");

        assert_eq!(fk_enabled, 1, "Foreign keys not enabled");
    }

    #[tokio::test]
    async fn test_single_active_loan_index() {
        let db = Database::new_in_memory()
            .await
            .expect("Failed to create database");
        let pool = db.pool();

        sqlx::query("INSERT INTO books (id, title) VALUES (1, 'Dune')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO contacts (id, name, name_normalized) VALUES (1, 'Sam', 'sam')")
            .execute(pool)
            .await
            .unwrap();

        let insert = "INSERT INTO loans (book_id, contact_id, contact_name, loan_date, due_date, return_date) \
                      VALUES (1, 1, 'Sam', '2024-01-01', '2024-02-01', ?)";
        sqlx::query(insert).bind(Some("2024-01-10")).execute(pool).await.unwrap();
        sqlx::query(insert).bind(None::<String>).execute(pool).await.unwrap();
        let second_open = sqlx::query(insert).bind(None::<String>).execute(pool).await;
        assert!(second_open.is_err(), "two open loans for one book");
    }
}
