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


//! Reference-counted lookup tables
//!
//! Authors, publishers, subjects and collections are shared between books
//! through join tables. Each lookup row's `ref_count` equals the number of
//! join rows pointing at it. A row whose count drops to zero is deleted in
//! the same transaction, unless it is a protected collection.
//!
//! All functions here run inside a [`Transaction`] and queue the changes
//! they make.

use crate::error::{LibraryError, Result};
use crate::storage::invalidation::Table;
use crate::storage::models::LookupKind;
use crate::storage::transaction::Transaction;
use crate::text::{display_name, normalize_name};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::debug;

/// Id of the row named `name`, creating it with a count of zero if needed.
///
/// Returns the id and whether the row was created.
pub(crate) async fn find_or_create(
    tx: &mut Transaction,
    kind: LookupKind,
    name: &str,
) -> Result<(i64, bool)> {
    let normalized = normalize_name(name);
    if normalized.is_empty() {
        return Err(LibraryError::invalid_input(format!(
            "{} name must not be empty",
            kind.label()
        )));
    }

    let table = kind.table().as_str();
    let existing: Option<i64> =
        sqlx::query_scalar(&format!("SELECT id FROM {} WHERE name_normalized = ?", table))
            .bind(&normalized)
            .fetch_optional(tx.conn())
            .await?;
    if let Some(id) = existing {
        return Ok((id, false));
    }

    let result = sqlx::query(&format!(
        "INSERT INTO {} (name, name_normalized, ref_count) VALUES (?, ?, 0)",
        table
    ))
    .bind(display_name(name))
    .bind(&normalized)
    .execute(tx.conn())
    .await?;

    let id = result.last_insert_rowid();
    tx.notify_change(kind.table(), Some(id));
    debug!(kind = kind.label(), id, "created lookup row");
    Ok((id, true))
}

/// Add one reference to a lookup row
pub(crate) async fn acquire(tx: &mut Transaction, kind: LookupKind, id: i64) -> Result<()> {
    let result = sqlx::query(&format!(
        "UPDATE {} SET ref_count = ref_count + 1 WHERE id = ?",
        kind.table().as_str()
    ))
    .bind(id)
    .execute(tx.conn())
    .await?;

    if result.rows_affected() == 0 {
        return Err(LibraryError::not_found(format!("{} {}", kind.label(), id)));
    }
    tx.notify_change(kind.table(), Some(id));
    Ok(())
}

/// Drop one reference; deletes the row when none remain.
///
/// Returns whether the row was deleted.
pub(crate) async fn release(tx: &mut Transaction, kind: LookupKind, id: i64) -> Result<bool> {
    let table = kind.table().as_str();
    let result = sqlx::query(&format!(
        "UPDATE {} SET ref_count = ref_count - 1 WHERE id = ? AND ref_count > 0",
        table
    ))
    .bind(id)
    .execute(tx.conn())
    .await?;
    if result.rows_affected() == 0 {
        return Err(LibraryError::internal(format!(
            "released {} {} with no references left",
            kind.label(),
            id
        )));
    }
    tx.notify_change(kind.table(), Some(id));

    let delete = if kind.has_protected_rows() {
        format!(
            "DELETE FROM {} WHERE id = ? AND ref_count = 0 AND is_protected = 0",
            table
        )
    } else {
        format!("DELETE FROM {} WHERE id = ? AND ref_count = 0", table)
    };
    let deleted = sqlx::query(&delete).bind(id).execute(tx.conn()).await?.rows_affected() > 0;
    if deleted {
        debug!(kind = kind.label(), id, "deleted unreferenced lookup row");
    }
    Ok(deleted)
}

/// Desired names in order, de-duplicated on their normalized form
fn desired_names(kind: LookupKind, names: &[String]) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    let mut desired: Vec<(String, String)> = names
        .iter()
        .map(|name| (normalize_name(name), name.clone()))
        .filter(|(normalized, _)| !normalized.is_empty() && seen.insert(normalized.clone()))
        .collect();
    if kind.is_single_valued() {
        desired.truncate(1);
    }
    desired
}

struct Linked {
    id: i64,
    normalized: String,
    position: i64,
}

async fn linked_rows(tx: &mut Transaction, kind: LookupKind, book_id: i64) -> Result<Vec<Linked>> {
    let sql = format!(
        "SELECT l.id, l.name_normalized, j.position FROM {join} j \
         JOIN {table} l ON l.id = j.{fk} \
         WHERE j.book_id = ? ORDER BY j.position, l.id",
        join = kind.join_table().as_str(),
        table = kind.table().as_str(),
        fk = kind.foreign_key(),
    );
    let rows = sqlx::query(&sql).bind(book_id).fetch_all(tx.conn()).await?;
    rows.iter()
        .map(|row| -> Result<Linked> {
            Ok(Linked {
                id: row.try_get("id")?,
                normalized: row.try_get("name_normalized")?,
                position: row.try_get("position")?,
            })
        })
        .collect()
}

/// Replace the book's links of one kind with `names`, in order.
///
/// Links whose normalized name is kept stay in place (only their position
/// may change), dropped ones release their lookup row and new ones acquire
/// (or create) theirs. Positions are renumbered from zero whenever the list
/// changes. Setting the names a book already has, in the same order, is a
/// no-op that queues nothing. Returns whether anything changed.
pub async fn set_book_lookups(
    tx: &mut Transaction,
    book_id: i64,
    kind: LookupKind,
    names: &[String],
) -> Result<bool> {
    let desired = desired_names(kind, names);
    let current = linked_rows(tx, kind, book_id).await?;

    // Positions may have gaps left by single removals; only the order counts
    let unchanged = current.len() == desired.len()
        && current
            .iter()
            .zip(&desired)
            .all(|(linked, (normalized, _))| linked.normalized == *normalized);
    if unchanged {
        return Ok(false);
    }

    let join = kind.join_table().as_str();
    let fk = kind.foreign_key();

    for linked in &current {
        if desired.iter().any(|(normalized, _)| *normalized == linked.normalized) {
            continue;
        }
        sqlx::query(&format!("DELETE FROM {} WHERE book_id = ? AND {} = ?", join, fk))
            .bind(book_id)
            .bind(linked.id)
            .execute(tx.conn())
            .await?;
        release(tx, kind, linked.id).await?;
    }

    for (position, (normalized, name)) in desired.iter().enumerate() {
        let position = position as i64;
        match current.iter().find(|linked| linked.normalized == *normalized) {
            Some(linked) if linked.position == position => {}
            Some(linked) => {
                sqlx::query(&format!(
                    "UPDATE {} SET position = ? WHERE book_id = ? AND {} = ?",
                    join, fk
                ))
                .bind(position)
                .bind(book_id)
                .bind(linked.id)
                .execute(tx.conn())
                .await?;
            }
            None => {
                let (id, _) = find_or_create(tx, kind, name).await?;
                sqlx::query(&format!(
                    "INSERT INTO {} (book_id, {}, position) VALUES (?, ?, ?)",
                    join, fk
                ))
                .bind(book_id)
                .bind(id)
                .bind(position)
                .execute(tx.conn())
                .await?;
                acquire(tx, kind, id).await?;
            }
        }
    }

    tx.notify_change(kind.join_table(), Some(book_id));
    sync_book_columns(tx, book_id, kind).await?;
    Ok(true)
}

/// Refresh the book columns derived from its links
async fn sync_book_columns(tx: &mut Transaction, book_id: i64, kind: LookupKind) -> Result<()> {
    match kind {
        LookupKind::Author => {
            let names: Vec<String> = sqlx::query_scalar(
                "SELECT a.name_normalized FROM book_authors ba \
                 JOIN authors a ON a.id = ba.author_id \
                 WHERE ba.book_id = ? ORDER BY ba.position",
            )
            .bind(book_id)
            .fetch_all(tx.conn())
            .await?;

            sqlx::query("UPDATE books SET creators_normalized = ? WHERE id = ?")
                .bind(names.join(" "))
                .bind(book_id)
                .execute(tx.conn())
                .await?;
        }
        LookupKind::Publisher => {
            let name: Option<String> = sqlx::query_scalar(
                "SELECT p.name FROM book_publishers bp \
                 JOIN publishers p ON p.id = bp.publisher_id \
                 WHERE bp.book_id = ? ORDER BY bp.position LIMIT 1",
            )
            .bind(book_id)
            .fetch_optional(tx.conn())
            .await?;

            sqlx::query("UPDATE books SET publisher = ? WHERE id = ?")
                .bind(name)
                .bind(book_id)
                .execute(tx.conn())
                .await?;
        }
        LookupKind::Subject | LookupKind::Collection => return Ok(()),
    }
    tx.notify_change(Table::Books, Some(book_id));
    Ok(())
}

/// Release every link the book holds, of every kind
pub(crate) async fn release_all(tx: &mut Transaction, book_id: i64) -> Result<()> {
    for kind in LookupKind::ALL {
        set_book_lookups(tx, book_id, kind, &[]).await?;
    }
    Ok(())
}

// ============================================================================
// CONSISTENCY CHECKS
// ============================================================================

/// Every stored count that disagrees with its referencing rows, every
/// unprotected row left at zero, and every book whose loan pointer does not
/// match its open loan.
pub async fn verify_reference_counts(pool: &SqlitePool) -> Result<Vec<String>> {
    let mut problems = Vec::new();

    let mut sources: Vec<(&str, &str, &str, &str)> = LookupKind::ALL
        .iter()
        .map(|kind| {
            (
                kind.label(),
                kind.table().as_str(),
                kind.join_table().as_str(),
                kind.foreign_key(),
            )
        })
        .collect();
    sources.push(("contact", "contacts", "loans", "contact_id"));

    for (label, table, referencing, fk) in sources {
        let sql = format!(
            "SELECT id, name, ref_count, actual FROM ( \
                 SELECT l.id, l.name, l.ref_count, \
                        (SELECT COUNT(*) FROM {referencing} r WHERE r.{fk} = l.id) AS actual \
                 FROM {table} l \
             ) WHERE ref_count != actual",
        );
        for row in sqlx::query(&sql).fetch_all(pool).await? {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            let stored: i64 = row.try_get("ref_count")?;
            let actual: i64 = row.try_get("actual")?;
            problems.push(format!(
                "{} {} ({}) has ref_count {} but {} references",
                label, id, name, stored, actual
            ));
        }

        // Empty user collections are kept until their last book leaves
        if table == "collections" {
            continue;
        }
        let orphans = format!("SELECT id, name FROM {} WHERE ref_count = 0", table);
        for row in sqlx::query(&orphans).fetch_all(pool).await? {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            problems.push(format!("{} {} ({}) is unreferenced", label, id, name));
        }
    }

    let mismatched: Vec<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
        "SELECT b.id, b.active_loan_id, l.id FROM books b \
         LEFT JOIN loans l ON l.book_id = b.id AND l.return_date IS NULL \
         WHERE b.active_loan_id IS NOT l.id",
    )
    .fetch_all(pool)
    .await?;
    for (book_id, pointer, open) in mismatched {
        problems.push(format!(
            "book {} points at loan {:?} but its open loan is {:?}",
            book_id, pointer, open
        ));
    }

    Ok(problems)
}
