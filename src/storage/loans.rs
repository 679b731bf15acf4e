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


//! Loan state machine
//!
//! A book is either on the shelf or lent out:
//! `NotLoaned --start_loan--> Loaned --return_book--> NotLoaned`
//!
//! The open loan's id is copied onto `books.active_loan_id`. Returned loans
//! stay in `loans` as history and keep their contact referenced, so a
//! contact's `ref_count` counts every loan row naming it.

use crate::error::{LibraryError, Result};
use crate::storage::actions::fetch_book;
use crate::storage::database::Database;
use crate::storage::invalidation::Table;
use crate::storage::models::{ContactRef, Loan};
use crate::storage::transaction::Transaction;
use crate::text::{display_name, normalize_name};
use chrono::NaiveDate;
use tracing::{debug, info};

/// Contact row for `contact`, created with a count of zero if new.
///
/// Contacts carrying an external id are matched on it (and renamed if the
/// address book changed the name); others on their normalized name.
async fn find_or_create_contact(tx: &mut Transaction, contact: &ContactRef) -> Result<i64> {
    let normalized = normalize_name(&contact.name);
    if normalized.is_empty() {
        return Err(LibraryError::invalid_input("contact name must not be empty"));
    }
    let name = display_name(&contact.name);

    let existing: Option<(i64, String)> = match &contact.external_id {
        Some(external_id) => {
            sqlx::query_as("SELECT id, name FROM contacts WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(tx.conn())
                .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id, name FROM contacts \
                 WHERE name_normalized = ? AND external_id IS NULL ORDER BY id LIMIT 1",
            )
            .bind(&normalized)
            .fetch_optional(tx.conn())
            .await?
        }
    };

    if let Some((id, stored_name)) = existing {
        if stored_name != name {
            sqlx::query("UPDATE contacts SET name = ?, name_normalized = ? WHERE id = ?")
                .bind(&name)
                .bind(&normalized)
                .bind(id)
                .execute(tx.conn())
                .await?;
            tx.notify_change(Table::Contacts, Some(id));
        }
        return Ok(id);
    }

    let id = sqlx::query(
        "INSERT INTO contacts (name, name_normalized, external_id, ref_count) VALUES (?, ?, ?, 0)",
    )
    .bind(&name)
    .bind(&normalized)
    .bind(&contact.external_id)
    .execute(tx.conn())
    .await?
    .last_insert_rowid();

    tx.notify_change(Table::Contacts, Some(id));
    debug!(id, "created contact");
    Ok(id)
}

/// Drop one loan reference from a contact, deleting it at zero
async fn release_contact(tx: &mut Transaction, contact_id: i64) -> Result<()> {
    sqlx::query("UPDATE contacts SET ref_count = ref_count - 1 WHERE id = ? AND ref_count > 0")
        .bind(contact_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("DELETE FROM contacts WHERE id = ? AND ref_count = 0")
        .bind(contact_id)
        .execute(tx.conn())
        .await?;
    tx.notify_change(Table::Contacts, Some(contact_id));
    Ok(())
}

async fn fetch_loan(tx: &mut Transaction, loan_id: i64) -> Result<Loan> {
    sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = ?")
        .bind(loan_id)
        .fetch_optional(tx.conn())
        .await?
        .ok_or_else(|| LibraryError::not_found(format!("loan {}", loan_id)))
}

/// Lend a book to `contact` from `loan_date` until `due_date`.
///
/// # Errors
/// - `RecordNotFound` if the book does not exist
/// - `Conflict` if the book is already lent out
/// - `InvalidInput` for a blank contact name or a due date before the loan date
pub async fn start_loan(
    tx: &mut Transaction,
    book_id: i64,
    contact: &ContactRef,
    loan_date: NaiveDate,
    due_date: NaiveDate,
) -> Result<Loan> {
    let book = fetch_book(tx, book_id).await?;
    if let Some(loan_id) = book.active_loan_id {
        return Err(LibraryError::conflict(format!(
            "book {} is already lent out (loan {})",
            book_id, loan_id
        )));
    }
    if due_date < loan_date {
        return Err(LibraryError::invalid_input("due date is before the loan date"));
    }

    let contact_id = find_or_create_contact(tx, contact).await?;
    let contact_name: String = sqlx::query_scalar("SELECT name FROM contacts WHERE id = ?")
        .bind(contact_id)
        .fetch_one(tx.conn())
        .await?;

    let loan_id = sqlx::query(
        "INSERT INTO loans (book_id, contact_id, contact_name, contact_external_id, loan_date, due_date) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(book_id)
    .bind(contact_id)
    .bind(&contact_name)
    .bind(&contact.external_id)
    .bind(loan_date)
    .bind(due_date)
    .execute(tx.conn())
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            LibraryError::conflict(format!("book {} is already lent out", book_id))
        }
        _ => LibraryError::from(e),
    })?
    .last_insert_rowid();

    sqlx::query("UPDATE contacts SET ref_count = ref_count + 1 WHERE id = ?")
        .bind(contact_id)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE books SET active_loan_id = ? WHERE id = ?")
        .bind(loan_id)
        .bind(book_id)
        .execute(tx.conn())
        .await?;

    tx.notify_change(Table::Books, Some(book_id));
    tx.notify_change(Table::Loans, Some(book_id));
    tx.notify_change(Table::Contacts, Some(contact_id));

    info!(book_id, loan_id, "started loan");
    fetch_loan(tx, loan_id).await
}

/// Close the book's open loan on `return_date`.
///
/// `loan_id`, when given, must name the open loan. The contact keeps its
/// reference; the loan row becomes history.
///
/// # Errors
/// - `RecordNotFound` if the book does not exist
/// - `InvalidState` if the book is not lent out, or `loan_id` is not its open loan
/// - `InvalidInput` if `return_date` is before the loan date
pub async fn return_book(
    tx: &mut Transaction,
    book_id: i64,
    loan_id: Option<i64>,
    return_date: NaiveDate,
) -> Result<Loan> {
    let book = fetch_book(tx, book_id).await?;
    let active = book
        .active_loan_id
        .ok_or_else(|| LibraryError::invalid_state(format!("book {} is not lent out", book_id)))?;
    if let Some(requested) = loan_id {
        if requested != active {
            return Err(LibraryError::invalid_state(format!(
                "loan {} is not the open loan of book {}",
                requested, book_id
            )));
        }
    }

    let loan = fetch_loan(tx, active).await?;
    if return_date < loan.loan_date {
        return Err(LibraryError::invalid_input("return date is before the loan date"));
    }

    sqlx::query("UPDATE loans SET return_date = ? WHERE id = ? AND return_date IS NULL")
        .bind(return_date)
        .bind(active)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE books SET active_loan_id = NULL WHERE id = ?")
        .bind(book_id)
        .execute(tx.conn())
        .await?;

    tx.notify_change(Table::Books, Some(book_id));
    tx.notify_change(Table::Loans, Some(book_id));
    tx.notify_change(Table::Contacts, Some(loan.contact_id));

    info!(book_id, loan_id = active, "book returned");
    fetch_loan(tx, active).await
}

/// Remove a book's loan history, releasing the contacts it referenced
pub(crate) async fn delete_loans_of_book(tx: &mut Transaction, book_id: i64) -> Result<()> {
    let contacts: Vec<i64> = sqlx::query_scalar("SELECT contact_id FROM loans WHERE book_id = ?")
        .bind(book_id)
        .fetch_all(tx.conn())
        .await?;
    if contacts.is_empty() {
        return Ok(());
    }

    sqlx::query("DELETE FROM loans WHERE book_id = ?")
        .bind(book_id)
        .execute(tx.conn())
        .await?;
    for contact_id in contacts {
        release_contact(tx, contact_id).await?;
    }
    tx.notify_change(Table::Loans, Some(book_id));
    Ok(())
}

impl Database {
    pub async fn start_loan(
        &self,
        book_id: i64,
        contact: &ContactRef,
        loan_date: NaiveDate,
        due_date: NaiveDate,
    ) -> Result<Loan> {
        let mut tx = self.begin_transaction().await?;
        let result = start_loan(&mut tx, book_id, contact, loan_date, due_date).await;
        tx.finish(result).await
    }

    pub async fn return_book(
        &self,
        book_id: i64,
        loan_id: Option<i64>,
        return_date: NaiveDate,
    ) -> Result<Loan> {
        let mut tx = self.begin_transaction().await?;
        let result = return_book(&mut tx, book_id, loan_id, return_date).await;
        tx.finish(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::BookEntry;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn contact_count(db: &Database, name: &str) -> Option<i64> {
        sqlx::query_scalar("SELECT ref_count FROM contacts WHERE name = ?")
            .bind(name)
            .fetch_optional(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_loan_cycle() {
        let db = Database::new_in_memory().await.unwrap();
        let book = db.add_book(&BookEntry::new().title("Foo")).await.unwrap().id;

        let loan = db.start_loan(book, &ContactRef::new("Sam Vimes"), day(1), day(15)).await.unwrap();
        assert!(loan.is_active());
        assert_eq!(loan.contact_name, "Sam Vimes");
        assert_eq!(contact_count(&db, "Sam Vimes").await, Some(1));

        let returned = db.return_book(book, Some(loan.id), day(10)).await.unwrap();
        assert_eq!(returned.return_date, Some(day(10)));
        assert_eq!(contact_count(&db, "Sam Vimes").await, Some(1));

        let pointer: Option<i64> = sqlx::query_scalar("SELECT active_loan_id FROM books WHERE id = ?")
            .bind(book)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(pointer.is_none());
        assert!(db.verify_reference_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_loan_conflicts_without_changes() {
        let db = Database::new_in_memory().await.unwrap();
        let book = db.add_book(&BookEntry::new().title("Foo")).await.unwrap().id;
        db.start_loan(book, &ContactRef::new("Sam"), day(1), day(2)).await.unwrap();

        let again = db.start_loan(book, &ContactRef::new("Angua"), day(3), day(4)).await;
        assert!(matches!(again, Err(LibraryError::Conflict(_))));
        assert_eq!(contact_count(&db, "Angua").await, None);
    }

    #[tokio::test]
    async fn test_invalid_loans() {
        let db = Database::new_in_memory().await.unwrap();
        let book = db.add_book(&BookEntry::new().title("Foo")).await.unwrap().id;

        let missing = db.start_loan(book + 1, &ContactRef::new("Sam"), day(1), day(2)).await;
        assert!(matches!(missing, Err(LibraryError::RecordNotFound(_))));
        let backwards = db.start_loan(book, &ContactRef::new("Sam"), day(5), day(2)).await;
        assert!(matches!(backwards, Err(LibraryError::InvalidInput(_))));
        let blank = db.start_loan(book, &ContactRef::new("  "), day(1), day(2)).await;
        assert!(matches!(blank, Err(LibraryError::InvalidInput(_))));
        let not_lent = db.return_book(book, None, day(3)).await;
        assert!(matches!(not_lent, Err(LibraryError::InvalidState(_))));

        let loan = db.start_loan(book, &ContactRef::new("Sam"), day(1), day(2)).await.unwrap();
        let wrong = db.return_book(book, Some(loan.id + 7), day(3)).await;
        assert!(matches!(wrong, Err(LibraryError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_contacts_matched_by_external_id() {
        let db = Database::new_in_memory().await.unwrap();
        let a = db.add_book(&BookEntry::new().title("A")).await.unwrap().id;
        let b = db.add_book(&BookEntry::new().title("B")).await.unwrap().id;

        let first = ContactRef::new("Sam").with_external_id("lookup/1");
        let renamed = ContactRef::new("Samuel Vimes").with_external_id("lookup/1");
        let l1 = db.start_loan(a, &first, day(1), day(2)).await.unwrap();
        let l2 = db.start_loan(b, &renamed, day(1), day(2)).await.unwrap();

        assert_eq!(l1.contact_id, l2.contact_id);
        assert_eq!(l2.contact_name, "Samuel Vimes");
        assert_eq!(contact_count(&db, "Samuel Vimes").await, Some(2));
    }

    #[tokio::test]
    async fn test_deleting_book_releases_contact() {
        let db = Database::new_in_memory().await.unwrap();
        let book = db.add_book(&BookEntry::new().title("Foo")).await.unwrap().id;
        db.start_loan(book, &ContactRef::new("Sam"), day(1), day(2)).await.unwrap();
        db.return_book(book, None, day(2)).await.unwrap();

        db.delete_book(book).await.unwrap();
        assert_eq!(contact_count(&db, "Sam").await, None);
        assert!(db.verify_reference_counts().await.unwrap().is_empty());
    }
}
