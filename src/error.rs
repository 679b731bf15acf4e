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


//! Error types for Shelves
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by where they surface: transactions, queries, the
//! loan/collection state rules, live cursors and configuration.
//!
//! ## Propagation
//!
//! - Errors raised inside a write scope always roll the transaction back
//!   before they reach the caller.
//! - Errors raised while building a live cursor never leave the cursor
//!   registered for invalidation.

use thiserror::Error;

/// Result type alias using our LibraryError type
pub type Result<T> = std::result::Result<T, LibraryError>;

/// Main error type for Shelves
#[derive(Error, Debug)]
pub enum LibraryError {
    // ===== Transaction / Store Errors =====

    /// The store could not open, commit or roll back a transaction
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Generic database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Database schema migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    // ===== Query Errors =====

    /// Search expression could not be parsed (e.g. unbalanced quotes)
    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    /// Database record not found (operating on a deleted id)
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== State Rule Errors =====

    /// Operation conflicts with current state (book already loaned,
    /// duplicate collection name, protected collection)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object is in the wrong state for the requested operation
    /// (closed or deactivated cursor, unbalanced transaction)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ===== Configuration / File Errors =====

    /// Configuration is invalid or incomplete
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    // ===== General Errors =====

    /// Operation was cancelled by user or system
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JNI bridge error (Android only)
    #[error("JNI error: {0}")]
    #[cfg(target_os = "android")]
    JniError(String),
}

impl From<chrono::ParseError> for LibraryError {
    fn from(err: chrono::ParseError) -> Self {
        LibraryError::InvalidInput(format!("Failed to parse date: {}", err))
    }
}

// Helper methods for creating common errors
impl LibraryError {
    /// Create a RecordNotFound error with a resource name
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        LibraryError::RecordNotFound(resource.into())
    }

    /// Create a Conflict error with a message
    pub fn conflict<S: Into<String>>(message: S) -> Self {
        LibraryError::Conflict(message.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LibraryError::InvalidInput(message.into())
    }

    /// Create an InvalidState error with a message
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        LibraryError::InvalidState(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        LibraryError::InternalError(message.into())
    }

    /// Map a driver error raised while evaluating a full-text `MATCH`.
    ///
    /// SQLite reports bad FTS syntax as a plain database error; those are
    /// surfaced as `MalformedQuery` so callers can tell them apart from
    /// store failures.
    pub fn from_search_error(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let lower = message.to_lowercase();
                if lower.contains("fts5")
                    || lower.contains("syntax error")
                    || lower.contains("malformed match")
                    || lower.contains("unterminated string")
                {
                    LibraryError::MalformedQuery(message)
                } else {
                    LibraryError::SqlxError(err)
                }
            }
            _ => LibraryError::SqlxError(err),
        }
    }

    /// Check if error is a state conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, LibraryError::Conflict(_))
    }

    /// Check if error reports a missing record
    pub fn is_not_found(&self) -> bool {
        matches!(self, LibraryError::RecordNotFound(_))
    }

    /// Check if error is retryable
    ///
    /// Returns `true` for failures caused by lock contention or a store that
    /// could not start a transaction; bad input and state conflicts will not
    /// improve on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            LibraryError::TransactionFailed(_) => true,
            LibraryError::SqlxError(sqlx::Error::PoolTimedOut) => true,
            LibraryError::SqlxError(sqlx::Error::Database(db_err)) => {
                let message = db_err.message().to_lowercase();
                message.contains("database is locked") || message.contains("busy")
            }
            _ => false,
        }
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            LibraryError::Conflict(message) => {
                format!("That can't be done right now: {}.", message)
            }
            LibraryError::RecordNotFound(what) => {
                format!("{} no longer exists. It may have been deleted.", what)
            }
            LibraryError::MalformedQuery(_) => {
                "The search could not be understood. Check quotes and parentheses.".to_string()
            }
            LibraryError::TransactionFailed(_) => {
                "The library could not be saved. Please try again.".to_string()
            }
            LibraryError::Cancelled => "The operation was cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifiers() {
        assert!(LibraryError::conflict("book already loaned").is_conflict());
        assert!(LibraryError::not_found("Book 4").is_not_found());
        assert!(LibraryError::TransactionFailed("locked".into()).is_retryable());
        assert!(!LibraryError::invalid_input("empty title").is_retryable());
    }

    #[test]
    fn test_user_message() {
        let err = LibraryError::not_found("Book 12");
        assert!(err.user_message().starts_with("Book 12 no longer exists"));

        let err = LibraryError::MalformedQuery("unterminated string".into());
        assert!(err.user_message().contains("quotes"));
    }
}
