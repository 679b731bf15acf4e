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


//! Shelves core
//!
//! Embedded catalogue engine of the Shelves Android app: a SQLite library
//! of books with reference-counted authors, publishers, subjects and
//! collections, a loan ledger, full-text search and live query results
//! that know when a write made them stale.

uniffi::setup_scaffolding!();

pub mod config;
pub mod error;
pub mod import;
pub mod storage;
pub mod text;

// JNI bridge for Android
#[cfg(target_os = "android")]
mod jni_bridge;

pub use config::LibraryConfig;
pub use error::{LibraryError, Result};
pub use storage::Database;

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Only the first successful call installs anything; later calls return
/// `Ok(false)`.
pub fn init_logging(filter: &str) -> Result<bool> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|e| LibraryError::ConfigurationError(format!("Invalid log filter: {}", e)))?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok())
}

/// Canonical sort key of an author, publisher, subject or contact name
#[uniffi::export]
pub fn normalize_name_for_sort(name: String) -> String {
    text::normalize_name(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_for_sort() {
        assert_eq!(normalize_name_for_sort("  Émile   ZOLA ".to_string()), "emile zola");
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging("shelves_core=loudest").is_err());
        init_logging("shelves_core=debug").unwrap();
        assert!(!init_logging("info").unwrap());
    }
}
