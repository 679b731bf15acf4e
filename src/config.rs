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


//! Library configuration
//!
//! Settings arrive as JSON from the host application (the same way every
//! bridge call passes its parameters). Every field has a default, so `{}`
//! is a valid configuration describing an in-memory library.

use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for opening a library database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// SQLite file location; `None` opens an in-memory database
    pub database_path: Option<PathBuf>,
    /// Connection pool size (forced to 1 for in-memory databases)
    pub max_connections: u32,
    /// SQLite busy timeout in milliseconds
    pub busy_timeout_ms: u64,
    /// How long to wait for a pooled connection, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Interval of the background cursor-registry sweep; `None` disables it
    pub sweep_interval_secs: Option<u64>,
    /// Maximum number of metadata lookups run at once by an import batch
    pub import_concurrency: usize,
    /// `tracing` filter directive used by `init_logging`
    pub log_filter: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_connections: 5,
            busy_timeout_ms: 30_000,
            acquire_timeout_ms: 30_000,
            sweep_interval_secs: None,
            import_concurrency: 3,
            log_filter: "info".to_string(),
        }
    }
}

impl LibraryConfig {
    /// Configuration for a database file at `path`
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: LibraryConfig = serde_json::from_str(json)
            .map_err(|e| LibraryError::ConfigurationError(format!("Invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the database layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(LibraryError::ConfigurationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.import_concurrency == 0 {
            return Err(LibraryError::ConfigurationError(
                "import_concurrency must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(LibraryError::ConfigurationError(
                "sweep_interval_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = LibraryConfig::from_json("{}").unwrap();
        assert_eq!(config, LibraryConfig::default());
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_partial_json() {
        let config = LibraryConfig::from_json(
            r#"{"database_path": "/data/shelves/books.db", "sweep_interval_secs": 60}"#,
        )
        .unwrap();
        assert_eq!(config.database_path, Some(PathBuf::from("/data/shelves/books.db")));
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.max_connections, 5);
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            LibraryConfig::from_json(r#"{"max_connections": 0}"#),
            Err(LibraryError::ConfigurationError(_))
        ));
        assert!(LibraryConfig::from_json(r#"{"import_concurrency": 0}"#).is_err());
        assert!(LibraryConfig::from_json(r#"{"sweep_interval_secs": 0}"#).is_err());
        assert!(LibraryConfig::from_json("not json").is_err());
    }
}
