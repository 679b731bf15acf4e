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


//! JNI bridge for Android - exposes the catalogue core to the Kotlin app
//!
//! # Architecture
//! Kotlin (`ShelvesNative`) → JNI → Rust
//!
//! # Design Patterns
//! 1. **JSON Communication**: every call takes one JSON parameter object and returns JSON
//! 2. **Error Handling**: errors are returned as JSON error responses, never thrown
//! 3. **Async Runtime**: a process-wide Tokio runtime drives the async core
//! 4. **No Panics**: panics are caught before they cross the FFI boundary
//! 5. **Shared handles**: one `Database` per file, so every caller sees the
//!    same live cursor registry
//!
//! # Response Format
//! ```json
//! { "success": true, "data": { ... } }
//! ```
//! Or on error:
//! ```json
//! { "success": false, "error": "Error message" }
//! ```

use crate::config::LibraryConfig;
use crate::error::{LibraryError, Result};
use crate::storage::models::{BookOrder, BookRecord, ContactRef};
use crate::storage::{queries, Database};
use chrono::NaiveDate;
use jni::objects::{JClass, JString};
use jni::sys::jstring;
use jni::JNIEnv;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref RUNTIME: std::io::Result<tokio::runtime::Runtime> = tokio::runtime::Runtime::new();

    // Open libraries (database path -> handle)
    static ref DATABASES: Mutex<HashMap<String, Database>> = Mutex::new(HashMap::new());
}

const IN_MEMORY_KEY: &str = ":memory:";

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn runtime() -> Result<&'static tokio::runtime::Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| LibraryError::internal(format!("Failed to create Tokio runtime: {}", e)))
}

fn cached_database(key: &str) -> Result<Option<Database>> {
    let databases = DATABASES
        .lock()
        .map_err(|_| LibraryError::internal("database cache poisoned"))?;
    Ok(databases.get(key).cloned())
}

/// Cache `db` under `key`, or return the handle another caller cached first
fn cache_database(key: &str, db: Database) -> Result<Database> {
    let mut databases = DATABASES
        .lock()
        .map_err(|_| LibraryError::internal("database cache poisoned"))?;
    Ok(databases.entry(key.to_string()).or_insert(db).clone())
}

async fn open_library(config: &LibraryConfig) -> Result<Database> {
    let key = config
        .database_path
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| IN_MEMORY_KEY.to_string());
    if let Some(db) = cached_database(&key)? {
        return Ok(db);
    }
    let db = Database::open(config).await?;
    cache_database(&key, db)
}

/// Handle for `database_path`, opening it with default settings on first use
async fn library(database_path: &str) -> Result<Database> {
    if let Some(db) = cached_database(database_path)? {
        return Ok(db);
    }
    open_library(&LibraryConfig::with_path(database_path)).await
}

/// Convert JString to Rust String
fn jstring_to_string(env: &mut JNIEnv, jstr: JString) -> Result<String> {
    env.get_string(&jstr)
        .map(|s| s.into())
        .map_err(|e| LibraryError::JniError(format!("JNI string conversion failed: {}", e)))
}

fn parse_params<'a, P: Deserialize<'a>>(params: &'a str) -> Result<P> {
    serde_json::from_str(params)
        .map_err(|e| LibraryError::InvalidInput(format!("Invalid JSON: {}", e)))
}

/// Create success response JSON
fn success_response<T: serde::Serialize>(data: T) -> String {
    json!({
        "success": true,
        "data": data
    })
    .to_string()
}

/// Create error response JSON
fn error_response(error: &str) -> String {
    json!({
        "success": false,
        "error": error
    })
    .to_string()
}

/// Wrap a function call with panic catching
fn catch_panic<F>(f: F) -> String
where
    F: FnOnce() -> String,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else {
                "Unknown panic occurred".to_string()
            };
            error_response(&format!("Rust panic: {}", panic_msg))
        }
    }
}

/// Run `handler` on the JSON parameter string and turn its outcome into a
/// Java string. A null pointer is returned only if the JVM cannot allocate
/// the response.
fn respond<F>(env: &mut JNIEnv, params_json: JString, handler: F) -> jstring
where
    F: FnOnce(String) -> Result<String>,
{
    let params = jstring_to_string(env, params_json);
    let response = catch_panic(move || match params.and_then(handler) {
        Ok(result) => result,
        Err(e) => error_response(&e.user_message()),
    });

    match env.new_string(response) {
        Ok(output) => output.into_raw(),
        Err(e) => {
            tracing::error!(error = %e, "failed to create Java string");
            std::ptr::null_mut()
        }
    }
}

#[derive(Deserialize)]
struct LibraryParams {
    database_path: String,
}

#[derive(Deserialize)]
struct BookParams {
    database_path: String,
    book_id: i64,
}

// ============================================================================
// LIBRARY
// ============================================================================

/// Open (or reuse) a library and apply pending migrations
///
/// # Arguments (JSON string)
/// A `LibraryConfig`; `{}` opens an in-memory library.
///
/// # Returns (JSON)
/// ```json
/// { "success": true, "data": { "book_count": 12 } }
/// ```
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeOpenLibrary(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    respond(&mut env, params_json, |params| {
        let config = LibraryConfig::from_json(&params)?;
        let _ = crate::init_logging(&config.log_filter);
        runtime()?.block_on(async {
            let db = open_library(&config).await?;
            let book_count = queries::count_books(db.pool()).await?;
            Ok(success_response(json!({ "book_count": book_count })))
        })
    })
}

/// Integrity check plus reference-count audit
///
/// # Returns (JSON)
/// ```json
/// { "success": true, "data": { "integrity_ok": true, "problems": [] } }
/// ```
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeVerifyLibrary(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    respond(&mut env, params_json, |params| {
        let params: LibraryParams = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let integrity_ok = db.check_integrity().await?;
            let problems = db.verify_reference_counts().await?;
            Ok(success_response(json!({
                "integrity_ok": integrity_ok,
                "problems": problems,
            })))
        })
    })
}

// ============================================================================
// BOOKS
// ============================================================================

/// Add a book
///
/// # Arguments (JSON string)
/// ```json
/// {
///   "database_path": "/data/.../library.db",
///   "book": { "title": "Dune", "authors": ["Frank Herbert"], "google_id": "..." }
/// }
/// ```
///
/// # Returns (JSON)
/// ```json
/// { "success": true, "data": { "id": 1, "created": true } }
/// ```
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeAddBook(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        book: BookRecord,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let added = db.add_book(&params.book.into()).await?;
            Ok(success_response(added))
        })
    })
}

/// Overwrite a book's fields and relation lists with `book`
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeUpdateBook(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        book_id: i64,
        book: BookRecord,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let changed = db.update_book(params.book_id, &params.book.into()).await?;
            Ok(success_response(json!({ "changed": changed })))
        })
    })
}

#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeDeleteBook(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    respond(&mut env, params_json, |params| {
        let params: BookParams = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            db.delete_book(params.book_id).await?;
            Ok(success_response(json!({ "deleted": params.book_id })))
        })
    })
}

/// List book summaries
///
/// # Arguments (JSON string)
/// ```json
/// { "database_path": "...", "order": "title" | "author" | "recently_added" }
/// ```
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeGetBooks(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        #[serde(default)]
        order: BookOrder,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let books = queries::list_books(db.pool(), params.order).await?;
            let total = books.len();
            Ok(success_response(json!({ "books": books, "total": total })))
        })
    })
}

/// Book detail; `data` is null when the book does not exist
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeGetBook(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    respond(&mut env, params_json, |params| {
        let params: BookParams = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let detail = queries::get_book_detail(db.pool(), params.book_id).await?;
            Ok(success_response(detail))
        })
    })
}

/// Search by title and author
///
/// # Arguments (JSON string)
/// ```json
/// { "database_path": "...", "query": "tolkien hobbit", "expression": false }
/// ```
/// With `expression: true` the query is a full-text expression
/// (`dune OR "left hand"`); malformed expressions return an error.
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeSearchBooks(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        query: String,
        #[serde(default)]
        expression: bool,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let books = if params.expression {
                queries::search_books_expression(db.pool(), &params.query).await?
            } else {
                queries::search_books(db.pool(), &params.query).await?
            };
            Ok(success_response(json!({ "books": books, "query": params.query })))
        })
    })
}

// ============================================================================
// LOANS
// ============================================================================

/// Lend a book
///
/// # Arguments (JSON string)
/// ```json
/// {
///   "database_path": "...",
///   "book_id": 1,
///   "contact_name": "Sam",
///   "contact_external_id": "content://contacts/42",
///   "loan_date": "2025-03-01",
///   "due_date": "2025-03-15"
/// }
/// ```
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeStartLoan(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        book_id: i64,
        contact_name: String,
        contact_external_id: Option<String>,
        loan_date: NaiveDate,
        due_date: NaiveDate,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let mut contact = ContactRef::new(params.contact_name);
            if let Some(external_id) = params.contact_external_id {
                contact = contact.with_external_id(external_id);
            }
            let db = library(&params.database_path).await?;
            let loan = db
                .start_loan(params.book_id, &contact, params.loan_date, params.due_date)
                .await?;
            Ok(success_response(loan))
        })
    })
}

#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeReturnBook(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        book_id: i64,
        loan_id: Option<i64>,
        return_date: NaiveDate,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let loan = db
                .return_book(params.book_id, params.loan_id, params.return_date)
                .await?;
            Ok(success_response(loan))
        })
    })
}

/// Open loans due before `now`
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeGetExpiredLoans(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        now: NaiveDate,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let loans = queries::expired_loans(db.pool(), params.now).await?;
            Ok(success_response(json!({ "loans": loans })))
        })
    })
}

// ============================================================================
// COLLECTIONS
// ============================================================================

#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeGetCollections(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    respond(&mut env, params_json, |params| {
        let params: LibraryParams = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let collections = queries::list_collections(db.pool()).await?;
            Ok(success_response(json!({ "collections": collections })))
        })
    })
}

/// Create a collection, or return the id of the one with the same name
#[no_mangle]
pub extern "C" fn Java_app_shelves_core_ShelvesNative_nativeAddCollection(
    mut env: JNIEnv,
    _class: JClass,
    params_json: JString,
) -> jstring {
    #[derive(Deserialize)]
    struct Params {
        database_path: String,
        name: String,
    }

    respond(&mut env, params_json, |params| {
        let params: Params = parse_params(&params)?;
        runtime()?.block_on(async {
            let db = library(&params.database_path).await?;
            let id = db.add_collection(&params.name).await?;
            Ok(success_response(json!({ "id": id })))
        })
    })
}
