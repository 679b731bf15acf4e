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


//! Text helpers shared by the storage layer
//!
//! Everything here is a pure function. Date formatting takes its pattern
//! per call; there is no process-wide formatter.
//!
//! # Normalization
//! Lookup rows (authors, publishers, subjects, collections, contacts) are
//! de-duplicated on a canonical key:
//! - Unicode decomposition with combining marks removed (`Émile` → `emile`)
//! - Lowercase
//! - Runs of whitespace collapsed to a single space, ends trimmed

use crate::error::{LibraryError, Result};
use chrono::NaiveDate;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

lazy_static::lazy_static! {
    static ref ISBN_SEPARATORS: Regex = Regex::new(r"[\s\-]").expect("static regex");
    static ref ISBN_10: Regex = Regex::new(r"^[0-9]{9}[0-9X]$").expect("static regex");
    static ref ISBN_13: Regex = Regex::new(r"^97[89][0-9]{10}$").expect("static regex");
}

/// Collapse whitespace runs and trim, keeping case and accents.
///
/// This is the form stored as a lookup row's display name.
pub fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical key used for matching and sorting lookup names.
pub fn normalize_name(name: &str) -> String {
    let folded: String = name
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    display_name(&folded)
}

/// Sort key for titles: normalized, with one leading English article dropped.
pub fn normalize_title(title: &str) -> String {
    let normalized = normalize_name(title);
    for article in ["the ", "a ", "an "] {
        if let Some(rest) = normalized.strip_prefix(article) {
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    normalized
}

/// Strip separators from an ISBN and check its shape.
///
/// Returns `None` when the input is neither a 10- nor a 13-digit ISBN.
/// The check digit is not verified; feeds regularly carry bad ones.
pub fn clean_isbn(isbn: &str) -> Option<String> {
    let cleaned = ISBN_SEPARATORS.replace_all(isbn.trim(), "").to_uppercase();
    if ISBN_10.is_match(&cleaned) || ISBN_13.is_match(&cleaned) {
        Some(cleaned)
    } else {
        None
    }
}

/// Format a date with a chrono `strftime` pattern.
pub fn format_date(date: NaiveDate, pattern: &str) -> String {
    date.format(pattern).to_string()
}

/// Parse a date with a chrono `strftime` pattern.
pub fn parse_date(text: &str, pattern: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(text.trim(), pattern)?)
}

/// Build a safe full-text expression from free text.
///
/// Every word becomes a quoted prefix term, so punctuation typed by the user
/// can never produce a syntax error. Returns `None` for blank input.
pub fn search_terms(text: &str) -> Option<String> {
    let terms: Vec<String> = normalize_name(text)
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("\"{}\"*", word))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Reject full-text expressions that cannot parse.
///
/// Catches the common mistakes (blank input, unbalanced quotes or
/// parentheses, a dangling boolean operator) before the query reaches
/// SQLite, so a bad expression never produces a half-built cursor.
pub fn validate_search_expression(expression: &str) -> Result<()> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(LibraryError::MalformedQuery("empty search expression".to_string()));
    }

    let mut depth: i32 = 0;
    let mut in_quotes = false;
    for c in trimmed.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth < 0 {
                    return Err(LibraryError::MalformedQuery(
                        "unexpected closing parenthesis".to_string(),
                    ));
                }
            }
            _ => {}
        }
    }
    if in_quotes {
        return Err(LibraryError::MalformedQuery("unterminated quoted phrase".to_string()));
    }
    if depth != 0 {
        return Err(LibraryError::MalformedQuery("unbalanced parentheses".to_string()));
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let is_operator = |w: &&str| matches!(*w, "AND" | "OR" | "NOT");
    if words.first().map_or(false, is_operator) || words.last().map_or(false, is_operator) {
        return Err(LibraryError::MalformedQuery("dangling boolean operator".to_string()));
    }

    Ok(())
}
