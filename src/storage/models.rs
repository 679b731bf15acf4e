//! Database models for Shelves
//!
//! Row types read back from SQLite, plus the partial [`BookEntry`] record
//! write actions consume.
//!
//! # SQLite Adaptations
//! - Dates stored as TEXT (`YYYY-MM-DD`), timestamps as `CURRENT_TIMESTAMP` text
//! - Lookup entities share one shape: `id, name, name_normalized, ref_count`
//! - Author/subject/collection order on a book lives in the join row `position`

use crate::storage::invalidation::Table;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// ENUMS
// ============================================================================

/// Reference-counted lookup entity linked to books through a join table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupKind {
    Author,
    Publisher,
    Subject,
    Collection,
}

impl LookupKind {
    pub const ALL: [LookupKind; 4] = [
        LookupKind::Author,
        LookupKind::Publisher,
        LookupKind::Subject,
        LookupKind::Collection,
    ];

    pub fn table(&self) -> Table {
        match self {
            LookupKind::Author => Table::Authors,
            LookupKind::Publisher => Table::Publishers,
            LookupKind::Subject => Table::Subjects,
            LookupKind::Collection => Table::Collections,
        }
    }

    pub fn join_table(&self) -> Table {
        match self {
            LookupKind::Author => Table::BookAuthors,
            LookupKind::Publisher => Table::BookPublishers,
            LookupKind::Subject => Table::BookSubjects,
            LookupKind::Collection => Table::BookCollections,
        }
    }

    /// Join-table column referencing the lookup row
    pub fn foreign_key(&self) -> &'static str {
        match self {
            LookupKind::Author => "author_id",
            LookupKind::Publisher => "publisher_id",
            LookupKind::Subject => "subject_id",
            LookupKind::Collection => "collection_id",
        }
    }

    /// A book links to at most one row of this kind
    pub fn is_single_valued(&self) -> bool {
        matches!(self, LookupKind::Publisher)
    }

    /// Rows of this kind may be seeded as protected (kept at count 0)
    pub fn has_protected_rows(&self) -> bool {
        matches!(self, LookupKind::Collection)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LookupKind::Author => "author",
            LookupKind::Publisher => "publisher",
            LookupKind::Subject => "subject",
            LookupKind::Collection => "collection",
        }
    }
}

/// Sort order for book lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookOrder {
    #[default]
    Title,
    Author,
    RecentlyAdded,
}

impl BookOrder {
    pub(crate) fn order_clause(&self) -> &'static str {
        match self {
            BookOrder::Title => "b.title_normalized, b.id",
            BookOrder::Author => "b.creators_normalized, b.title_normalized, b.id",
            BookOrder::RecentlyAdded => "b.created_at DESC, b.id DESC",
        }
    }
}

/// Loan status of a single book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanState {
    NotLoaned,
    Loaned { loan_id: i64 },
}

// ============================================================================
// MAIN ENTITIES
// ============================================================================

/// Book row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    #[sqlx(default)]
    pub subtitle: Option<String>,
    #[sqlx(default)]
    pub description: Option<String>,
    #[sqlx(default)]
    pub dimensions: Option<String>,
    #[sqlx(default)]
    pub isbn10: Option<String>,
    #[sqlx(default)]
    pub isbn13: Option<String>,
    #[sqlx(default)]
    pub page_count: Option<i64>,
    /// Display copy of the linked publisher's name
    #[sqlx(default)]
    pub publisher: Option<String>,
    #[sqlx(default)]
    pub cover_url: Option<String>,
    #[sqlx(default)]
    pub rating: Option<f64>,
    #[sqlx(default)]
    pub release_date: Option<NaiveDate>,
    #[sqlx(default)]
    pub notes: Option<String>,
    /// Identifier of the book in the external metadata feed
    #[sqlx(default)]
    pub google_id: Option<String>,

    // Searchable text kept in sync with title and authors
    pub title_normalized: String,
    pub creators_normalized: String,

    /// Open loan, if the book is currently lent out
    #[sqlx(default)]
    pub active_loan_id: Option<i64>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Book {
    pub fn loan_state(&self) -> LoanState {
        match self.active_loan_id {
            Some(loan_id) => LoanState::Loaned { loan_id },
            None => LoanState::NotLoaned,
        }
    }

    pub fn title_with_subtitle(&self) -> String {
        match &self.subtitle {
            Some(sub) if !sub.is_empty() => format!("{}: {}", self.title, sub),
            _ => self.title.clone(),
        }
    }
}

/// Author, publisher or subject row
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct LookupEntry {
    pub id: i64,
    pub name: String,
    pub name_normalized: String,
    pub ref_count: i64,
}

/// Collection row
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub name_normalized: String,
    pub ref_count: i64,
    pub is_protected: bool,
}

/// Contact row (borrowers)
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub name_normalized: String,
    #[sqlx(default)]
    pub external_id: Option<String>,
    /// Number of loan rows (active or returned) naming this contact
    pub ref_count: i64,
}

/// Who a book is lent to, as picked from the device's contacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    pub name: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl ContactRef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            external_id: None,
        }
    }

    pub fn with_external_id<S: Into<String>>(mut self, external_id: S) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Loan row; history rows are never modified after `return_date` is set
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Loan {
    pub id: i64,
    pub book_id: i64,
    pub contact_id: i64,
    pub contact_name: String,
    #[sqlx(default)]
    pub contact_external_id: Option<String>,
    pub loan_date: NaiveDate,
    pub due_date: NaiveDate,
    #[sqlx(default)]
    pub return_date: Option<NaiveDate>,
}

impl Loan {
    pub fn is_active(&self) -> bool {
        self.return_date.is_none()
    }

    /// Active and due strictly before `now`
    pub fn is_overdue(&self, now: NaiveDate) -> bool {
        self.is_active() && self.due_date < now
    }
}

/// Loan joined with the loaned book's title
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct LoanSummary {
    pub id: i64,
    pub book_id: i64,
    pub book_title: String,
    pub contact_id: i64,
    pub contact_name: String,
    pub loan_date: NaiveDate,
    pub due_date: NaiveDate,
    #[sqlx(default)]
    pub return_date: Option<NaiveDate>,
}

/// One line of a book list
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct BookSummary {
    pub id: i64,
    pub title: String,
    #[sqlx(default)]
    pub subtitle: Option<String>,
    /// Author names in display order, comma separated
    #[sqlx(default)]
    pub authors: Option<String>,
    #[sqlx(default)]
    pub cover_url: Option<String>,
    pub is_loaned: bool,
}

/// A book with everything its detail screen shows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDetail {
    pub book: Book,
    pub authors: Vec<String>,
    pub subjects: Vec<String>,
    pub collections: Vec<String>,
    pub active_loan: Option<Loan>,
}

// ============================================================================
// WRITE-SIDE RECORDS
// ============================================================================

/// Scalar book columns settable through a [`BookEntry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookField {
    Title,
    Subtitle,
    Description,
    Dimensions,
    Isbn10,
    Isbn13,
    PageCount,
    CoverUrl,
    Rating,
    ReleaseDate,
    Notes,
    GoogleId,
}

impl BookField {
    pub fn column(&self) -> &'static str {
        match self {
            BookField::Title => "title",
            BookField::Subtitle => "subtitle",
            BookField::Description => "description",
            BookField::Dimensions => "dimensions",
            BookField::Isbn10 => "isbn10",
            BookField::Isbn13 => "isbn13",
            BookField::PageCount => "page_count",
            BookField::CoverUrl => "cover_url",
            BookField::Rating => "rating",
            BookField::ReleaseDate => "release_date",
            BookField::Notes => "notes",
            BookField::GoogleId => "google_id",
        }
    }
}

/// Value of one [`BookField`]; `None` clears the column
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Real(Option<f64>),
    Date(Option<NaiveDate>),
}

fn clean_text<S: Into<String>>(value: S) -> Option<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Partially-populated book used to build insert and update statements.
///
/// Only the fields that were set are written. Relation lists (`authors`,
/// `subjects`, `collections`, `publisher`) are replaced as a whole when set
/// and left untouched when not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookEntry {
    values: Vec<(BookField, FieldValue)>,
    authors: Option<Vec<String>>,
    subjects: Option<Vec<String>>,
    collections: Option<Vec<String>>,
    publisher: Option<Option<String>>,
}

impl BookEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: BookField, value: FieldValue) -> Self {
        self.values.retain(|(existing, _)| *existing != field);
        self.values.push((field, value));
        self
    }

    fn text<S: Into<String>>(self, field: BookField, value: S) -> Self {
        self.set(field, FieldValue::Text(clean_text(value)))
    }

    /// Clear a column (title cannot be cleared; actions reject it)
    pub fn clear(self, field: BookField) -> Self {
        let value = match field {
            BookField::PageCount => FieldValue::Integer(None),
            BookField::Rating => FieldValue::Real(None),
            BookField::ReleaseDate => FieldValue::Date(None),
            _ => FieldValue::Text(None),
        };
        self.set(field, value)
    }

    pub fn title<S: Into<String>>(self, title: S) -> Self {
        self.text(BookField::Title, title)
    }

    pub fn subtitle<S: Into<String>>(self, subtitle: S) -> Self {
        self.text(BookField::Subtitle, subtitle)
    }

    pub fn description<S: Into<String>>(self, description: S) -> Self {
        self.text(BookField::Description, description)
    }

    pub fn dimensions<S: Into<String>>(self, dimensions: S) -> Self {
        self.text(BookField::Dimensions, dimensions)
    }

    pub fn isbn10<S: Into<String>>(self, isbn: S) -> Self {
        self.text(BookField::Isbn10, isbn)
    }

    pub fn isbn13<S: Into<String>>(self, isbn: S) -> Self {
        self.text(BookField::Isbn13, isbn)
    }

    pub fn page_count(self, pages: i64) -> Self {
        self.set(BookField::PageCount, FieldValue::Integer(Some(pages)))
    }

    pub fn cover_url<S: Into<String>>(self, url: S) -> Self {
        self.text(BookField::CoverUrl, url)
    }

    pub fn rating(self, rating: f64) -> Self {
        self.set(BookField::Rating, FieldValue::Real(Some(rating)))
    }

    pub fn release_date(self, date: NaiveDate) -> Self {
        self.set(BookField::ReleaseDate, FieldValue::Date(Some(date)))
    }

    pub fn notes<S: Into<String>>(self, notes: S) -> Self {
        self.text(BookField::Notes, notes)
    }

    pub fn google_id<S: Into<String>>(self, id: S) -> Self {
        self.text(BookField::GoogleId, id)
    }

    pub fn authors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn subjects<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn publisher<S: Into<String>>(mut self, name: S) -> Self {
        self.publisher = Some(clean_text(name));
        self
    }

    pub fn no_publisher(mut self) -> Self {
        self.publisher = Some(None);
        self
    }

    pub fn values(&self) -> &[(BookField, FieldValue)] {
        &self.values
    }

    pub fn get(&self, field: BookField) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(existing, _)| *existing == field)
            .map(|(_, value)| value)
    }

    /// Title as set on this entry; `Some(None)` means it was cleared
    pub fn title_value(&self) -> Option<Option<&str>> {
        match self.get(BookField::Title) {
            Some(FieldValue::Text(title)) => Some(title.as_deref()),
            Some(_) => Some(None),
            None => None,
        }
    }

    pub fn google_id_value(&self) -> Option<&str> {
        match self.get(BookField::GoogleId) {
            Some(FieldValue::Text(Some(id))) => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn author_names(&self) -> Option<&[String]> {
        self.authors.as_deref()
    }

    pub fn subject_names(&self) -> Option<&[String]> {
        self.subjects.as_deref()
    }

    pub fn collection_names(&self) -> Option<&[String]> {
        self.collections.as_deref()
    }

    pub fn publisher_name(&self) -> Option<Option<&str>> {
        self.publisher.as_ref().map(|name| name.as_deref())
    }

    /// Names set for a lookup kind, if any
    pub fn lookup_names(&self, kind: LookupKind) -> Option<Vec<String>> {
        match kind {
            LookupKind::Author => self.authors.clone(),
            LookupKind::Subject => self.subjects.clone(),
            LookupKind::Collection => self.collections.clone(),
            LookupKind::Publisher => self
                .publisher
                .as_ref()
                .map(|name| name.iter().cloned().collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.authors.is_none()
            && self.subjects.is_none()
            && self.collections.is_none()
            && self.publisher.is_none()
    }
}

/// Fully scrubbed book as delivered by the metadata-search collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookRecord {
    pub title: String,
    pub subtitle: Option<String>,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub subjects: Vec<String>,
    pub description: Option<String>,
    pub dimensions: Option<String>,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub page_count: Option<i64>,
    pub cover_url: Option<String>,
    pub rating: Option<f64>,
    pub release_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub google_id: Option<String>,
}

impl From<BookRecord> for BookEntry {
    fn from(record: BookRecord) -> Self {
        let mut entry = BookEntry::new()
            .title(record.title)
            .authors(record.authors)
            .subjects(record.subjects);

        if let Some(publisher) = record.publisher {
            entry = entry.publisher(publisher);
        }
        let texts = [
            (BookField::Subtitle, record.subtitle),
            (BookField::Description, record.description),
            (BookField::Dimensions, record.dimensions),
            (BookField::Isbn10, record.isbn10),
            (BookField::Isbn13, record.isbn13),
            (BookField::CoverUrl, record.cover_url),
            (BookField::Notes, record.notes),
            (BookField::GoogleId, record.google_id),
        ];
        for (field, value) in texts {
            if let Some(value) = value {
                entry = entry.text(field, value);
            }
        }
        if let Some(pages) = record.page_count {
            entry = entry.page_count(pages);
        }
        if let Some(rating) = record.rating {
            entry = entry.rating(rating);
        }
        if let Some(date) = record.release_date {
            entry = entry.release_date(date);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_setters_replace() {
        let entry = BookEntry::new().title("  First ").title("Second").subtitle("   ");
        assert_eq!(entry.title_value(), Some(Some("Second")));
        assert_eq!(entry.get(BookField::Subtitle), Some(&FieldValue::Text(None)));
        assert_eq!(entry.values().len(), 2);
    }

    #[test]
    fn test_entry_relations() {
        let entry = BookEntry::new().authors(["Author One", "Author Two"]).no_publisher();
        assert_eq!(entry.author_names().map(|a| a.len()), Some(2));
        assert_eq!(entry.publisher_name(), Some(None));
        assert_eq!(entry.lookup_names(LookupKind::Publisher), Some(vec![]));
        assert!(entry.subject_names().is_none());
        assert!(!entry.is_empty());
        assert!(BookEntry::new().is_empty());
    }

    #[test]
    fn test_record_into_entry() {
        let record = BookRecord {
            title: "Dune".to_string(),
            authors: vec!["Frank Herbert".to_string()],
            publisher: Some("Chilton".to_string()),
            page_count: Some(412),
            google_id: Some("B1hSG45JCX4C".to_string()),
            ..BookRecord::default()
        };
        let entry: BookEntry = record.into();
        assert_eq!(entry.title_value(), Some(Some("Dune")));
        assert_eq!(entry.google_id_value(), Some("B1hSG45JCX4C"));
        assert_eq!(entry.get(BookField::PageCount), Some(&FieldValue::Integer(Some(412))));
        assert_eq!(entry.publisher_name(), Some(Some("Chilton")));
        assert!(entry.get(BookField::Subtitle).is_none());
    }

    #[test]
    fn test_loan_overdue() {
        let loan = Loan {
            id: 1,
            book_id: 1,
            contact_id: 1,
            contact_name: "Sam".to_string(),
            contact_external_id: None,
            loan_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            due_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            return_date: None,
        };
        assert!(!loan.is_overdue(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
        assert!(loan.is_overdue(NaiveDate::from_ymd_opt(2024, 2, 2).unwrap()));
    }
}
