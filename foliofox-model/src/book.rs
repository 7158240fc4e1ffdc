use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::BookId;

/// One catalog book row together with its joined authors/genres/tags.
///
/// `authors` preserves credit order; `genres` and `tags` are sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub isbn10: Option<String>,
    pub isbn13: Option<String>,
    pub asin: Option<String>,
    pub publication_date: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<u32>,
    pub rating_avg: Option<f64>,
    pub rating_count: u32,
    pub series: Option<String>,
    pub series_position: Option<f64>,
    pub authors: Vec<String>,
    pub genres: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub file_count: u32,
    pub total_file_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// Check the row-level invariants that the catalog schema cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(ModelError::InvalidField(
                "title",
                "must be non-empty".to_string(),
            ));
        }
        if self.updated_at < self.created_at {
            return Err(ModelError::InvalidField(
                "updated_at",
                format!(
                    "precedes created_at ({} < {})",
                    self.updated_at, self.created_at
                ),
            ));
        }
        Ok(())
    }

    /// Primary author, when any author is credited.
    pub fn primary_author(&self) -> Option<&str> {
        self.authors.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Book {
        let now = Utc::now();
        Book {
            id: BookId(1),
            title: "The Left Hand of Darkness".to_string(),
            subtitle: None,
            description: None,
            isbn10: None,
            isbn13: Some("9780441478125".to_string()),
            asin: None,
            publication_date: Some("1969-03-01".to_string()),
            publisher: Some("Ace".to_string()),
            language: Some("en".to_string()),
            page_count: Some(304),
            rating_avg: Some(4.1),
            rating_count: 1200,
            series: Some("Hainish Cycle".to_string()),
            series_position: Some(4.0),
            authors: vec!["Ursula K. Le Guin".to_string()],
            genres: BTreeSet::from(["science fiction".to_string()]),
            tags: BTreeSet::new(),
            file_count: 1,
            total_file_size: 812_000,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_title() {
        let mut book = sample();
        book.title = "  ".to_string();
        assert!(book.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_time_travel() {
        let mut book = sample();
        book.updated_at = book.created_at - chrono::Duration::seconds(1);
        assert!(book.validate().is_err());
    }
}
