//! Deterministic normalization of book fields for comparison.
//!
//! Every function here is idempotent: applying it twice yields the same
//! string as applying it once.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static PUNCTUATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("punctuation regex"));
static PUNCTUATION_KEEP_DOTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s.]").expect("author punctuation regex"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static EDITION_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\s*\d+(?:st|nd|rd|th)?\s*edition\s*$",
        r"(?i)\s*revised\s*edition\s*$",
        r"(?i)\s*updated\s*edition\s*$",
        r"(?i)\s*expanded\s*edition\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("edition regex"))
    .collect()
});
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}").expect("year regex"));

const LEADING_ARTICLES: &[&str] =
    &["the ", "a ", "an ", "le ", "la ", "les ", "un ", "une "];

/// Canonical ISBN form: alphanumerics only, uppercased (keeps the X check
/// digit of ISBN-10).
pub fn norm_isbn(isbn: &str) -> String {
    isbn.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Canonical title form for fuzzy comparison.
pub fn norm_title(title: &str) -> String {
    if title.is_empty() {
        return String::new();
    }
    let mut normalized: String = title.nfkd().collect::<String>().to_lowercase();

    // To a fixpoint, so normalizing an already-normalized title is a no-op.
    loop {
        let stripped = LEADING_ARTICLES
            .iter()
            .find_map(|article| normalized.strip_prefix(article));
        match stripped {
            Some(rest) => normalized = rest.trim_start().to_string(),
            None => break,
        }
    }

    normalized = PUNCTUATION.replace_all(&normalized, "").into_owned();
    normalized = WHITESPACE
        .replace_all(&normalized, " ")
        .trim()
        .to_string();

    loop {
        let before = normalized.len();
        for marker in EDITION_MARKERS.iter() {
            normalized = marker.replace(&normalized, "").trim().to_string();
        }
        if normalized.len() == before {
            break;
        }
    }
    normalized
}

/// Canonical author form: folded, lowercased, `"Last, First"` rewritten to
/// `"First Last"`, punctuation dropped except initials' periods.
pub fn norm_author(author: &str) -> String {
    if author.is_empty() {
        return String::new();
    }
    let mut normalized: String = author.nfkd().collect::<String>().to_lowercase();

    // Rewrite before stripping punctuation, or the comma is already gone.
    if let Some((last, first)) = normalized.split_once(',') {
        let (last, first) = (last.trim(), first.trim());
        normalized = format!("{first} {last}").trim().to_string();
    }

    normalized = PUNCTUATION_KEEP_DOTS
        .replace_all(&normalized, "")
        .into_owned();
    WHITESPACE
        .replace_all(&normalized, " ")
        .trim()
        .to_string()
}

/// Publication year, the only comparable part of free-form date strings.
pub fn norm_date(date: &str) -> Option<String> {
    YEAR.find(date).map(|m| m.as_str().to_string())
}
