//! Core value types shared by every backend.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `strftime` layout of every stored date.
pub const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Width of a stored date.
pub const DATE_LEN: usize = 14;

/// A fixed-width, sortable wall-clock date (`YYYYMMDDHHMMSS`).
///
/// Lexicographic comparison of the inner string is chronological comparison,
/// which is what lets every backend order and window stories on raw text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Date(String);

impl Date {
    /// Current local time.
    pub fn now() -> Self {
        Self::from_datetime(&Local::now().naive_local())
    }

    /// The date used for stories that were saved without one.
    pub fn zero() -> Self {
        Date("0".repeat(DATE_LEN))
    }

    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Date(dt.format(DATE_FORMAT).to_string())
    }

    /// Parse a stored date. Only well-formed 14-digit dates are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != DATE_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(s, DATE_FORMAT).ok()?;
        Some(Date(s.to_string()))
    }

    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, DATE_FORMAT).ok()
    }

    /// Shift by a number of days (negative goes back).
    pub fn add_days(&self, days: i64) -> Self {
        match self.to_datetime() {
            Some(dt) => Self::from_datetime(&(dt + chrono::Duration::days(days))),
            None => self.clone(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Date({})", self.0)
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Date {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Topic, story and user identifiers: `[A-Za-z0-9_-]+`.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Tags travel inside index lines, so they cannot hold the line's
/// separators.
pub fn valid_tag(tag: &str) -> bool {
    !tag.is_empty() && !tag.contains([':', ',', '\n', '\r'])
}

/// Template and image names are file names: no separators, no dot entries.
pub fn valid_resource_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

/// Turn a title into an identifier-safe slug.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}
