//! Canonical text handed to the embedding model.
//!
//! E5-family models expect an instruction prefix telling them whether a
//! string is content to index or a search query. The two kinds are separate
//! types here so an embedder can never receive one in place of the other.

use crate::{config::DEFAULT_MAX_CHARS, dataset::CatalogRecord};

pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";

/// Document text to be indexed, prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    text: String,
}

impl Passage {
    /// Full model input, starting with [`PASSAGE_PREFIX`].
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The templated content without the instruction prefix.
    pub fn body(&self) -> &str {
        &self.text[PASSAGE_PREFIX.len()..]
    }
}

/// Search text, prefix included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
}

impl Query {
    /// Wrap a user query. Returns `None` for empty or whitespace-only input.
    ///
    /// # Examples
    ///
    /// ```
    /// use booksearch::normalizer::Query;
    ///
    /// assert_eq!(Query::new("  dogs ").unwrap().as_str(), "query: dogs");
    /// assert!(Query::new("   ").is_none());
    /// ```
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            text: format!("{QUERY_PREFIX}{trimmed}"),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The user's text without the instruction prefix.
    pub fn body(&self) -> &str {
        &self.text[QUERY_PREFIX.len()..]
    }
}

/// Turns catalog records into passages.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_chars: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}

impl Normalizer {
    /// `max_chars` bounds the description, counted in characters.
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Render a record as `제목: … / 저자: … / 출판사: …\n설명: …`, omitting
    /// the segments whose field is absent.
    pub fn passage(&self, record: &CatalogRecord) -> Passage {
        let mut text = format!("{PASSAGE_PREFIX}제목: {}", record.title);
        if let Some(author) = &record.author {
            text.push_str(" / 저자: ");
            text.push_str(author);
        }
        if let Some(publisher) = &record.publisher {
            text.push_str(" / 출판사: ");
            text.push_str(publisher);
        }
        if let Some(description) = &record.description {
            let clipped = clip_chars(description, self.max_chars);
            if !clipped.is_empty() {
                text.push_str("\n설명: ");
                text.push_str(clipped);
            }
        }
        Passage { text }
    }
}

/// The longest prefix of `s` holding at most `max_chars` characters.
pub fn clip_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &s[..byte_idx],
        None => s,
    }
}
