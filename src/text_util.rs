use crate::normalizer::clip_chars;

/// Maximum number of characters in a description snippet before truncation.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 140;

/// Collapse runs of whitespace (newlines included) into single spaces.
pub fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Shorten `text` to at most `max_chars` characters on one line, marking
/// the cut with `...`.
///
/// # Examples
///
/// ```
/// use booksearch::text_util::snippet;
///
/// assert_eq!(snippet("short", 10), "short");
/// assert_eq!(snippet("a longer\ntext", 6), "a long...");
/// ```
pub fn snippet(text: &str, max_chars: usize) -> String {
    let flat = single_line(text);
    let clipped = clip_chars(&flat, max_chars);
    if clipped.len() < flat.len() {
        format!("{clipped}...")
    } else {
        flat
    }
}
