//! Plain-text normalization applied before chunking.
//!
//! Scraped pages carry a lot of noise: indentation, runs of blank lines,
//! navigation and footer lines repeated on every section. These helpers keep
//! line structure (so the chunker can still break on lines) while removing
//! that noise.

use std::collections::HashMap;

/// How many times an identical line may appear before further copies are
/// dropped.
pub const MAX_LINE_REPEATS: usize = 2;

/// Trim every line, collapse whitespace runs inside lines to one space and
/// reduce each run of blank lines to a single empty line, so paragraph
/// breaks survive as `\n\n`. Leading and trailing blank lines are dropped.
pub fn collapse_whitespace(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_pending = false;
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push(String::new());
            blank_pending = false;
        }
        out.push(line);
    }
    out.join("\n")
}

/// Keep at most `max_repeats` copies of each distinct non-empty line, in
/// order. Empty lines are paragraph breaks and are always kept.
pub fn drop_repeated_lines(text: &str, max_repeats: usize) -> String {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    text.lines()
        .filter(|line| {
            if line.is_empty() {
                return true;
            }
            let count = seen.entry(line).or_insert(0);
            *count += 1;
            *count <= max_repeats
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whitespace normalization followed by repeated-line removal. Blank lines
/// left adjacent by a dropped line are merged again.
pub fn clean_text(text: &str) -> String {
    let deduped = drop_repeated_lines(&collapse_whitespace(text), MAX_LINE_REPEATS);
    collapse_whitespace(&deduped)
}
