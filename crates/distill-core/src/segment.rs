//! Outbound message segmentation.
//!
//! Chat transports cap message length (Discord: 2000 characters). The
//! segmenter cuts a summary into disjoint, ordered [`MessageSegment`]s of at
//! most `max_chars` characters, preferring paragraph breaks, then line
//! breaks, then spaces. A run with no break point (a long URL) is hard-cut.
//!
//! Concatenating the segments' `text` reproduces the input exactly. The
//! `(i/n)` marker added by [`MessageSegment::render`] is not part of the
//! text, but room for it is reserved: every rendered segment fits
//! `max_chars` as long as `max_chars` leaves space for the marker and at
//! least one character.

use crate::models::MessageSegment;
use crate::window::{windows, CharCount, Window, WindowOptions, LINE_SEPARATORS};

/// Fraction of a segment searched backwards for a break point.
pub const SEGMENT_LOOKBACK: f64 = 0.5;

/// Split `text` into segments whose rendered form is at most `max_chars`
/// characters.
///
/// Empty text yields no segments. A `max_chars` of zero is treated as one.
pub fn segment(text: &str, max_chars: usize) -> Vec<MessageSegment> {
    if text.is_empty() {
        return Vec::new();
    }
    let limit = max_chars.max(1);
    let mut ranges = split_chars(text, limit);

    // A marker with more digits can push the count up again, so repeat
    // until the reserved room covers the marker of the final count.
    let mut reserved = 0;
    loop {
        let needed = MessageSegment::marker_len(ranges.len());
        if needed <= reserved {
            break;
        }
        reserved = needed;
        ranges = split_chars(text, limit.saturating_sub(reserved).max(1));
    }

    let total = ranges.len();
    ranges
        .into_iter()
        .enumerate()
        .map(|(i, w)| MessageSegment {
            seq: i + 1,
            total,
            text: text[w.range].to_string(),
        })
        .collect()
}

fn split_chars(text: &str, limit: usize) -> Vec<Window> {
    let opts = WindowOptions {
        limit,
        overlap: 0,
        separators: LINE_SEPARATORS,
        lookback: SEGMENT_LOOKBACK,
    };
    windows(text, &CharCount, &opts)
}
