//! Boundary-preferring text windowing.
//!
//! This is the one algorithm behind both input chunking ([`crate::chunk`],
//! token units, with overlap) and outbound segmentation
//! ([`crate::segment`], character units, no overlap). It is parameterized by
//! a [`Cost`] function and an ordered list of separators.
//!
//! # Algorithm
//!
//! 1. From the current start, find the furthest char boundary whose span
//!    still fits `limit` (galloping then binary search; the cost is
//!    monotonic in span length).
//! 2. Look back from that hard cutoff, at most `lookback × window length`
//!    bytes, for the first separator in priority order. The cut lands just
//!    after the separator. No separator → hard cut.
//! 3. The next window starts `overlap` units of trailing text before the cut,
//!    moved forward to the start of a word when the overlap begins mid-word.
//! 4. Every window ends strictly after the previous one, so the scan always
//!    terminates.
//!
//! Windows are returned as byte ranges; consecutive windows either touch or
//! overlap, so the sequence covers the input with no gaps.

use std::ops::Range;

use crate::tokens::TokenEstimator;

/// A monotonic size measure for text spans.
///
/// Implementations must never report a smaller cost for a span that
/// contains another span.
pub trait Cost {
    fn cost(&self, text: &str) -> usize;
}

impl Cost for TokenEstimator {
    fn cost(&self, text: &str) -> usize {
        self.estimate(text)
    }
}

/// Cost in Unicode scalar values.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCount;

impl Cost for CharCount {
    fn cost(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Separators for prose, from strongest to weakest break.
pub const PROSE_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "! ", "? ", "; ", ", ", " "];

/// Separators for outbound messages: paragraphs, then lines, then words.
pub const LINE_SEPARATORS: &[&str] = &["\n\n", "\n", " "];

/// Parameters for [`windows`].
#[derive(Debug, Clone, Copy)]
pub struct WindowOptions<'a> {
    /// Maximum cost of one window.
    pub limit: usize,
    /// Cost of trailing text repeated at the head of the next window.
    pub overlap: usize,
    /// Break candidates in priority order.
    pub separators: &'a [&'a str],
    /// Fraction of the window (0.0–1.0) searched backwards for a separator.
    pub lookback: f64,
}

/// One window over the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub range: Range<usize>,
    /// Bytes at the head of this window shared with the previous one.
    pub overlap: usize,
}

/// Split `text` into windows. Empty input yields a single empty window.
pub fn windows<C: Cost + ?Sized>(text: &str, cost: &C, opts: &WindowOptions<'_>) -> Vec<Window> {
    let len = text.len();
    if len == 0 {
        return vec![Window {
            range: 0..0,
            overlap: 0,
        }];
    }

    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(len))
        .collect();

    let mut out = Vec::new();
    let mut start = 0usize;
    let mut overlap = 0usize;
    let mut prev_cut = 0usize;

    loop {
        let hard_end = furthest_fit(text, &bounds, start, cost, opts.limit);

        if hard_end == len {
            out.push(Window {
                range: start..len,
                overlap,
            });
            break;
        }

        if hard_end <= prev_cut {
            // The overlap left no room for new text; restart at the cut.
            start = prev_cut;
            overlap = 0;
            continue;
        }

        let floor = start.max(prev_cut);
        let cut = boundary_cut(text, &bounds, start, floor, hard_end, opts);
        out.push(Window {
            range: start..cut,
            overlap,
        });
        prev_cut = cut;

        let next = if opts.overlap == 0 {
            cut
        } else {
            overlap_start(text, &bounds, start, cut, cost, opts.overlap)
        };
        overlap = cut - next;
        start = next;
    }

    out
}

/// Index of `pos` in `bounds`. `pos` is always a char boundary.
fn bound_index(bounds: &[usize], pos: usize) -> usize {
    bounds.partition_point(|&b| b < pos)
}

/// Furthest end such that `text[start..end]` fits `limit`. Always advances
/// by at least one char, even when that char alone is over budget.
///
/// Gallops forward from `start` before binary searching, so no probe spans
/// more than about twice the final window and the cost of one window does
/// not depend on how much text remains.
fn furthest_fit<C: Cost + ?Sized>(
    text: &str,
    bounds: &[usize],
    start: usize,
    cost: &C,
    limit: usize,
) -> usize {
    let candidates = &bounds[bound_index(bounds, start) + 1..];
    let fits = |end: usize| cost.cost(&text[start..end]) <= limit;

    // candidates[..lo] fit; candidates[hi - 1] does not, or hi is the end.
    let mut lo = 0;
    let mut step = 1;
    let hi = loop {
        let probe = lo + step;
        if probe >= candidates.len() {
            break candidates.len();
        }
        if fits(candidates[probe - 1]) {
            lo = probe;
            step *= 2;
        } else {
            break probe;
        }
    };

    let fitting = lo + candidates[lo..hi].partition_point(|&end| fits(end));
    if fitting == 0 {
        candidates[0]
    } else {
        candidates[fitting - 1]
    }
}

/// Move the hard cutoff back to the best separator in the look-back region.
/// The returned cut is always greater than `floor`.
fn boundary_cut(
    text: &str,
    bounds: &[usize],
    start: usize,
    floor: usize,
    hard_end: usize,
    opts: &WindowOptions<'_>,
) -> usize {
    let lookback = opts.lookback.clamp(0.0, 1.0);
    let reach = ((hard_end - start) as f64 * lookback).ceil() as usize;
    let from = hard_end.saturating_sub(reach).max(floor);
    let from = bounds[bound_index(bounds, from)];
    if from >= hard_end {
        return hard_end;
    }

    let region = &text[from..hard_end];
    for sep in opts.separators {
        if sep.is_empty() {
            continue;
        }
        if let Some(pos) = region.rfind(sep) {
            let cut = from + pos + sep.len();
            if cut > floor {
                return cut;
            }
        }
    }
    hard_end
}

/// Start of the trailing text of `text[start..cut]` whose cost fits
/// `overlap`, snapped forward to a word start. Always greater than `start`.
fn overlap_start<C: Cost + ?Sized>(
    text: &str,
    bounds: &[usize],
    start: usize,
    cut: usize,
    cost: &C,
    overlap: usize,
) -> usize {
    let candidates = &bounds[bound_index(bounds, start) + 1..=bound_index(bounds, cut)];
    let first_fit = candidates.partition_point(|&s| cost.cost(&text[s..cut]) > overlap);
    let s = candidates.get(first_fit).copied().unwrap_or(cut);

    let mid_word = s > 0
        && s < cut
        && !text[..s].ends_with(char::is_whitespace)
        && !text[s..].starts_with(char::is_whitespace);
    if mid_word {
        if let Some((pos, ws)) = text[s..cut].char_indices().find(|(_, c)| c.is_whitespace()) {
            let snapped = s + pos + ws.len_utf8();
            if snapped < cut {
                return snapped;
            }
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(limit: usize, overlap: usize) -> WindowOptions<'static> {
        WindowOptions {
            limit,
            overlap,
            separators: PROSE_SEPARATORS,
            lookback: 0.5,
        }
    }

    fn reassemble(text: &str, ws: &[Window]) -> String {
        ws.iter()
            .map(|w| &text[w.range.start + w.overlap..w.range.end])
            .collect()
    }

    #[test]
    fn empty_text_single_window() {
        let ws = windows("", &CharCount, &opts(10, 0));
        assert_eq!(ws, vec![Window { range: 0..0, overlap: 0 }]);
    }

    #[test]
    fn fits_in_one_window() {
        let ws = windows("hello world", &CharCount, &opts(100, 10));
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0].range, 0..11);
    }

    #[test]
    fn prefers_sentence_boundary() {
        let text = "One two. Three four five six";
        let ws = windows(text, &CharCount, &opts(12, 0));
        assert_eq!(&text[ws[0].range.clone()], "One two. ");
        assert_eq!(reassemble(text, &ws), text);
    }

    #[test]
    fn prefers_paragraph_over_space() {
        let text = "aaaa bbbb\n\ncc dd ee ff gg";
        let ws = windows(text, &CharCount, &opts(18, 0));
        assert_eq!(&text[ws[0].range.clone()], "aaaa bbbb\n\n");
    }

    #[test]
    fn hard_cut_without_separators() {
        let text = "x".repeat(25);
        let ws = windows(&text, &CharCount, &opts(10, 0));
        let lens: Vec<usize> = ws.iter().map(|w| w.range.len()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
    }

    #[test]
    fn lookback_is_bounded() {
        // The only space is far from the cutoff; with a small look-back the
        // window is hard-cut instead of shrinking to 2 bytes.
        let text = format!("a {}", "b".repeat(40));
        let o = WindowOptions {
            lookback: 0.1,
            ..opts(20, 0)
        };
        let ws = windows(&text, &CharCount, &o);
        assert_eq!(ws[0].range, 0..20);
    }

    #[test]
    fn overlap_repeats_tail() {
        let text = "w1 w2 w3 w4 w5 w6 w7 w8 w9 w10 w11 w12";
        let ws = windows(text, &CharCount, &opts(12, 5));
        assert!(ws.len() > 1);
        for pair in ws.windows(2) {
            let prev = &text[pair[0].range.clone()];
            let next = &text[pair[1].range.clone()];
            let shared = &next[..pair[1].overlap];
            assert!(prev.ends_with(shared));
            assert!(shared.chars().count() <= 5);
            assert_eq!(pair[1].range.start + pair[1].overlap, pair[0].range.end);
        }
        assert_eq!(reassemble(text, &ws), text);
    }

    #[test]
    fn overlap_starts_at_word() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let ws = windows(text, &CharCount, &opts(20, 8));
        for w in &ws[1..] {
            let head = &text[w.range.start..];
            let before = &text[..w.range.start];
            assert!(
                before.ends_with(' ') || head.starts_with(' '),
                "window starts mid-word: {:?}",
                head
            );
        }
    }

    #[test]
    fn multibyte_is_cut_on_char_boundaries() {
        let text = "가나다라마바사아자차카타파하".repeat(3);
        let ws = windows(&text, &CharCount, &opts(5, 1));
        for w in &ws {
            assert!(text.is_char_boundary(w.range.start));
            assert!(text.is_char_boundary(w.range.end));
            assert!(text[w.range.clone()].chars().count() <= 5);
        }
        assert_eq!(reassemble(&text, &ws), text);
    }

    #[test]
    fn work_per_window_does_not_grow_with_document() {
        use std::cell::Cell;

        struct Measured<'a>(&'a Cell<usize>);
        impl Cost for Measured<'_> {
            fn cost(&self, text: &str) -> usize {
                self.0.set(self.0.get() + text.len());
                text.chars().count()
            }
        }

        let measured_bytes = |len: usize| {
            let text = "steady prose, ".repeat(len / 14);
            let scanned = Cell::new(0);
            let ws = windows(&text, &Measured(&scanned), &opts(1000, 50));
            assert_eq!(reassemble(&text, &ws), text);
            scanned.get() / text.len()
        };

        let small = measured_bytes(200_000);
        let large = measured_bytes(2_000_000);
        assert!(small < 64, "scanned {}x the input", small);
        assert!(large <= small + 4, "scan grew from {}x to {}x", small, large);
    }

    #[test]
    fn single_oversized_unit_still_progresses() {
        struct Heavy;
        impl Cost for Heavy {
            fn cost(&self, text: &str) -> usize {
                text.chars().count() * 10
            }
        }
        let ws = windows("abc", &Heavy, &opts(5, 0));
        assert_eq!(ws.len(), 3);
    }
}
