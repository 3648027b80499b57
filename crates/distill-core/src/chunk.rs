//! Token-bounded, overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s whose estimated token count stays
//! within `max_tokens`. Cuts prefer paragraph and sentence boundaries near
//! the budget edge (see [`crate::window`]); each chunk after the first
//! repeats roughly `overlap_tokens` of the previous chunk's tail so the
//! summarizer keeps cross-chunk context.
//!
//! Each chunk carries its byte span in the source text and a SHA-256 hash of
//! its text for cache correlation.
//!
//! # Example
//!
//! ```rust
//! use distill_core::chunk::TextSplitter;
//!
//! let splitter = TextSplitter::new(700, 50).unwrap();
//! let chunks = splitter.split("doc-123", "Hello world.\n\nSecond paragraph.");
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::Chunk;
use crate::tokens::TokenEstimator;
use crate::window::{windows, WindowOptions, PROSE_SEPARATORS};

/// Fraction of a chunk searched backwards for a break point.
pub const DEFAULT_LOOKBACK: f64 = 0.2;

/// Invalid splitter parameters. Detected at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkConfigError {
    #[error("max_tokens must be > 0")]
    ZeroBudget,
    #[error("overlap_tokens ({overlap}) must be smaller than max_tokens ({max_tokens})")]
    OverlapTooLarge { overlap: usize, max_tokens: usize },
}

/// Splits text into overlapping, token-bounded chunks.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    max_tokens: usize,
    overlap_tokens: usize,
    estimator: TokenEstimator,
    lookback: f64,
}

impl TextSplitter {
    /// Create a splitter with the default [`TokenEstimator`].
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self, ChunkConfigError> {
        Self::with_estimator(max_tokens, overlap_tokens, TokenEstimator::default())
    }

    pub fn with_estimator(
        max_tokens: usize,
        overlap_tokens: usize,
        estimator: TokenEstimator,
    ) -> Result<Self, ChunkConfigError> {
        if max_tokens == 0 {
            return Err(ChunkConfigError::ZeroBudget);
        }
        if overlap_tokens >= max_tokens {
            return Err(ChunkConfigError::OverlapTooLarge {
                overlap: overlap_tokens,
                max_tokens,
            });
        }
        Ok(Self {
            max_tokens,
            overlap_tokens,
            estimator,
            lookback: DEFAULT_LOOKBACK,
        })
    }

    /// Override how far back (as a fraction of the chunk) a break point is
    /// searched for.
    pub fn with_lookback(mut self, lookback: f64) -> Self {
        self.lookback = lookback.clamp(0.0, 1.0);
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Split `text` into chunks with contiguous indices starting at 0.
    ///
    /// # Guarantees
    ///
    /// - At least one chunk is returned (an empty chunk for empty text).
    /// - Text within budget yields exactly one chunk.
    /// - Dropping each chunk's `overlap` prefix and concatenating the rest
    ///   reproduces `text` exactly.
    /// - Every chunk's estimate is within `max_tokens`, except a single
    ///   character that alone exceeds it.
    pub fn split(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let opts = WindowOptions {
            limit: self.max_tokens,
            overlap: self.overlap_tokens,
            separators: PROSE_SEPARATORS,
            lookback: self.lookback,
        };
        windows(text, &self.estimator, &opts)
            .into_iter()
            .enumerate()
            .map(|(index, w)| {
                let piece = &text[w.range.clone()];
                Chunk {
                    index,
                    document_id: document_id.to_string(),
                    span: w.range,
                    overlap: w.overlap,
                    text: piece.to_string(),
                    tokens: self.estimator.estimate(piece),
                    hash: hash_text(piece),
                }
            })
            .collect()
    }
}

/// SHA-256 of `text`, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.fresh_text()).collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = TextSplitter::new(700, 50).unwrap().split("doc1", "Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].overlap, 0);
    }

    #[test]
    fn test_empty_text() {
        let chunks = TextSplitter::new(700, 0).unwrap().split("doc1", "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn test_rejects_zero_budget() {
        assert_eq!(
            TextSplitter::new(0, 0).unwrap_err(),
            ChunkConfigError::ZeroBudget
        );
    }

    #[test]
    fn test_rejects_overlap_not_below_budget() {
        assert!(matches!(
            TextSplitter::new(100, 100),
            Err(ChunkConfigError::OverlapTooLarge { .. })
        ));
        assert!(TextSplitter::new(100, 99).is_ok());
    }

    #[test]
    fn test_multiple_paragraphs_exceed_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = TextSplitter::new(10, 2).unwrap().split("doc1", text);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.tokens <= 10, "chunk {} has {} tokens", i, c.tokens);
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_breaks_after_paragraph() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = TextSplitter::new(10, 0)
            .unwrap()
            .with_lookback(1.0)
            .split("doc1", text);
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_spans_match_text() {
        let text = (0..50)
            .map(|i| format!("Sentence number {}.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = TextSplitter::new(20, 5).unwrap().split("doc1", &text);
        for c in &chunks {
            assert_eq!(&text[c.span.clone()], c.text);
            assert_eq!(c.hash, hash_text(&c.text));
            assert_eq!(c.document_id, "doc1");
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].span.start + pair[1].overlap, pair[0].span.end);
        }
    }

    #[test]
    fn test_no_boundaries_hard_cut() {
        let text = "x".repeat(400);
        let chunks = TextSplitter::new(20, 0).unwrap().split("doc1", &text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.tokens <= 20);
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = TextSplitter::new(3, 1).unwrap().split("doc1", text);
        assert!(!chunks.is_empty());
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let splitter = TextSplitter::new(3, 1).unwrap();
        let c1 = splitter.split("doc1", text);
        let c2 = splitter.split("doc1", text);
        assert_eq!(c1, c2);
    }
}
