//! Heuristic token estimation.
//!
//! No tokenizer is loaded; the estimate only has to keep chunks inside a
//! model's context window. It averages two signals:
//!
//! - a character estimate, `weighted_chars / chars_per_token`, where Hangul,
//!   kana and CJK ideographs weigh 1.5 (they tokenize less efficiently than
//!   Latin text);
//! - a word estimate, `whitespace_words × tokens_per_word`.
//!
//! The mean is rounded up. Both signals only grow when text is inserted, so
//! the estimate is monotonic: extending a text never lowers its estimate.
//!
//! # Example
//!
//! ```rust
//! use distill_core::tokens::TokenEstimator;
//!
//! let est = TokenEstimator::default();
//! assert_eq!(est.estimate(""), 0);
//! assert!(est.validate("short text", 100));
//! ```

use serde::Serialize;

/// Default characters per token (mixed Korean/English text).
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;
/// Default tokens per whitespace-separated word.
pub const DEFAULT_TOKENS_PER_WORD: f64 = 1.3;

/// Character weights are counted in halves so the sum stays integral.
const LATIN_WEIGHT_HALVES: u64 = 2;
const CJK_WEIGHT_HALVES: u64 = 3;

/// Length-based token estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
    tokens_per_word: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            tokens_per_word: DEFAULT_TOKENS_PER_WORD,
        }
    }
}

impl TokenEstimator {
    /// Create an estimator with custom ratios. Non-positive or non-finite
    /// values fall back to the defaults.
    pub fn new(chars_per_token: f64, tokens_per_word: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        let tokens_per_word = if tokens_per_word.is_finite() && tokens_per_word >= 0.0 {
            tokens_per_word
        } else {
            DEFAULT_TOKENS_PER_WORD
        };
        Self {
            chars_per_token,
            tokens_per_word,
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    pub fn tokens_per_word(&self) -> f64 {
        self.tokens_per_word
    }

    /// Estimated token count of `text`.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let halves: u64 = text
            .chars()
            .map(|c| {
                if is_dense_script(c) {
                    CJK_WEIGHT_HALVES
                } else {
                    LATIN_WEIGHT_HALVES
                }
            })
            .sum();
        let words = text.split_whitespace().count() as f64;

        let char_estimate = halves as f64 / (2.0 * self.chars_per_token);
        let word_estimate = words * self.tokens_per_word;
        ((char_estimate + word_estimate) / 2.0).ceil() as usize
    }

    /// `true` when `text` is estimated to fit within `max_tokens`.
    pub fn validate(&self, text: &str, max_tokens: usize) -> bool {
        self.estimate(text) <= max_tokens
    }

    /// Detailed statistics for `text` against a `max_tokens` budget.
    pub fn stats(&self, text: &str, max_tokens: usize) -> TokenStats {
        let estimated_tokens = self.estimate(text);
        let recommendation = if estimated_tokens <= max_tokens {
            Recommendation::Direct
        } else if estimated_tokens < max_tokens.saturating_mul(2) {
            Recommendation::SimpleChunking
        } else if estimated_tokens < max_tokens.saturating_mul(5) {
            Recommendation::MapReduce
        } else {
            Recommendation::ChunkingAndMapReduce
        };
        TokenStats {
            char_count: text.chars().count(),
            word_count: text.split_whitespace().count(),
            estimated_tokens,
            max_tokens,
            over_limit: estimated_tokens > max_tokens,
            recommendation,
        }
    }
}

/// Hangul, kana and CJK ideographs.
fn is_dense_script(c: char) -> bool {
    matches!(c,
        '\u{1100}'..='\u{11FF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{3130}'..='\u{318F}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{AC00}'..='\u{D7A3}'
        | '\u{F900}'..='\u{FAFF}'
    )
}

/// How a text of a given size should be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Fits the budget; summarize directly.
    Direct,
    /// Under 2× the budget.
    SimpleChunking,
    /// Under 5× the budget.
    MapReduce,
    /// 5× the budget or more.
    ChunkingAndMapReduce,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Recommendation::Direct => "direct",
            Recommendation::SimpleChunking => "simple chunking",
            Recommendation::MapReduce => "map-reduce",
            Recommendation::ChunkingAndMapReduce => "chunking + map-reduce",
        };
        f.write_str(s)
    }
}

/// Token statistics for a text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub char_count: usize,
    pub word_count: usize,
    pub estimated_tokens: usize,
    pub max_tokens: usize,
    pub over_limit: bool,
    pub recommendation: Recommendation,
}
