//! Core data models used throughout distill.
//!
//! These types represent the documents, chunks, summaries, and outbound
//! message segments that flow through the fetch → chunk → summarize →
//! deliver pipeline. All of them are immutable once constructed.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fetched document: raw response bytes plus the normalized text derived
/// from them.
#[derive(Debug, Clone)]
pub struct Document {
    /// Source URL. Doubles as the document identifier.
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    /// Response `Content-Type`, if the server sent one.
    pub content_type: Option<String>,
    pub raw: Vec<u8>,
    /// Tag-stripped, whitespace-normalized text.
    pub text: String,
    /// Key of the cache entry written for this fetch, if the write succeeded.
    pub cache_key: Option<String>,
}

impl Document {
    /// Build a document from text that did not come over the network
    /// (a local file, stdin, a test fixture).
    pub fn from_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            url: id.into(),
            fetched_at: Utc::now(),
            content_type: Some("text/plain".to_string()),
            raw: text.as_bytes().to_vec(),
            text,
            cache_key: None,
        }
    }
}

/// A bounded span of a document's text.
///
/// `span` is a byte range into the text the chunk was cut from. Adjacent
/// chunks share `overlap` bytes: the first `overlap` bytes of chunk *i+1*
/// are the last `overlap` bytes of chunk *i*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub document_id: String,
    pub span: Range<usize>,
    pub overlap: usize,
    pub text: String,
    pub tokens: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

impl Chunk {
    /// The part of this chunk that is not shared with the previous one.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }
}

/// Output of summarizing a single chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialSummary {
    pub chunk_index: usize,
    pub text: String,
    pub tokens: usize,
}

/// The fully reduced summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalSummary {
    pub text: String,
    pub tokens: usize,
    /// `true` when some chunks failed and were left out of the reduce input.
    pub partial: bool,
    pub failed_chunks: Vec<usize>,
    /// Number of grouping passes the reduce stage needed before the final
    /// combine. Zero when the map output fit the reduce budget directly.
    pub reduce_passes: usize,
}

/// An ordered slice of outbound text sized to a transport limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSegment {
    /// 1-based position in the sequence.
    pub seq: usize,
    pub total: usize,
    pub text: String,
}

impl MessageSegment {
    /// Longest `\n(i/n)` marker [`render`](Self::render) appends to any
    /// segment of a `total`-part sequence. Zero for a single segment.
    pub fn marker_len(total: usize) -> usize {
        if total > 1 {
            4 + 2 * total.to_string().len()
        } else {
            0
        }
    }

    /// Text as sent over the wire, with a `(i/n)` marker when the message
    /// was split.
    pub fn render(&self) -> String {
        if self.total > 1 {
            format!("{}\n({}/{})", self.text, self.seq, self.total)
        } else {
            self.text.clone()
        }
    }
}
