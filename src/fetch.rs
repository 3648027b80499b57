//! Resilient document fetching.
//!
//! [`ResilientFetcher`] downloads one URL with a bounded retry budget,
//! turns the body into plain text, and leaves a copy of both in the
//! [`DocumentCache`].
//!
//! # Retry Strategy
//!
//! - Connection failures and timeouts → retry
//! - HTTP 429 and 5xx → retry
//! - Any other non-2xx status → fail immediately
//! - Empty text after normalization → fail immediately
//!
//! Delays follow the configured [`RetryPolicy`]: `base * 2^(n-1)`, capped,
//! with ± jitter. A URL that never succeeds leaves nothing in the cache.

use std::time::Duration;

use chrono::Utc;
use scraper::{Html, Node};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use distill_core::models::Document;
use distill_core::normalize::collapse_whitespace;
use distill_core::retry::RetryPolicy;

use crate::cache::DocumentCache;
use crate::config::FetchConfig;
use crate::retry::{Retrier, RetryError};

/// Elements whose text never reaches the document.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript"];

/// Elements whose content is a paragraph of its own.
const PARAGRAPH_ELEMENTS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre", "ul", "ol", "dl", "table",
    "section", "article", "header", "footer", "main", "nav", "aside", "figure", "form", "hr",
];

/// Elements that start a new line.
const BLOCK_ELEMENTS: &[&str] = &[
    "div", "li", "dt", "dd", "tr", "td", "th", "caption", "figcaption", "address", "title",
    "body", "head",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        url: String,
        reason: String,
        attempts: u32,
        total_delay: Duration,
    },
    #[error("{url} timed out after {attempts} attempt(s)")]
    Timeout {
        url: String,
        attempts: u32,
        total_delay: Duration,
    },
    #[error("{url} returned HTTP {status} after {attempts} attempt(s)")]
    HttpStatus {
        url: String,
        status: u16,
        attempts: u32,
        total_delay: Duration,
    },
    #[error("no text could be extracted from {url}: {reason}")]
    ParseFailure { url: String, reason: String },
    #[error("fetch of {url} cancelled after {attempts} attempt(s)")]
    Cancelled { url: String, attempts: u32 },
}

impl FetchError {
    /// Attempts made before giving up. A parse failure happens after one
    /// successful download.
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Unreachable { attempts, .. }
            | FetchError::Timeout { attempts, .. }
            | FetchError::HttpStatus { attempts, .. }
            | FetchError::Cancelled { attempts, .. } => *attempts,
            FetchError::ParseFailure { .. } => 1,
        }
    }

    /// Time spent in backoff sleeps.
    pub fn total_delay(&self) -> Duration {
        match self {
            FetchError::Unreachable { total_delay, .. }
            | FetchError::Timeout { total_delay, .. }
            | FetchError::HttpStatus { total_delay, .. } => *total_delay,
            FetchError::ParseFailure { .. } | FetchError::Cancelled { .. } => Duration::ZERO,
        }
    }
}

/// Failure of a single HTTP attempt.
#[derive(Debug)]
enum AttemptError {
    Connect(String),
    Timeout,
    Status(u16),
    /// The request could not even be built (bad URL, bad header).
    Request(String),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Connect(_) | AttemptError::Timeout => true,
            AttemptError::Status(code) => *code == 429 || (500..600).contains(code),
            AttemptError::Request(_) => false,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Connect(e) => write!(f, "connection error: {}", e),
            AttemptError::Timeout => write!(f, "timed out"),
            AttemptError::Status(code) => write!(f, "HTTP {}", code),
            AttemptError::Request(e) => write!(f, "invalid request: {}", e),
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AttemptError::Timeout
        } else if e.is_builder() {
            AttemptError::Request(e.to_string())
        } else {
            AttemptError::Connect(e.to_string())
        }
    }
}

struct RawResponse {
    content_type: Option<String>,
    body: Vec<u8>,
}

pub struct ResilientFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    cache: DocumentCache,
}

impl ResilientFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            policy: config.retry_policy(),
            cache: DocumentCache::new(config.cache_dir.clone()),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `url`, normalize it to text, and cache the result.
    ///
    /// A cache write failure is logged and does not fail the fetch; the
    /// returned document then has no `cache_key`.
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Document, FetchError> {
        let retrier = Retrier::new(self.policy, cancel.clone());

        let response = retrier
            .run("fetch", AttemptError::is_transient, |attempt| {
                tracing::debug!(url, attempt, "fetching");
                self.get_once(url)
            })
            .await
            .map_err(|e| to_fetch_error(url, e))?;

        let text = normalize_body(&response.body, response.content_type.as_deref());
        if text.is_empty() {
            return Err(FetchError::ParseFailure {
                url: url.to_string(),
                reason: "document contains no text".to_string(),
            });
        }

        let fetched_at = Utc::now();
        let cache_key = match self
            .cache
            .store(url, fetched_at, &response.body, &text)
            .await
        {
            Ok(entry) => Some(entry.key),
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to write cache entry");
                None
            }
        };

        tracing::info!(
            url,
            bytes = response.body.len(),
            chars = text.chars().count(),
            "fetched document"
        );

        Ok(Document {
            url: url.to_string(),
            fetched_at,
            content_type: response.content_type,
            raw: response.body,
            text,
            cache_key,
        })
    }

    async fn get_once(&self, url: &str) -> Result<RawResponse, AttemptError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.bytes().await?.to_vec();
        Ok(RawResponse { content_type, body })
    }
}

fn to_fetch_error(url: &str, err: RetryError<AttemptError>) -> FetchError {
    let attempts = err.attempts().len() as u32;
    let total_delay = err.total_delay();
    let url = url.to_string();
    match err.into_error() {
        None => FetchError::Cancelled { url, attempts },
        Some(AttemptError::Timeout) => FetchError::Timeout {
            url,
            attempts,
            total_delay,
        },
        Some(AttemptError::Status(status)) => FetchError::HttpStatus {
            url,
            status,
            attempts,
            total_delay,
        },
        Some(AttemptError::Connect(reason)) | Some(AttemptError::Request(reason)) => {
            FetchError::Unreachable {
                url,
                reason,
                attempts,
                total_delay,
            }
        }
    }
}

/// Turn a response body into normalized plain text.
///
/// HTML is parsed and stripped of markup; anything else is treated as text.
pub fn normalize_body(body: &[u8], content_type: Option<&str>) -> String {
    let raw = String::from_utf8_lossy(body);
    if looks_like_html(&raw, content_type) {
        html_to_text(&raw)
    } else {
        collapse_whitespace(&raw)
    }
}

fn looks_like_html(body: &str, content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.to_ascii_lowercase().contains("html"),
        None => body.trim_start().starts_with('<'),
    }
}

/// Visible text of an HTML document. Inline content flows into one line,
/// block elements start a new line and paragraph-level elements are
/// separated by a blank line. Script, style and noscript content is dropped.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    let mut stack = vec![(document.tree.root(), false)];

    while let Some((node, closing)) = stack.pop() {
        match node.value() {
            Node::Text(text) => {
                out.extend(text.chars().map(|c| if c.is_whitespace() { ' ' } else { c }));
            }
            Node::Element(el) => {
                let name = el.name();
                if closing {
                    ensure_breaks(&mut out, block_breaks(name));
                    continue;
                }
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                ensure_breaks(&mut out, block_breaks(name));
                stack.push((node, true));
                stack.extend(node.children().rev().map(|child| (child, false)));
            }
            _ => stack.extend(node.children().rev().map(|child| (child, false))),
        }
    }

    collapse_whitespace(&out)
}

/// Newlines required around an element's content.
fn block_breaks(name: &str) -> usize {
    if PARAGRAPH_ELEMENTS.contains(&name) {
        2
    } else if BLOCK_ELEMENTS.contains(&name) {
        1
    } else {
        0
    }
}

/// Make `out` end in at least `newlines` line breaks. Adjacent block
/// boundaries share their breaks instead of adding up.
fn ensure_breaks(out: &mut String, newlines: usize) {
    let trailing = out
        .chars()
        .rev()
        .take_while(|c| *c == '\n' || *c == ' ')
        .filter(|c| *c == '\n')
        .count();
    for _ in trailing..newlines {
        out.push('\n');
    }
}
