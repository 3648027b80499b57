//! Summarization backends.
//!
//! The summarizer only sees the [`SummaryBackend`] trait: one call to
//! condense a chunk, one call to merge several condensed texts. Each call is
//! a single attempt; retries are applied by the caller, which uses
//! [`BackendError::is_transient`] to decide.
//!
//! Implementations:
//! - **[`OllamaBackend`]**: `POST /api/generate` on a local Ollama server.
//! - **[`EchoBackend`]**: deterministic truncation, no network; for offline
//!   runs and dry tests of the pipeline.
//!
//! Use [`create_backend`] to build the configured one.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::BackendConfig;

/// Separator between texts handed to a single `combine` call.
pub const COMBINE_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Worth retrying: rate limits, server errors, timeouts, dropped
    /// connections.
    #[error("transient backend error: {0}")]
    Transient(String),
    #[error("backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

#[async_trait]
pub trait SummaryBackend: Send + Sync {
    /// Identifier for logs, e.g. `"ollama:gpt-oss:20b"`.
    fn name(&self) -> String;

    /// Condense one chunk of source text.
    async fn summarize(&self, text: &str) -> Result<String, BackendError>;

    /// Merge several summaries, given in order, into one.
    async fn combine(&self, texts: &[String]) -> Result<String, BackendError>;
}

/// Build the backend named by `backend.provider`.
pub fn create_backend(config: &BackendConfig) -> Result<Box<dyn SummaryBackend>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaBackend::new(config)?)),
        "echo" => Ok(Box::new(EchoBackend::default())),
        other => bail!("Unknown backend provider: {}", other),
    }
}

// ============ Prompts ============

const MAP_PROMPT: &str = "Summarize the key facts of the following section of a job posting. \
Keep company name, role, deadline, responsibilities, requirements, preferred \
qualifications and benefits when present. Do not invent anything.

{text}

Summary:";

const REDUCE_PROMPT: &str = "The following are partial summaries of one job posting, in order. \
Merge them into a single summary with this layout:

## Position: [title]
### Company: [company]

**Deadline**
- [deadline]

### A. Company & role
- [what the company does and the main duties]

### B. Requirements & preferred qualifications
**Required:**
- [requirements]

**Preferred:**
- [preferred qualifications]

### C. Benefits & other
- [benefits, perks, other details]

{text}";

pub fn map_prompt(text: &str) -> String {
    MAP_PROMPT.replace("{text}", text)
}

pub fn reduce_prompt(texts: &[String]) -> String {
    REDUCE_PROMPT.replace("{text}", &texts.join(COMBINE_SEPARATOR))
}

// ============ Ollama ============

/// Backend calling a local Ollama server.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    num_ctx: u32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            num_ctx: config.num_ctx,
            num_predict: config.num_predict,
        })
    }

    async fn generate(&self, prompt: String) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_ctx": self.num_ctx,
                "num_predict": self.num_predict,
            },
        });

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    BackendError::Fatal(e.to_string())
                } else {
                    BackendError::Transient(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.base_url, e
                    ))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let msg = format!("Ollama API error {}: {}", status, body_text);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(BackendError::Transient(msg));
            }
            return Err(BackendError::Fatal(msg));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Fatal(format!("Invalid Ollama response: {}", e)))?;

        let text = parsed.response.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Transient(
                "Ollama returned an empty response".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait]
impl SummaryBackend for OllamaBackend {
    fn name(&self) -> String {
        format!("ollama:{}", self.model)
    }

    async fn summarize(&self, text: &str) -> Result<String, BackendError> {
        self.generate(map_prompt(text)).await
    }

    async fn combine(&self, texts: &[String]) -> Result<String, BackendError> {
        self.generate(reduce_prompt(texts)).await
    }
}

// ============ Echo ============

/// Offline backend: `summarize` keeps the leading characters of the chunk,
/// `combine` joins its inputs and keeps the leading characters of that.
pub struct EchoBackend {
    pub summary_chars: usize,
    pub combine_chars: usize,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            summary_chars: 400,
            combine_chars: 1500,
        }
    }
}

fn take_chars(text: &str, n: usize) -> String {
    text.chars().take(n).collect::<String>().trim().to_string()
}

#[async_trait]
impl SummaryBackend for EchoBackend {
    fn name(&self) -> String {
        "echo".to_string()
    }

    async fn summarize(&self, text: &str) -> Result<String, BackendError> {
        Ok(take_chars(text, self.summary_chars))
    }

    async fn combine(&self, texts: &[String]) -> Result<String, BackendError> {
        Ok(take_chars(&texts.join("\n\n"), self.combine_chars))
    }
}
