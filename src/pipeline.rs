//! Pipeline orchestration.
//!
//! Coordinates a full run: fetch → clean → chunk → map-reduce → source
//! footer → save → segment → deliver. A failed fetch stops the run before
//! any model call. The whole run shares one cancellation token, optionally
//! bounded by a deadline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use distill_core::models::{Chunk, Document, FinalSummary, MessageSegment};
use distill_core::normalize::clean_text;
use distill_core::segment::segment;
use distill_core::tokens::TokenStats;

use crate::backend::SummaryBackend;
use crate::config::Config;
use crate::delivery::Delivery;
use crate::fetch::ResilientFetcher;
use crate::progress::{PipelineProgress, ProgressEvent};
use crate::summarize::MapReduceSummarizer;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Write the final text under `output.dir`.
    pub save: bool,
    /// Cancel everything still running after this long.
    pub deadline: Option<Duration>,
}

/// What a completed run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub url: String,
    pub cache_key: Option<String>,
    pub chunks: usize,
    pub document_tokens: usize,
    pub summary: FinalSummary,
    /// Summary text with the source footer, as delivered.
    pub final_text: String,
    pub segments: usize,
    pub messages_sent: usize,
    pub saved_to: Option<PathBuf>,
}

/// Run the pipeline for one URL.
pub async fn run_url(
    config: &Config,
    url: &str,
    backend: &dyn SummaryBackend,
    delivery: &dyn Delivery,
    progress: &dyn PipelineProgress,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<PipelineReport> {
    let scope = DeadlineScope::new(cancel, options.deadline);
    let cancel = scope.token();
    let fetcher = ResilientFetcher::new(&config.fetch)?;

    progress.report(ProgressEvent::Fetching {
        url: url.to_string(),
    });
    let doc = fetcher
        .fetch(url, cancel)
        .await
        .with_context(|| deadline_context("fetch", options.deadline, cancel))?;

    run_document(config, &doc, backend, delivery, progress, options, cancel).await
}

/// Run everything after the fetch on an already available document.
pub async fn run_document(
    config: &Config,
    doc: &Document,
    backend: &dyn SummaryBackend,
    delivery: &dyn Delivery,
    progress: &dyn PipelineProgress,
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<PipelineReport> {
    let chunks = chunk_document(config, doc)?;
    let document_tokens = config.chunking.estimator().estimate(&doc.text);
    progress.report(ProgressEvent::Chunked {
        chunks: chunks.len(),
        tokens: document_tokens,
    });
    tracing::info!(
        url = %doc.url,
        chunks = chunks.len(),
        tokens = document_tokens,
        "chunked document"
    );

    let summarizer =
        MapReduceSummarizer::new(&config.summarize, config.chunking.estimator())
            .map_err(|e| anyhow::anyhow!("summarize: {}", e))?;
    let summary = summarizer
        .summarize_with_progress(&chunks, backend, cancel, progress)
        .await
        .with_context(|| deadline_context("summarize", options.deadline, cancel))?;

    let final_text = with_source_footer(&summary.text, &doc.url);

    let saved_to = if options.save {
        let path = save_summary(&config.output.dir, &final_text, Local::now()).await?;
        tracing::info!(path = %path.display(), "summary saved");
        Some(path)
    } else {
        None
    };

    let segments: Vec<MessageSegment> =
        segment(&final_text, config.delivery.max_chars_per_segment);
    progress.report(ProgressEvent::Delivering {
        target: delivery.name(),
        segments: segments.len(),
    });
    let messages_sent = delivery
        .deliver(&segments, cancel)
        .await
        .with_context(|| format!("delivery via {} failed", delivery.name()))?;

    Ok(PipelineReport {
        url: doc.url.clone(),
        cache_key: doc.cache_key.clone(),
        chunks: chunks.len(),
        document_tokens,
        summary,
        final_text,
        segments: segments.len(),
        messages_sent,
        saved_to,
    })
}

/// Clean the document text and split it with the configured splitter.
pub fn chunk_document(config: &Config, doc: &Document) -> Result<Vec<Chunk>> {
    let splitter = config
        .chunking
        .splitter()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;
    let text = clean_text(&doc.text);
    Ok(splitter.split(&doc.url, &text))
}

/// Append the `[source](<url>)` footer.
pub fn with_source_footer(text: &str, url: &str) -> String {
    format!("{}\n\n[source]({})", text.trim_end(), url)
}

/// Write `text` to `<dir>/summary_<YYYYmmdd_HHMMSS>.md` via a temp file and
/// rename.
pub async fn save_summary(dir: &Path, text: &str, now: DateTime<Local>) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    let name = format!("summary_{}.md", now.format("%Y%m%d_%H%M%S"));
    let path = dir.join(&name);
    let tmp = dir.join(format!(".{}.tmp", name));
    tokio::fs::write(&tmp, text.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(path)
}

/// Cancellation scope of one run: a child token that is also cancelled
/// once `deadline` elapses. Dropping the scope cancels the child and stops
/// the deadline timer; the parent token is never touched.
pub struct DeadlineScope {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineScope {
    pub fn new(parent: &CancellationToken, deadline: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timer = deadline.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(limit) => {
                        tracing::warn!(
                            deadline_secs = limit.as_secs_f64(),
                            "deadline reached, cancelling"
                        );
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            })
        });
        Self { token, timer }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// `true` while a deadline timer is still waiting.
    pub fn timer_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DeadlineScope {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

fn deadline_context(
    stage: &str,
    deadline: Option<Duration>,
    cancel: &CancellationToken,
) -> String {
    match deadline {
        Some(limit) if cancel.is_cancelled() => {
            format!("{} stopped: deadline of {:?} reached", stage, limit)
        }
        _ => format!("{} failed", stage),
    }
}

/// How a document would be processed, without calling a model.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingPlan {
    pub stats: TokenStats,
    pub chunk_count: usize,
    pub chunk_tokens: Vec<usize>,
    pub avg_chunk_tokens: usize,
    pub recommended_concurrency: usize,
}

pub fn plan_document(config: &Config, doc: &Document) -> Result<ProcessingPlan> {
    let chunks = chunk_document(config, doc)?;
    let estimator = config.chunking.estimator();
    let stats = estimator.stats(&clean_text(&doc.text), config.chunking.max_tokens);
    let chunk_tokens: Vec<usize> = chunks.iter().map(|c| c.tokens).collect();
    let avg_chunk_tokens = if chunk_tokens.is_empty() {
        0
    } else {
        chunk_tokens.iter().sum::<usize>() / chunk_tokens.len()
    };
    Ok(ProcessingPlan {
        stats,
        chunk_count: chunks.len(),
        recommended_concurrency: chunks.len().clamp(1, config.summarize.map_concurrency),
        chunk_tokens,
        avg_chunk_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn footer_is_appended_once() {
        assert_eq!(
            with_source_footer("Summary\n", "https://jobs.example/1"),
            "Summary\n\n[source](https://jobs.example/1)"
        );
    }

    #[tokio::test]
    async fn save_summary_names_file_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let path = save_summary(dir.path(), "hello", now).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "summary_20240506_070809.md");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn plan_counts_chunks() {
        let mut config = Config::default();
        config.chunking.max_tokens = 50;
        config.chunking.overlap_tokens = 5;
        let text = "Rust services need careful engineering. ".repeat(40);
        let plan = plan_document(&config, &Document::from_text("doc", text)).unwrap();
        assert!(plan.chunk_count > 1);
        assert_eq!(plan.chunk_tokens.len(), plan.chunk_count);
        assert!(plan.chunk_tokens.iter().all(|&t| t <= 50));
        assert!(plan.stats.over_limit);
        assert_eq!(plan.recommended_concurrency, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_child_only() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Some(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(scope.token().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_run_stops_deadline_timer() {
        let parent = CancellationToken::new();
        let scope = DeadlineScope::new(&parent, Some(Duration::from_secs(3600)));
        let child = scope.token().clone();
        tokio::task::yield_now().await;
        assert!(scope.timer_running());

        let started = tokio::time::Instant::now();
        drop(scope);
        child.cancelled().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn scope_without_deadline_has_no_timer() {
        let scope = DeadlineScope::new(&CancellationToken::new(), None);
        assert!(!scope.timer_running());
        assert!(!scope.token().is_cancelled());
    }
}
