//! Map-reduce summarization over chunks.
//!
//! # Map
//!
//! Every chunk is sent to [`SummaryBackend::summarize`] once, with at most
//! `map_concurrency` calls in flight. Transient backend errors are retried
//! under the summarize [`RetryPolicy`]; a chunk that still fails is recorded
//! and its siblings keep running. Results are put back in chunk order before
//! anything else looks at them, so completion order never leaks into the
//! output.
//!
//! If more chunks failed than the [`FailureThreshold`] allows the whole run
//! fails with [`SummarizeError::MajorityFailure`]. Otherwise the survivors
//! move on and the result is flagged `partial`.
//!
//! # Reduce
//!
//! An explicit loop. Each iteration joins the current texts with
//! [`COMBINE_SEPARATOR`]; if that fits `max_tokens_per_reduce` a single
//! `combine` call produces the final summary. If not, one *pass* runs:
//! texts are packed greedily into batches that each fit the budget (a text
//! that is too large on its own is split with a [`TextSplitter`]), every
//! batch is combined (up to `map_concurrency` at once), and the batch
//! outputs become the next iteration's input.
//!
//! The loop gives up with [`SummarizeError::ReduceStalled`] after
//! `max_reduce_passes` passes, or when two consecutive passes fail to
//! shrink the total estimate.

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use distill_core::chunk::{ChunkConfigError, TextSplitter};
use distill_core::models::{Chunk, FinalSummary, PartialSummary};
use distill_core::retry::RetryPolicy;
use distill_core::tokens::TokenEstimator;

use crate::backend::{BackendError, SummaryBackend, COMBINE_SEPARATOR};
use crate::config::{FailureThreshold, SummarizeConfig};
use crate::progress::{NoProgress, PipelineProgress, ProgressEvent};
use crate::retry::{Retrier, RetryError};

#[derive(Debug, Error, PartialEq)]
pub enum SummarizeError {
    #[error("nothing to summarize")]
    EmptyInput,
    /// The only chunk failed on the direct path.
    #[error("chunk {chunk} failed: {reason}")]
    PerChunkFailure { chunk: usize, reason: String },
    #[error("{failed} of {total} chunks failed to summarize (chunks {failed_chunks:?})")]
    MajorityFailure {
        failed: usize,
        total: usize,
        failed_chunks: Vec<usize>,
    },
    #[error("reduce stalled after {passes} pass(es) at ~{tokens} tokens")]
    ReduceStalled { passes: usize, tokens: usize },
    #[error("combine failed in reduce pass {pass}: {reason}")]
    CombineFailure { pass: usize, reason: String },
    #[error("summarization cancelled")]
    Cancelled,
}

/// A chunk the map stage gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk: usize,
    pub reason: String,
}

pub struct MapReduceSummarizer {
    estimator: TokenEstimator,
    reduce_splitter: TextSplitter,
    max_tokens_per_reduce: usize,
    concurrency: usize,
    max_reduce_passes: usize,
    threshold: FailureThreshold,
    direct_single_chunk: bool,
    policy: RetryPolicy,
}

impl MapReduceSummarizer {
    pub fn new(
        config: &SummarizeConfig,
        estimator: TokenEstimator,
    ) -> Result<Self, ChunkConfigError> {
        let reduce_splitter =
            TextSplitter::with_estimator(config.max_tokens_per_reduce, 0, estimator)?;
        Ok(Self {
            estimator,
            reduce_splitter,
            max_tokens_per_reduce: config.max_tokens_per_reduce,
            concurrency: config.map_concurrency.max(1),
            max_reduce_passes: config.max_reduce_passes,
            threshold: config.failure_threshold,
            direct_single_chunk: config.direct_single_chunk,
            policy: config.retry_policy(),
        })
    }

    pub async fn summarize(
        &self,
        chunks: &[Chunk],
        backend: &dyn SummaryBackend,
        cancel: &CancellationToken,
    ) -> Result<FinalSummary, SummarizeError> {
        self.summarize_with_progress(chunks, backend, cancel, &NoProgress)
            .await
    }

    pub async fn summarize_with_progress(
        &self,
        chunks: &[Chunk],
        backend: &dyn SummaryBackend,
        cancel: &CancellationToken,
        progress: &dyn PipelineProgress,
    ) -> Result<FinalSummary, SummarizeError> {
        if chunks.is_empty() {
            return Err(SummarizeError::EmptyInput);
        }
        let retrier = Retrier::new(self.policy, cancel.clone());

        if self.direct_single_chunk && chunks.len() == 1 {
            let chunk = &chunks[0];
            tracing::info!(chunk = chunk.index, "single chunk, skipping map stage");
            let text = self
                .combine(&retrier, backend, std::slice::from_ref(&chunk.text))
                .await
                .map_err(|e| match e {
                    SummarizeError::CombineFailure { reason, .. } => {
                        SummarizeError::PerChunkFailure {
                            chunk: chunk.index,
                            reason,
                        }
                    }
                    other => other,
                })?;
            return Ok(self.finish(text, Vec::new(), 0, progress));
        }

        let (partials, failures) = self
            .map_stage(chunks, backend, &retrier, progress)
            .await?;

        let failed_chunks: Vec<usize> = failures.iter().map(|f| f.chunk).collect();
        if self.threshold.exceeded(failures.len(), chunks.len()) {
            tracing::error!(
                failed = failures.len(),
                total = chunks.len(),
                "too many chunks failed"
            );
            return Err(SummarizeError::MajorityFailure {
                failed: failures.len(),
                total: chunks.len(),
                failed_chunks,
            });
        }
        if !failures.is_empty() {
            tracing::warn!(
                failed = failures.len(),
                total = chunks.len(),
                chunks = ?failed_chunks,
                "continuing with a partial map result"
            );
        }

        let texts: Vec<String> = partials.into_iter().map(|p| p.text).collect();
        let (text, passes) = self
            .reduce_stage(texts, backend, &retrier, progress)
            .await?;
        Ok(self.finish(text, failed_chunks, passes, progress))
    }

    fn finish(
        &self,
        text: String,
        failed_chunks: Vec<usize>,
        reduce_passes: usize,
        progress: &dyn PipelineProgress,
    ) -> FinalSummary {
        let tokens = self.estimator.estimate(&text);
        let partial = !failed_chunks.is_empty();
        progress.report(ProgressEvent::Summarized { tokens, partial });
        tracing::info!(tokens, partial, reduce_passes, "summary ready");
        FinalSummary {
            text,
            tokens,
            partial,
            failed_chunks,
            reduce_passes,
        }
    }

    /// Summarize every chunk. Returns survivors in chunk order plus the
    /// chunks that failed, also in chunk order.
    async fn map_stage(
        &self,
        chunks: &[Chunk],
        backend: &dyn SummaryBackend,
        retrier: &Retrier,
        progress: &dyn PipelineProgress,
    ) -> Result<(Vec<PartialSummary>, Vec<ChunkFailure>), SummarizeError> {
        let total = chunks.len();
        let mut results = stream::iter(chunks)
            .map(move |chunk| async move {
                let out = retrier
                    .run("summarize", BackendError::is_transient, |attempt| {
                        tracing::debug!(chunk = chunk.index, attempt, "summarizing chunk");
                        backend.summarize(&chunk.text)
                    })
                    .await;
                (chunk.index, out)
            })
            .buffer_unordered(self.concurrency);

        let mut partials = Vec::with_capacity(total);
        let mut failures = Vec::new();
        let mut done = 0;

        while let Some((index, out)) = results.next().await {
            done += 1;
            match out {
                Ok(text) => {
                    let tokens = self.estimator.estimate(&text);
                    partials.push(PartialSummary {
                        chunk_index: index,
                        text,
                        tokens,
                    });
                }
                Err(RetryError::Cancelled { .. }) => return Err(SummarizeError::Cancelled),
                Err(e) => {
                    let reason = e
                        .into_error()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    tracing::warn!(chunk = index, error = %reason, "chunk failed");
                    failures.push(ChunkFailure {
                        chunk: index,
                        reason,
                    });
                }
            }
            progress.report(ProgressEvent::Mapping {
                done,
                total,
                failed: failures.len(),
            });
        }

        partials.sort_by_key(|p| p.chunk_index);
        failures.sort_by_key(|f| f.chunk);
        Ok((partials, failures))
    }

    /// Reduce texts until one combine call covers them all. Returns the
    /// final text and the number of grouping passes.
    async fn reduce_stage(
        &self,
        mut texts: Vec<String>,
        backend: &dyn SummaryBackend,
        retrier: &Retrier,
        progress: &dyn PipelineProgress,
    ) -> Result<(String, usize), SummarizeError> {
        let mut passes = 0;
        let mut non_shrinking = 0;

        loop {
            let tokens = self.joined_tokens(&texts);
            if tokens <= self.max_tokens_per_reduce {
                let text = self
                    .combine(retrier, backend, &texts)
                    .await
                    .map_err(|e| with_pass(e, passes + 1))?;
                return Ok((text, passes));
            }

            if passes >= self.max_reduce_passes {
                tracing::error!(passes, tokens, "reduce pass limit reached");
                return Err(SummarizeError::ReduceStalled { passes, tokens });
            }
            passes += 1;

            let batches = self.pack(&texts);
            tracing::info!(pass = passes, batches = batches.len(), tokens, "reduce pass");
            progress.report(ProgressEvent::Reducing {
                pass: passes,
                batches: batches.len(),
            });

            let outputs: Vec<Result<String, SummarizeError>> = stream::iter(&batches)
                .map(|batch| self.combine(retrier, backend, batch))
                .buffered(self.concurrency)
                .collect()
                .await;
            let next = outputs
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| with_pass(e, passes))?;

            let next_tokens = self.joined_tokens(&next);
            if next_tokens >= tokens {
                non_shrinking += 1;
                tracing::warn!(
                    pass = passes,
                    before = tokens,
                    after = next_tokens,
                    "reduce pass did not shrink"
                );
                if non_shrinking >= 2 {
                    return Err(SummarizeError::ReduceStalled {
                        passes,
                        tokens: next_tokens,
                    });
                }
            } else {
                non_shrinking = 0;
            }
            texts = next;
        }
    }

    /// One `combine` call with retries. Errors carry pass 0; callers fill in
    /// the real pass number.
    async fn combine(
        &self,
        retrier: &Retrier,
        backend: &dyn SummaryBackend,
        texts: &[String],
    ) -> Result<String, SummarizeError> {
        retrier
            .run("combine", BackendError::is_transient, |attempt| {
                tracing::debug!(inputs = texts.len(), attempt, "combining");
                backend.combine(texts)
            })
            .await
            .map_err(|e| match e.into_error() {
                None => SummarizeError::Cancelled,
                Some(err) => SummarizeError::CombineFailure {
                    pass: 0,
                    reason: err.to_string(),
                },
            })
    }

    fn joined_tokens(&self, texts: &[String]) -> usize {
        self.estimator.estimate(&texts.join(COMBINE_SEPARATOR))
    }

    /// Greedy packing of texts, in order, into batches whose joined estimate
    /// fits the reduce budget.
    fn pack(&self, texts: &[String]) -> Vec<Vec<String>> {
        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for text in texts {
            let oversized = self.estimator.estimate(text) > self.max_tokens_per_reduce;
            let pieces: Vec<String> = if oversized {
                self.reduce_splitter
                    .split("reduce", text)
                    .into_iter()
                    .map(|c| c.text)
                    .collect()
            } else {
                vec![text.clone()]
            };

            for piece in pieces {
                if !current.is_empty() {
                    let candidate = format!(
                        "{}{}{}",
                        current.join(COMBINE_SEPARATOR),
                        COMBINE_SEPARATOR,
                        piece
                    );
                    if self.estimator.estimate(&candidate) > self.max_tokens_per_reduce {
                        batches.push(std::mem::take(&mut current));
                    }
                }
                current.push(piece);
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

fn with_pass(err: SummarizeError, pass: usize) -> SummarizeError {
    match err {
        SummarizeError::CombineFailure { reason, .. } => {
            SummarizeError::CombineFailure { pass, reason }
        }
        other => other,
    }
}
