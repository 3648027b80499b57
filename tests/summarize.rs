//! MapReduceSummarizer with an in-process scripted backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use distill::backend::{BackendError, SummaryBackend, COMBINE_SEPARATOR};
use distill::config::{FailureThreshold, SummarizeConfig};
use distill::summarize::{MapReduceSummarizer, SummarizeError};
use distill_core::chunk::hash_text;
use distill_core::models::Chunk;
use distill_core::tokens::TokenEstimator;

enum CombineMode {
    /// `C(a|b|...)`
    Wrap,
    /// Return the inputs joined, unchanged in size.
    Echo,
    /// Always return this text.
    Fixed(String),
    Fail(BackendError),
}

struct ScriptedBackend {
    /// Map output; `None` means `S:<chunk text>`.
    map_output: Option<String>,
    failures: HashMap<String, BackendError>,
    delays_ms: HashMap<String, u64>,
    combine: CombineMode,
    summarize_calls: Mutex<Vec<String>>,
    combine_calls: AtomicUsize,
}

impl ScriptedBackend {
    fn new() -> Self {
        Self {
            map_output: None,
            failures: HashMap::new(),
            delays_ms: HashMap::new(),
            combine: CombineMode::Wrap,
            summarize_calls: Mutex::new(Vec::new()),
            combine_calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, text: &str, err: BackendError) -> Self {
        self.failures.insert(text.to_string(), err);
        self
    }

    fn delayed(mut self, text: &str, ms: u64) -> Self {
        self.delays_ms.insert(text.to_string(), ms);
        self
    }

    fn combining(mut self, mode: CombineMode) -> Self {
        self.combine = mode;
        self
    }

    fn calls_for(&self, text: &str) -> usize {
        self.summarize_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == text)
            .count()
    }
}

#[async_trait]
impl SummaryBackend for ScriptedBackend {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn summarize(&self, text: &str) -> Result<String, BackendError> {
        self.summarize_calls.lock().unwrap().push(text.to_string());
        if let Some(ms) = self.delays_ms.get(text) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        if let Some(err) = self.failures.get(text) {
            return Err(err.clone());
        }
        Ok(match &self.map_output {
            Some(fixed) => fixed.clone(),
            None => format!("S:{}", text),
        })
    }

    async fn combine(&self, texts: &[String]) -> Result<String, BackendError> {
        self.combine_calls.fetch_add(1, Ordering::SeqCst);
        match &self.combine {
            CombineMode::Wrap => Ok(format!("C({})", texts.join("|"))),
            CombineMode::Echo => Ok(texts.join(COMBINE_SEPARATOR)),
            CombineMode::Fixed(text) => Ok(text.clone()),
            CombineMode::Fail(err) => Err(err.clone()),
        }
    }
}

fn chunks(texts: &[&str]) -> Vec<Chunk> {
    let mut offset = 0;
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let span = offset..offset + text.len();
            offset += text.len();
            Chunk {
                index,
                document_id: "posting".to_string(),
                span,
                overlap: 0,
                text: text.to_string(),
                tokens: TokenEstimator::default().estimate(text),
                hash: hash_text(text),
            }
        })
        .collect()
}

fn config() -> SummarizeConfig {
    SummarizeConfig {
        max_retries: 3,
        backoff_base_ms: 100,
        backoff_cap_ms: 1_000,
        jitter: 0.0,
        ..SummarizeConfig::default()
    }
}

fn summarizer(config: &SummarizeConfig) -> MapReduceSummarizer {
    MapReduceSummarizer::new(config, TokenEstimator::default()).unwrap()
}

fn transient() -> BackendError {
    BackendError::Transient("model overloaded".to_string())
}

#[tokio::test(start_paused = true)]
async fn all_chunks_succeed() {
    let backend = ScriptedBackend::new();
    let s = summarizer(&config());
    let out = s
        .summarize(&chunks(&["c0", "c1", "c2"]), &backend, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.text, "C(S:c0|S:c1|S:c2)");
    assert!(!out.partial);
    assert!(out.failed_chunks.is_empty());
    assert_eq!(out.reduce_passes, 0);
    assert_eq!(backend.combine_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_under_threshold_gives_partial_summary() {
    let backend = ScriptedBackend::new().failing("c1", transient());
    let cfg = SummarizeConfig {
        failure_threshold: FailureThreshold::Count(1),
        ..config()
    };
    let out = summarizer(&cfg)
        .summarize(&chunks(&["c0", "c1", "c2"]), &backend, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.text, "C(S:c0|S:c2)");
    assert!(out.partial);
    assert_eq!(out.failed_chunks, vec![1]);
    // Transient failures use the whole retry budget.
    assert_eq!(backend.calls_for("c1"), 3);
    assert_eq!(backend.calls_for("c0"), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_chunk_error_is_not_retried() {
    let backend =
        ScriptedBackend::new().failing("c1", BackendError::Fatal("bad request".to_string()));
    let out = summarizer(&config())
        .summarize(&chunks(&["c0", "c1", "c2"]), &backend, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.failed_chunks, vec![1]);
    assert_eq!(backend.calls_for("c1"), 1);
}

#[tokio::test(start_paused = true)]
async fn too_many_failures_is_majority_failure() {
    let backend = ScriptedBackend::new()
        .failing("c0", transient())
        .failing("c2", transient());
    let cfg = SummarizeConfig {
        failure_threshold: FailureThreshold::Count(1),
        ..config()
    };
    let err = summarizer(&cfg)
        .summarize(&chunks(&["c0", "c1", "c2"]), &backend, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SummarizeError::MajorityFailure {
            failed: 2,
            total: 3,
            failed_chunks: vec![0, 2],
        }
    );
    assert_eq!(backend.combine_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn every_chunk_failing_is_majority_failure_even_at_ratio_one() {
    let backend = ScriptedBackend::new()
        .failing("c0", transient())
        .failing("c1", transient());
    let cfg = SummarizeConfig {
        failure_threshold: FailureThreshold::Ratio(1.0),
        ..config()
    };
    let err = summarizer(&cfg)
        .summarize(&chunks(&["c0", "c1"]), &backend, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SummarizeError::MajorityFailure { failed: 2, total: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn output_does_not_depend_on_completion_order() {
    let texts = ["c0", "c1", "c2", "c3", "c4"];

    // Earlier chunks finish last.
    let scrambled = ScriptedBackend::new()
        .delayed("c0", 500)
        .delayed("c1", 400)
        .delayed("c2", 300)
        .delayed("c3", 200);
    let concurrent = SummarizeConfig {
        map_concurrency: 5,
        ..config()
    };
    let a = summarizer(&concurrent)
        .summarize(&chunks(&texts), &scrambled, &CancellationToken::new())
        .await
        .unwrap();

    let sequential = SummarizeConfig {
        map_concurrency: 1,
        ..config()
    };
    let b = summarizer(&sequential)
        .summarize(&chunks(&texts), &ScriptedBackend::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(a, b);
    assert_eq!(a.text, "C(S:c0|S:c1|S:c2|S:c3|S:c4)");
}

const PARTIAL: &str = "the candidate builds distributed systems in rust with care";

/// Budget that fits exactly three partials joined.
fn three_partial_budget() -> usize {
    let est = TokenEstimator::default();
    let three = vec![PARTIAL.to_string(); 3].join(COMBINE_SEPARATOR);
    let four = vec![PARTIAL.to_string(); 4].join(COMBINE_SEPARATOR);
    let budget = est.estimate(&three);
    assert!(est.estimate(&four) > budget);
    budget
}

fn many_chunks(n: usize) -> Vec<Chunk> {
    let names: Vec<String> = (0..n).map(|i| format!("chunk-{}", i)).collect();
    let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    chunks(&refs)
}

#[tokio::test(start_paused = true)]
async fn reduce_terminates_within_log_passes() {
    let mut backend = ScriptedBackend::new().combining(CombineMode::Fixed(PARTIAL.to_string()));
    backend.map_output = Some(PARTIAL.to_string());
    let cfg = SummarizeConfig {
        max_tokens_per_reduce: three_partial_budget(),
        ..config()
    };

    let out = summarizer(&cfg)
        .summarize(&many_chunks(27), &backend, &CancellationToken::new())
        .await
        .unwrap();

    // 27 -> 9 -> 3 -> final combine; ceil(log3(27)) = 3.
    assert_eq!(out.reduce_passes, 2);
    assert!(out.reduce_passes <= 3);
    assert_eq!(out.text, PARTIAL);
    assert_eq!(backend.combine_calls.load(Ordering::SeqCst), 9 + 3 + 1);
}

#[tokio::test(start_paused = true)]
async fn pass_limit_reports_reduce_stalled() {
    let mut backend = ScriptedBackend::new().combining(CombineMode::Fixed(PARTIAL.to_string()));
    backend.map_output = Some(PARTIAL.to_string());
    let cfg = SummarizeConfig {
        max_tokens_per_reduce: three_partial_budget(),
        max_reduce_passes: 1,
        ..config()
    };

    let err = summarizer(&cfg)
        .summarize(&many_chunks(27), &backend, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SummarizeError::ReduceStalled { passes: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn non_shrinking_combine_reports_reduce_stalled() {
    let mut backend = ScriptedBackend::new().combining(CombineMode::Echo);
    backend.map_output = Some(PARTIAL.to_string());
    let cfg = SummarizeConfig {
        max_tokens_per_reduce: three_partial_budget(),
        max_reduce_passes: 10,
        ..config()
    };

    let err = summarizer(&cfg)
        .summarize(&many_chunks(9), &backend, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SummarizeError::ReduceStalled { passes: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn combine_failure_surfaces() {
    let backend = ScriptedBackend::new()
        .combining(CombineMode::Fail(BackendError::Fatal("context overflow".to_string())));
    let err = summarizer(&config())
        .summarize(&chunks(&["c0", "c1"]), &backend, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SummarizeError::CombineFailure { pass: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn direct_path_skips_map_stage() {
    let backend = ScriptedBackend::new();
    let cfg = SummarizeConfig {
        direct_single_chunk: true,
        ..config()
    };
    let out = summarizer(&cfg)
        .summarize(&chunks(&["only"]), &backend, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.text, "C(only)");
    assert_eq!(out.reduce_passes, 0);
    assert!(backend.summarize_calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_chunk_is_mapped_by_default() {
    let backend = ScriptedBackend::new();
    let out = summarizer(&config())
        .summarize(&chunks(&["only"]), &backend, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.text, "C(S:only)");
}

#[tokio::test(start_paused = true)]
async fn cancelled_token_stops_summarization() {
    let backend = ScriptedBackend::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = summarizer(&config())
        .summarize(&chunks(&["c0", "c1"]), &backend, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, SummarizeError::Cancelled);
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let err = summarizer(&config())
        .summarize(&[], &ScriptedBackend::new(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, SummarizeError::EmptyInput);
}
