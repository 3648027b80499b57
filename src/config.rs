//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, via [`Config::default`]) is a working configuration. Values are
//! validated once in [`load_config`]; the rest of the crate trusts them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use distill_core::chunk::{ChunkConfigError, TextSplitter};
use distill_core::retry::RetryPolicy;
use distill_core::tokens::TokenEstimator;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
    #[serde(default = "default_tokens_per_word")]
    pub tokens_per_word: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
            chars_per_token: default_chars_per_token(),
            tokens_per_word: default_tokens_per_word(),
        }
    }
}

impl ChunkingConfig {
    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.chars_per_token, self.tokens_per_word)
    }

    pub fn splitter(&self) -> Result<TextSplitter, ChunkConfigError> {
        TextSplitter::with_estimator(self.max_tokens, self.overlap_tokens, self.estimator())
    }
}

fn default_max_tokens() -> usize {
    3000
}
fn default_overlap() -> usize {
    200
}
fn default_chars_per_token() -> f64 {
    distill_core::tokens::DEFAULT_CHARS_PER_TOKEN
}
fn default_tokens_per_word() -> f64 {
    distill_core::tokens::DEFAULT_TOKENS_PER_WORD
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    /// Total tries per URL, the first one included.
    #[serde(default = "default_fetch_retries", alias = "max_attempts")]
    pub max_retries: u32,
    #[serde(default = "default_fetch_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_fetch_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_fetch_retries(),
            backoff_base_ms: default_fetch_backoff_base_ms(),
            backoff_cap_ms: default_fetch_backoff_cap_ms(),
            jitter: default_jitter(),
            user_agent: default_user_agent(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay_ms: self.backoff_base_ms,
            max_delay_ms: self.backoff_cap_ms,
            jitter: self.jitter,
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    25
}
fn default_fetch_retries() -> u32 {
    4
}
fn default_fetch_backoff_base_ms() -> u64 {
    800
}
fn default_fetch_backoff_cap_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_user_agent() -> String {
    format!(
        "distill/{} (+https://github.com/distill-rs/distill)",
        env!("CARGO_PKG_VERSION")
    )
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

/// How many failed chunks the map stage tolerates.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailureThreshold {
    /// At most this many chunks may fail.
    Count(usize),
    /// At most this fraction of chunks may fail (`0.5` tolerates up to half).
    Ratio(f64),
}

impl Default for FailureThreshold {
    fn default() -> Self {
        FailureThreshold::Ratio(0.5)
    }
}

impl FailureThreshold {
    /// `true` when `failed` out of `total` is more than the threshold allows.
    /// Losing every chunk always exceeds it.
    pub fn exceeded(&self, failed: usize, total: usize) -> bool {
        if failed == 0 {
            return false;
        }
        if failed >= total {
            return true;
        }
        match *self {
            FailureThreshold::Count(n) => failed > n,
            FailureThreshold::Ratio(r) => failed as f64 > r * total as f64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizeConfig {
    #[serde(default = "default_max_tokens_per_reduce")]
    pub max_tokens_per_reduce: usize,
    #[serde(default = "default_map_concurrency")]
    pub map_concurrency: usize,
    #[serde(default = "default_max_reduce_passes")]
    pub max_reduce_passes: usize,
    #[serde(default)]
    pub failure_threshold: FailureThreshold,
    #[serde(default)]
    pub direct_single_chunk: bool,
    /// Total tries per model call, the first one included.
    #[serde(default = "default_summarize_retries", alias = "max_attempts")]
    pub max_retries: u32,
    #[serde(default = "default_summarize_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_summarize_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_reduce: default_max_tokens_per_reduce(),
            map_concurrency: default_map_concurrency(),
            max_reduce_passes: default_max_reduce_passes(),
            failure_threshold: FailureThreshold::default(),
            direct_single_chunk: false,
            max_retries: default_summarize_retries(),
            backoff_base_ms: default_summarize_backoff_base_ms(),
            backoff_cap_ms: default_summarize_backoff_cap_ms(),
            jitter: default_jitter(),
        }
    }
}

impl SummarizeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            base_delay_ms: self.backoff_base_ms,
            max_delay_ms: self.backoff_cap_ms,
            jitter: self.jitter,
        }
    }
}

fn default_max_tokens_per_reduce() -> usize {
    4000
}
fn default_map_concurrency() -> usize {
    3
}
fn default_max_reduce_passes() -> usize {
    8
}
fn default_summarize_retries() -> u32 {
    3
}
fn default_summarize_backoff_base_ms() -> u64 {
    500
}
fn default_summarize_backoff_cap_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            timeout_secs: default_backend_timeout_secs(),
            num_ctx: default_num_ctx(),
            num_predict: default_num_predict(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_model() -> String {
    "gpt-oss:20b".to_string()
}
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_backend_timeout_secs() -> u64 {
    120
}
fn default_num_ctx() -> u32 {
    4096
}
fn default_num_predict() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_chars_per_segment")]
    pub max_chars_per_segment: usize,
    /// Discord channels to post to. The bot token comes from
    /// `DISCORD_BOT_TOKEN`.
    #[serde(default)]
    pub discord_channel_ids: Vec<u64>,
    #[serde(default = "default_discord_api")]
    pub discord_api_base: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_chars_per_segment: default_max_chars_per_segment(),
            discord_channel_ids: Vec::new(),
            discord_api_base: default_discord_api(),
        }
    }
}

fn default_max_chars_per_segment() -> usize {
    1900
}
fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./summaries")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    config
        .chunking
        .splitter()
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;
    let cpt = config.chunking.chars_per_token;
    if cpt.is_nan() || cpt <= 0.0 {
        bail!("chunking.chars_per_token must be > 0");
    }
    if config.chunking.tokens_per_word < 0.0 {
        bail!("chunking.tokens_per_word must be >= 0");
    }

    // Validate fetch
    if config.fetch.max_retries == 0 {
        bail!("fetch.max_retries must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        bail!("fetch.timeout_secs must be > 0");
    }
    if !(0.0..=1.0).contains(&config.fetch.jitter) {
        bail!("fetch.jitter must be in [0.0, 1.0]");
    }

    // Validate summarize
    let s = &config.summarize;
    if s.max_tokens_per_reduce == 0 {
        bail!("summarize.max_tokens_per_reduce must be > 0");
    }
    if s.map_concurrency == 0 {
        bail!("summarize.map_concurrency must be >= 1");
    }
    if s.max_reduce_passes == 0 {
        bail!("summarize.max_reduce_passes must be >= 1");
    }
    if s.max_retries == 0 {
        bail!("summarize.max_retries must be >= 1");
    }
    if !(0.0..=1.0).contains(&s.jitter) {
        bail!("summarize.jitter must be in [0.0, 1.0]");
    }
    if let FailureThreshold::Ratio(r) = s.failure_threshold {
        if r.is_nan() || r <= 0.0 || r > 1.0 {
            bail!("summarize.failure_threshold.ratio must be in (0.0, 1.0]");
        }
    }

    // Validate backend
    match config.backend.provider.as_str() {
        "ollama" | "echo" => {}
        other => bail!(
            "Unknown backend provider: '{}'. Must be ollama or echo.",
            other
        ),
    }

    // Validate delivery
    if config.delivery.max_chars_per_segment == 0 {
        bail!("delivery.max_chars_per_segment must be > 0");
    }

    Ok(())
}
