//! # distill
//!
//! Token-aware summarization of long documents.
//!
//! distill fetches a document over an unreliable network, splits it into
//! overlapping token-bounded chunks, summarizes each chunk with a model
//! backend, reduces the partial summaries until they fit one call, and
//! delivers the result in pieces small enough for a chat transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────────┐   ┌───────────┐
//! │  Fetcher  │──▶│ Splitter │──▶│ Map-Reduce  │──▶│ Segmenter │──▶ Delivery
//! │ retry +   │   │ (core)   │   │ Summarizer  │   │ (core)    │   stdout /
//! │ cache     │   └──────────┘   └──────┬──────┘   └───────────┘   Discord
//! └───────────┘                         │
//!                                ┌──────▼──────┐
//!                                │   Backend   │
//!                                │ Ollama/echo │
//!                                └─────────────┘
//! ```
//!
//! Pure logic (token estimation, windowing, chunk and segment models, retry
//! math) lives in the `distill-core` crate; this crate adds I/O.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`retry`] | Async retry executor with cancellation |
//! | [`fetch`] | Resilient HTTP fetch and HTML normalization |
//! | [`cache`] | Write-once raw/text cache of fetched documents |
//! | [`backend`] | Summarization backend trait, Ollama and echo backends |
//! | [`summarize`] | Map-reduce summarizer |
//! | [`delivery`] | Stdout and Discord delivery |
//! | [`progress`] | Progress reporting on stderr |
//! | [`pipeline`] | End-to-end orchestration |

pub mod backend;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod fetch;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod summarize;
