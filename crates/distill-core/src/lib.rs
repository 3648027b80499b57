//! # distill core
//!
//! I/O-free logic for distill: data models, token estimation, the
//! boundary-preferring windowing algorithm and the two things built on it
//! (input chunking and outbound segmentation), text normalization, and
//! retry policy math.
//!
//! This crate has no tokio, HTTP, or filesystem dependencies.

pub mod chunk;
pub mod models;
pub mod normalize;
pub mod retry;
pub mod segment;
pub mod tokens;
pub mod window;
