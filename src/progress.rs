//! Pipeline progress reporting.
//!
//! Reports observable progress during `distill run` so users see which stage
//! is running and how many chunks are done. Progress is emitted on
//! **stderr** so stdout stays reserved for the summary itself.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Download started.
    Fetching { url: String },
    /// Document split into chunks.
    Chunked { chunks: usize, tokens: usize },
    /// Map stage: `done` chunks finished out of `total`, `failed` of them
    /// unsuccessfully.
    Mapping {
        done: usize,
        total: usize,
        failed: usize,
    },
    /// Reduce stage: combining `batches` groups in pass `pass` (1-based).
    Reducing { pass: usize, batches: usize },
    /// Final summary produced.
    Summarized { tokens: usize, partial: bool },
    /// Sending `segments` messages to `target`.
    Delivering { target: String, segments: usize },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait PipelineProgress: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "distill  map  3 / 12 chunks".
pub struct StderrProgress;

impl PipelineProgress for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Fetching { url } => format!("distill  fetch  {}\n", url),
            ProgressEvent::Chunked { chunks, tokens } => format!(
                "distill  chunk  {} chunks, ~{} tokens\n",
                format_number(*chunks as u64),
                format_number(*tokens as u64)
            ),
            ProgressEvent::Mapping {
                done,
                total,
                failed,
            } => {
                let mut line = format!(
                    "distill  map  {} / {} chunks",
                    format_number(*done as u64),
                    format_number(*total as u64)
                );
                if *failed > 0 {
                    line.push_str(&format!(" ({} failed)", failed));
                }
                line.push('\n');
                line
            }
            ProgressEvent::Reducing { pass, batches } => {
                format!("distill  reduce  pass {}  {} batches\n", pass, batches)
            }
            ProgressEvent::Summarized { tokens, partial } => format!(
                "distill  done  ~{} tokens{}\n",
                format_number(*tokens as u64),
                if *partial { " (partial)" } else { "" }
            ),
            ProgressEvent::Delivering { target, segments } => {
                format!("distill  deliver  {}  {} messages\n", target, segments)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl PipelineProgress for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Fetching { url } => serde_json::json!({
            "event": "progress",
            "phase": "fetching",
            "url": url
        }),
        ProgressEvent::Chunked { chunks, tokens } => serde_json::json!({
            "event": "progress",
            "phase": "chunked",
            "chunks": chunks,
            "tokens": tokens
        }),
        ProgressEvent::Mapping {
            done,
            total,
            failed,
        } => serde_json::json!({
            "event": "progress",
            "phase": "mapping",
            "n": done,
            "total": total,
            "failed": failed
        }),
        ProgressEvent::Reducing { pass, batches } => serde_json::json!({
            "event": "progress",
            "phase": "reducing",
            "pass": pass,
            "batches": batches
        }),
        ProgressEvent::Summarized { tokens, partial } => serde_json::json!({
            "event": "progress",
            "phase": "summarized",
            "tokens": tokens,
            "partial": partial
        }),
        ProgressEvent::Delivering { target, segments } => serde_json::json!({
            "event": "progress",
            "phase": "delivering",
            "target": target,
            "segments": segments
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl PipelineProgress for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn PipelineProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_mapping_event() {
        let v = event_json(&ProgressEvent::Mapping {
            done: 2,
            total: 5,
            failed: 1,
        });
        assert_eq!(v["phase"], "mapping");
        assert_eq!(v["n"], 2);
        assert_eq!(v["total"], 5);
        assert_eq!(v["failed"], 1);
    }
}
