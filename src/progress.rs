//! Ingestion progress reporting.
//!
//! Reports observable progress while a worker processes a job so users see
//! which query is being fetched and how many references are left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use docset_core::ids::JobId;

/// A single progress event for one ingestion job.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// The search query has been issued; result count unknown.
    Fetching { job: JobId, query: String },
    /// n references processed out of total.
    Ingesting { job: JobId, n: u64, total: u64 },
    /// The job reached a resting state (`complete`, `submitted` or `failed`).
    Finished { job: JobId, state: String },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "job 3  ingesting  120 / 1,000 references".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Fetching { job, query } => {
                format!("job {}  fetching \"{}\"...\n", job, query)
            }
            IngestProgressEvent::Ingesting { job, n, total } => format!(
                "job {}  ingesting  {} / {} references\n",
                job,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Finished { job, state } => {
                format!("job {}  {}\n", job, state)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Fetching { job, query } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "fetching",
                "query": query
            }),
            IngestProgressEvent::Ingesting { job, n, total } => serde_json::json!({
                "event": "progress",
                "job": job,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            IngestProgressEvent::Finished { job, state } => serde_json::json!({
                "event": "finished",
                "job": job,
                "state": state
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
