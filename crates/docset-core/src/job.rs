//! Document set creation jobs and their state machine.
//!
//! ```text
//!              claim + fetch ok           list consumed
//!  Submitted ───────────────────▶ InProgress ──────────────▶ Complete
//!     ▲  │                            │
//!     │  │ fetch failed,              │ fetch failed,
//!     │  │ attempts exhausted         │ attempts exhausted
//!     │  ▼                            ▼
//!     └─ Failed ◀──────────────────────
//!  retry
//! ```
//!
//! A failed fetch that still has attempts left leaves the state untouched
//! and only releases the lease, so the job is picked up again. `Complete`
//! is terminal; completing it again is a no-op.
//!
//! The lease (`claimed_by`, `claimed_at`) is what keeps two workers off
//! the same job. Stores grant it atomically in
//! [`Store::claim_job`](crate::store::Store::claim_job).

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{DocumentId, DocumentSetId, JobId};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    InProgress,
    Complete,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::InProgress => "in_progress",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == JobState::Complete
    }

    /// Whether a worker may take a lease on a job in this state.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Submitted | JobState::InProgress)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitted, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Complete)
                | (Submitted, Failed)
                | (InProgress, Failed)
                | (Failed, Submitted)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(JobState::Submitted),
            "in_progress" => Ok(JobState::InProgress),
            "complete" => Ok(JobState::Complete),
            "failed" => Ok(JobState::Failed),
            other => anyhow::bail!("unknown job state: '{}'", other),
        }
    }
}

/// Audit record of one request to build a document set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub query: String,
    pub document_set_id: DocumentSetId,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    /// Document built from the first usable search reference.
    pub initial_document_id: Option<DocumentId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    fn transition(&mut self, next: JobState, now: i64) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: next,
            }
            .into());
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the search results as fetched. Resuming an `InProgress` job
    /// after a lease expiry is allowed.
    pub fn start(&mut self, now: i64) -> Result<()> {
        self.transition(JobState::InProgress, now)
    }

    /// Finishes ingestion. Returns `false` (and changes nothing) when the
    /// job was already complete.
    pub fn complete(&mut self, initial_document: Option<DocumentId>, now: i64) -> Result<bool> {
        if self.state == JobState::Complete {
            return Ok(false);
        }
        self.transition(JobState::Complete, now)?;
        if self.initial_document_id.is_none() {
            self.initial_document_id = initial_document;
        }
        self.last_error = None;
        self.release();
        Ok(true)
    }

    /// Records a failed search fetch and gives up the lease.
    ///
    /// The state only changes once `max_attempts` fetches have failed, in
    /// which case the job becomes `Failed`.
    pub fn record_fetch_failure(&mut self, message: &str, max_attempts: u32, now: i64) -> Result<JobState> {
        if self.state.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: JobState::Failed,
            }
            .into());
        }
        self.attempts += 1;
        self.last_error = Some(message.to_string());
        self.updated_at = now;
        if self.attempts >= max_attempts {
            self.transition(JobState::Failed, now)?;
        }
        self.release();
        Ok(self.state)
    }

    /// Puts a failed job back in the queue with a fresh attempt budget.
    pub fn retry(&mut self, now: i64) -> Result<()> {
        self.transition(JobState::Submitted, now)?;
        self.attempts = 0;
        self.release();
        Ok(())
    }

    pub fn release(&mut self) {
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// Whether the lease is held by someone and has not yet expired.
    pub fn has_live_lease(&self, now: i64, lease_secs: i64) -> bool {
        match (&self.claimed_by, self.claimed_at) {
            (Some(_), Some(at)) => now - at < lease_secs,
            _ => false,
        }
    }
}

/// Creates a document set for `query` and enqueues its ingestion job.
pub async fn create_document_set<S: Store + ?Sized>(store: &S, query: &str) -> Result<Job> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CoreError::InvalidInput("query must not be empty".into()).into());
    }
    let job = store.create_document_set_job(query).await?;
    tracing::info!(job = %job.id, set = %job.document_set_id, query, "document set submitted");
    Ok(job)
}

pub async fn get_job<S: Store + ?Sized>(store: &S, id: JobId) -> Result<Job> {
    store
        .get_job(id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {}", id)).into())
}

/// Moves a `Failed` job back to `Submitted`.
pub async fn retry_job<S: Store + ?Sized>(store: &S, id: JobId, now: i64) -> Result<Job> {
    let mut job = get_job(store, id).await?;
    job.retry(now)?;
    store.update_job(&job).await?;
    Ok(job)
}
