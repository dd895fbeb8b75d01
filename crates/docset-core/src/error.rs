//! Domain error kinds.
//!
//! Core functions return `anyhow::Result` like the rest of the codebase;
//! when a failure belongs to one of the kinds below it is raised as a
//! [`CoreError`] so callers (the HTTP layer in particular) can recover it
//! with `err.downcast_ref::<CoreError>()`.

use thiserror::Error;

use crate::ids::{DocumentSetId, JobId};
use crate::job::JobState;
use crate::models::ItemError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Double-parenting, cycles, or a node arena without a single root.
    #[error("invalid tree operation: {0}")]
    InvalidTreeOperation(String),

    /// The store refused a second tag with the same name in one set.
    #[error("duplicate tag '{name}' in document set {document_set_id}")]
    DuplicateTagViolation {
        document_set_id: DocumentSetId,
        name: String,
    },

    /// One search reference could not be turned into a document.
    #[error("reference '{reference_id}': {message}")]
    IngestionItemError {
        reference_id: String,
        message: String,
    },

    /// The search collaborator failed or timed out as a whole.
    #[error("search fetch failed: {0}")]
    IngestionFetchError(String),

    #[error("invalid job state transition: {from} -> {to}")]
    InvalidStateTransition { from: JobState, to: JobState },

    /// The worker no longer holds the lease on a job, or the job finished
    /// under someone else.
    #[error("lease on job {job} lost by {worker}")]
    LeaseLost { job: JobId, worker: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tree (re)building was requested while ingestion is still running.
    #[error("cannot build tree: {0}")]
    TreeBuildConflict(String),
}

impl From<ItemError> for CoreError {
    fn from(item: ItemError) -> Self {
        CoreError::IngestionItemError {
            reference_id: item.reference_id,
            message: item.message,
        }
    }
}

/// Returns the [`CoreError`] carried by an `anyhow` error, if any.
pub fn core_error(err: &anyhow::Error) -> Option<&CoreError> {
    err.downcast_ref::<CoreError>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_survive_anyhow_round_trip() {
        let err: anyhow::Error = CoreError::NotFound("document 4".to_string()).into();
        assert!(matches!(core_error(&err), Some(CoreError::NotFound(_))));
        assert_eq!(err.to_string(), "document 4 not found");
    }

    #[test]
    fn context_does_not_hide_the_kind() {
        let err = anyhow::Error::from(CoreError::InvalidInput("empty query".into()))
            .context("creating document set");
        assert!(matches!(core_error(&err), Some(CoreError::InvalidInput(_))));
    }

    #[test]
    fn item_errors_convert_to_the_item_kind() {
        let err = CoreError::from(ItemError {
            reference_id: "dc-9".into(),
            message: "reference has no id".into(),
        });
        assert_eq!(err.to_string(), "reference 'dc-9': reference has no id");
    }

    #[test]
    fn lease_lost_names_job_and_worker() {
        let err = CoreError::LeaseLost {
            job: JobId::new(5),
            worker: "worker-a".into(),
        };
        assert_eq!(err.to_string(), "lease on job 5 lost by worker-a");
    }

    #[test]
    fn duplicate_tag_message_names_the_set() {
        let err = CoreError::DuplicateTagViolation {
            document_set_id: DocumentSetId::new(3),
            name: "foo".into(),
        };
        assert_eq!(err.to_string(), "duplicate tag 'foo' in document set 3");
    }
}
