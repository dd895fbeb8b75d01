//! Document set and job operations.
//!
//! The plain functions take any [`Store`] and return structured data;
//! they back both the HTTP handlers and the `run_*` CLI commands, which
//! open the configured database and print a summary.

use anyhow::Result;
use serde::Serialize;

use docset_core::error::CoreError;
use docset_core::ids::{DocumentSetId, JobId, TreeId};
use docset_core::job::{self, Job, JobState};
use docset_core::models::{DocumentSet, ItemError};
use docset_core::store::{unix_now, Store};

use crate::config::Config;
use crate::db;

/// A job together with the per-reference errors recorded against it.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    #[serde(flatten)]
    pub job: Job,
    pub item_errors: Vec<ItemError>,
}

/// One row of `docset sets` / `GET /document-sets`.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSetSummary {
    #[serde(flatten)]
    pub set: DocumentSet,
    pub documents: usize,
    pub job_state: Option<JobState>,
    pub tree_id: Option<TreeId>,
}

/// Creates a document set for `query` and enqueues its ingestion job.
pub async fn create_document_set<S: Store + ?Sized>(store: &S, query: &str) -> Result<Job> {
    job::create_document_set(store, query).await
}

pub async fn get_job<S: Store + ?Sized>(store: &S, id: JobId) -> Result<JobStatus> {
    let job = job::get_job(store, id).await?;
    let item_errors = store.job_item_errors(id).await?;
    Ok(JobStatus { job, item_errors })
}

pub async fn retry_job<S: Store + ?Sized>(store: &S, id: JobId) -> Result<Job> {
    let job = job::retry_job(store, id, unix_now()).await?;
    tracing::info!(job = %id, "job resubmitted");
    Ok(job)
}

pub async fn list_document_sets<S: Store + ?Sized>(store: &S) -> Result<Vec<DocumentSetSummary>> {
    let mut summaries = Vec::new();
    for set in store.list_document_sets().await? {
        let documents = store.list_documents(set.id).await?.len();
        let job_state = store.job_for_document_set(set.id).await?.map(|j| j.state);
        let tree_id = store.tree_for_set(set.id).await?.map(|t| t.id);
        summaries.push(DocumentSetSummary {
            set,
            documents,
            job_state,
            tree_id,
        });
    }
    Ok(summaries)
}

/// Deletes a document set and everything it owns.
pub async fn delete_document_set<S: Store + ?Sized>(store: &S, id: DocumentSetId) -> Result<()> {
    if !store.delete_document_set(id).await? {
        return Err(CoreError::NotFound(format!("document set {}", id)).into());
    }
    tracing::info!(set = %id, "document set deleted");
    Ok(())
}

// ============ CLI ============

pub async fn run_create(config: &Config, query: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let job = create_document_set(&store, query).await?;

    println!("created document set {}", job.document_set_id);
    println!("  job: {} ({})", job.id, job.state);
    println!("  query: {}", job.query);

    store.pool().close().await;
    Ok(())
}

pub async fn run_job(config: &Config, id: JobId) -> Result<()> {
    let store = db::open_store(config).await?;
    let status = get_job(&store, id).await?;
    let job = &status.job;

    println!("job {}", job.id);
    println!("  state: {}", job.state);
    println!("  document set: {}", job.document_set_id);
    println!("  query: {}", job.query);
    println!("  attempts: {}", job.attempts);
    if let Some(err) = &job.last_error {
        println!("  last error: {}", err);
    }
    if let Some(doc) = job.initial_document_id {
        println!("  initial document: {}", doc);
    }
    if !status.item_errors.is_empty() {
        println!("  item errors: {}", status.item_errors.len());
        for item in &status.item_errors {
            println!("    {}: {}", item.reference_id, item.message);
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_retry(config: &Config, id: JobId) -> Result<()> {
    let store = db::open_store(config).await?;
    let job = retry_job(&store, id).await?;
    println!("job {} {}", job.id, job.state);
    store.pool().close().await;
    Ok(())
}

pub async fn run_sets(config: &Config) -> Result<()> {
    let store = db::open_store(config).await?;
    let sets = list_document_sets(&store).await?;

    if sets.is_empty() {
        println!("No document sets.");
    } else {
        println!("{:<6} {:<12} {:>9} {:<6} QUERY", "ID", "JOB", "DOCUMENTS", "TREE");
        for s in &sets {
            println!(
                "{:<6} {:<12} {:>9} {:<6} {}",
                s.set.id,
                s.job_state.map(|st| st.to_string()).unwrap_or_else(|| "-".into()),
                s.documents,
                s.tree_id.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                s.set.query
            );
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_delete(config: &Config, id: DocumentSetId) -> Result<()> {
    let store = db::open_store(config).await?;
    delete_document_set(&store, id).await?;
    println!("deleted document set {}", id);
    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docset_core::error::core_error;
    use docset_core::models::NewDocument;
    use docset_core::store::memory::InMemoryStore;

    #[tokio::test]
    async fn summaries_report_job_state_and_counts() {
        let store = InMemoryStore::new();
        let job = create_document_set(&store, "  budget memos ").await.unwrap();
        store
            .add_document(job.document_set_id, &NewDocument::new("a", "t", "v"))
            .await
            .unwrap();

        let sets = list_document_sets(&store).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].set.query, "budget memos");
        assert_eq!(sets[0].documents, 1);
        assert_eq!(sets[0].job_state, Some(JobState::Submitted));
        assert_eq!(sets[0].tree_id, None);
    }

    #[tokio::test]
    async fn job_status_includes_item_errors() {
        let store = InMemoryStore::new();
        let job = create_document_set(&store, "q").await.unwrap();
        let item = ItemError {
            reference_id: "r1".into(),
            message: "reference has no id".into(),
        };
        store.record_item_error(job.id, &item).await.unwrap();

        let status = get_job(&store, job.id).await.unwrap();
        assert_eq!(status.item_errors, vec![item]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "submitted");
        assert_eq!(json["item_errors"][0]["reference_id"], "r1");
    }

    #[tokio::test]
    async fn deleting_unknown_set_is_not_found() {
        let store = InMemoryStore::new();
        let err = delete_document_set(&store, DocumentSetId::new(9)).await.unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn retry_only_applies_to_failed_jobs() {
        let store = InMemoryStore::new();
        let job = create_document_set(&store, "q").await.unwrap();
        let err = retry_job(&store, job.id).await.unwrap_err();
        assert!(matches!(
            core_error(&err),
            Some(CoreError::InvalidStateTransition { .. })
        ));
    }
}
