//! Ingestion worker.
//!
//! Drives document set creation jobs through their lifecycle:
//! claim → search fetch → reference processing → complete, with an
//! optional tree build afterwards. Jobs are claimed through a lease on the
//! job row, so several workers (tasks or processes) can share one
//! database without processing the same job twice. A running job renews
//! its lease in the background, and every state write is conditional on
//! still holding it; a worker that loses the lease stops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use docset_core::cluster::{build_tree, ClusterParams};
use docset_core::error::{core_error, CoreError};
use docset_core::ids::JobId;
use docset_core::job::{Job, JobState};
use docset_core::models::LogEntry;
use docset_core::pipeline::{
    process_references, DefaultNormalizer, DocumentIndexer, NoopIndexer, Normalizer, SearchClient,
};
use docset_core::store::{unix_now, Store};

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::progress::{IngestProgressEvent, IngestProgressReporter, NoProgress, ProgressMode};
use crate::search_client::DocumentCloudClient;
use crate::sqlite_store::SqliteStore;

/// Everything a worker needs to process jobs.
pub struct Ingestor {
    store: Arc<dyn Store>,
    search: Arc<dyn SearchClient>,
    normalizer: Arc<dyn Normalizer>,
    indexer: Arc<dyn DocumentIndexer>,
    progress: Arc<dyn IngestProgressReporter>,
    settings: IngestConfig,
    tree: ClusterParams,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, search: Arc<dyn SearchClient>, config: &Config) -> Self {
        Self {
            store,
            search,
            normalizer: Arc::new(DefaultNormalizer),
            indexer: Arc::new(NoopIndexer),
            progress: Arc::new(NoProgress),
            settings: config.ingest.clone(),
            tree: config.tree.params(),
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<dyn DocumentIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn IngestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Claims the oldest claimable job and runs it. `Ok(None)` when the
    /// queue is empty.
    pub async fn process_next(&self, worker: &str) -> Result<Option<Job>> {
        let claimed = self
            .store
            .claim_next_job(worker, unix_now(), self.settings.lease_secs)
            .await?;
        match claimed {
            Some(job) => Ok(Some(self.run_job(job, worker).await?)),
            None => Ok(None),
        }
    }

    /// Runs one job `worker` already holds the lease on.
    ///
    /// The lease is renewed every third of `lease_secs` while the job runs.
    /// Once another worker holds it the run is abandoned with `LeaseLost`;
    /// documents already stored stay, since ingestion is idempotent per
    /// reference.
    pub async fn run_job(&self, job: Job, worker: &str) -> Result<Job> {
        let span = tracing::info_span!("job", id = %job.id, set = %job.document_set_id);
        let id = job.id;
        let run = self.run_claimed(job, worker).instrument(span);
        tokio::pin!(run);

        let mut renew = tokio::time::interval(self.renew_every());
        renew.tick().await;
        loop {
            tokio::select! {
                biased;
                result = &mut run => return result,
                _ = renew.tick() => {
                    let Err(e) = self.store.renew_lease(id, worker, unix_now()).await else {
                        continue;
                    };
                    if !matches!(core_error(&e), Some(CoreError::LeaseLost { .. })) {
                        tracing::warn!(job = %id, error = %format!("{:#}", e), "lease renewal failed");
                        continue;
                    }
                    if self.held_elsewhere(id, worker).await? {
                        tracing::warn!(job = %id, worker, "lease taken by another worker, abandoning job");
                        return Err(e);
                    }
                    // The run gave up the lease itself; its own writes decide.
                    return run.await;
                }
            }
        }
    }

    fn renew_every(&self) -> Duration {
        let lease_ms = self.settings.lease_secs.max(1) as u64 * 1000;
        Duration::from_millis((lease_ms / 3).max(100))
    }

    async fn held_elsewhere(&self, id: JobId, worker: &str) -> Result<bool> {
        let job = self.store.get_job(id).await?;
        Ok(matches!(
            job.and_then(|j| j.claimed_by),
            Some(holder) if holder != worker
        ))
    }

    async fn run_claimed(&self, mut job: Job, worker: &str) -> Result<Job> {
        if self.store.get_document_set(job.document_set_id).await?.is_none() {
            // The set was deleted while the job waited; nothing can be stored.
            let message = format!("document set {} no longer exists", job.document_set_id);
            job.record_fetch_failure(&message, 1, unix_now())?;
            self.store.update_claimed_job(&job, worker).await?;
            tracing::warn!(reason = %message, "job failed");
            self.finished(&job);
            return Ok(job);
        }

        self.progress.report(IngestProgressEvent::Fetching {
            job: job.id,
            query: job.query.clone(),
        });

        let timeout = Duration::from_secs(self.settings.fetch_timeout_secs);
        let references = match tokio::time::timeout(timeout, self.search.search(&job.query)).await {
            Ok(Ok(references)) => references,
            Ok(Err(e)) => return self.fetch_failed(job, worker, format!("{:#}", e)).await,
            Err(_) => {
                let err = CoreError::IngestionFetchError(format!(
                    "search timed out after {}s",
                    self.settings.fetch_timeout_secs
                ));
                return self.fetch_failed(job, worker, err.to_string()).await;
            }
        };

        job.start(unix_now())?;
        self.store.update_claimed_job(&job, worker).await?;
        tracing::info!(references = references.len(), "search fetched");

        let progress = self.progress.as_ref();
        let job_id = job.id;
        let outcome = process_references(
            self.store.as_ref(),
            job.document_set_id,
            &references,
            self.normalizer.as_ref(),
            self.indexer.as_ref(),
            |n, total| {
                progress.report(IngestProgressEvent::Ingesting {
                    job: job_id,
                    n: n as u64,
                    total: total as u64,
                })
            },
        )
        .await?;

        for item in &outcome.errors {
            self.store.record_item_error(job.id, item).await?;
            tracing::warn!(error = %CoreError::from(item.clone()), "item error recorded");
        }

        job.complete(outcome.initial_document, unix_now())?;
        self.store.update_claimed_job(&job, worker).await?;
        self.store
            .append_log(&LogEntry {
                document_set_id: job.document_set_id,
                date: unix_now(),
                component: "ingestion".into(),
                action: "complete".into(),
                details: Some(format!(
                    "{} created, {} existing, {} errors",
                    outcome.created,
                    outcome.existing,
                    outcome.errors.len()
                )),
            })
            .await?;
        tracing::info!(
            created = outcome.created,
            existing = outcome.existing,
            errors = outcome.errors.len(),
            "job complete"
        );

        if self.settings.build_tree {
            if let Err(e) = build_tree(self.store.as_ref(), job.document_set_id, &self.tree).await {
                tracing::warn!(error = %format!("{:#}", e), "tree build after ingestion failed");
            }
        }

        self.finished(&job);
        Ok(job)
    }

    async fn fetch_failed(&self, mut job: Job, worker: &str, message: String) -> Result<Job> {
        let state = job.record_fetch_failure(&message, self.settings.max_attempts, unix_now())?;
        self.store.update_claimed_job(&job, worker).await?;
        if state == JobState::Failed {
            tracing::error!(attempts = job.attempts, error = %message, "job failed");
        } else {
            tracing::warn!(attempts = job.attempts, error = %message, "search fetch failed, will retry");
        }
        self.finished(&job);
        Ok(job)
    }

    fn finished(&self, job: &Job) {
        self.progress.report(IngestProgressEvent::Finished {
            job: job.id,
            state: job.state.to_string(),
        });
    }

    /// Processes jobs until the queue is empty. Returns how many ran.
    pub async fn drain(&self, worker: &str) -> Result<usize> {
        let mut processed = 0;
        while self.process_next(worker).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }
}

fn worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Starts `count` worker tasks sharing `ingestor`.
///
/// With `once` each task exits when it finds the queue empty; otherwise it
/// polls every `poll_interval_ms` until aborted.
pub fn spawn_workers(
    ingestor: Arc<Ingestor>,
    count: usize,
    once: bool,
) -> Vec<JoinHandle<Result<usize>>> {
    (0..count)
        .map(|_| {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move {
                let worker = worker_id();
                let poll = Duration::from_millis(ingestor.settings.poll_interval_ms);
                tracing::debug!(worker = %worker, "worker started");
                let mut processed = 0;
                loop {
                    match ingestor.process_next(&worker).await {
                        Ok(Some(_)) => processed += 1,
                        Ok(None) if once => break,
                        Ok(None) => tokio::time::sleep(poll).await,
                        Err(e) if matches!(core_error(&e), Some(CoreError::LeaseLost { .. })) => {
                            tracing::warn!(worker = %worker, error = %e, "job abandoned");
                        }
                        Err(e) if once => return Err(e),
                        Err(e) => {
                            tracing::error!(worker = %worker, error = %format!("{:#}", e), "job run failed");
                            tokio::time::sleep(poll).await;
                        }
                    }
                }
                Ok(processed)
            })
        })
        .collect()
}

/// `docset worker`: runs ingestion workers against the configured database.
pub async fn run_worker(config: &Config, once: bool, mode: ProgressMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let search: Arc<dyn SearchClient> = Arc::new(DocumentCloudClient::new(&config.search)?);
    let ingestor = Arc::new(
        Ingestor::new(store, search, config).with_progress(Arc::from(mode.reporter())),
    );

    let handles = spawn_workers(ingestor, config.ingest.workers, once);

    if once {
        let mut total = 0;
        for handle in handles {
            total += handle.await??;
        }
        println!("worker");
        println!("  jobs processed: {}", total);
        println!("ok");
    } else {
        tracing::info!(workers = handles.len(), "workers running, ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        for handle in &handles {
            handle.abort();
        }
        tracing::info!("workers stopped");
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docset_core::models::DocumentReference;
    use docset_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_attempts: u32) -> Config {
        let mut config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
        config.ingest.max_attempts = max_attempts;
        config.ingest.fetch_timeout_secs = 1;
        config.ingest.build_tree = false;
        config
    }

    fn reference(id: &str) -> DocumentReference {
        DocumentReference {
            id: id.to_string(),
            title: format!("Document {}", id),
            canonical_url: format!("https://dc.example/{}", id),
            text_url: None,
            tags: None,
        }
    }

    struct Fixed(Vec<DocumentReference>);

    #[async_trait]
    impl SearchClient for Fixed {
        async fn search(&self, _query: &str) -> Result<Vec<DocumentReference>> {
            Ok(self.0.clone())
        }
    }

    struct Broken(AtomicUsize);

    #[async_trait]
    impl SearchClient for Broken {
        async fn search(&self, _query: &str) -> Result<Vec<DocumentReference>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::IngestionFetchError("503 from upstream".into()).into())
        }
    }

    struct Stalled;

    #[async_trait]
    impl SearchClient for Stalled {
        async fn search(&self, _query: &str) -> Result<Vec<DocumentReference>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn job_runs_to_complete_with_initial_document() {
        let store = Arc::new(InMemoryStore::new());
        let search = Arc::new(Fixed(vec![reference("a"), reference("b"), reference("c")]));
        let ingestor = Ingestor::new(store.clone(), search, &config(3));
        let job = store.create_document_set_job("memos").await.unwrap();

        let done = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Complete);
        assert_eq!(done.claimed_by, None);

        let docs = store.list_documents(job.document_set_id).await.unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(done.initial_document_id, Some(docs[0].id));
        assert!(ingestor.process_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_failures_fail_the_job_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let search = Arc::new(Broken(AtomicUsize::new(0)));
        let ingestor = Ingestor::new(store.clone(), search.clone(), &config(2));
        let job = store.create_document_set_job("memos").await.unwrap();

        let first = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Submitted);
        assert_eq!(first.attempts, 1);
        assert!(first.last_error.as_deref().unwrap().contains("503"));

        let second = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(second.state, JobState::Failed);
        assert!(ingestor.process_next("w").await.unwrap().is_none());
        assert_eq!(search.0.load(Ordering::SeqCst), 2);
        assert!(store.list_documents(job.document_set_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_timeout_counts_as_failure() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Arc::new(Stalled), &config(3));
        store.create_document_set_job("memos").await.unwrap();

        let job = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Submitted);
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn job_for_deleted_set_fails() {
        let store = Arc::new(InMemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), Arc::new(Fixed(vec![reference("a")])), &config(3));
        let job = store.create_document_set_job("memos").await.unwrap();
        store.delete_document_set(job.document_set_id).await.unwrap();

        let done = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Failed);
    }

    struct RejectingIndexer;

    #[async_trait]
    impl DocumentIndexer for RejectingIndexer {
        async fn index(&self, _document: &docset_core::models::Document) -> Result<()> {
            anyhow::bail!("index offline")
        }
    }

    #[tokio::test]
    async fn indexer_failures_are_item_errors() {
        let store = Arc::new(InMemoryStore::new());
        let search = Arc::new(Fixed(vec![reference("a"), reference("b")]));
        let ingestor =
            Ingestor::new(store.clone(), search, &config(3)).with_indexer(Arc::new(RejectingIndexer));
        let job = store.create_document_set_job("memos").await.unwrap();

        let done = ingestor.process_next("w").await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Complete);
        let errors = store.job_item_errors(job.id).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("index offline"));
        assert_eq!(store.list_documents(job.document_set_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn completed_job_builds_tree_when_enabled() {
        let store = Arc::new(InMemoryStore::new());
        let mut cfg = config(3);
        cfg.ingest.build_tree = true;
        let ingestor = Ingestor::new(store.clone(), Arc::new(Fixed(vec![reference("a")])), &cfg);
        let job = store.create_document_set_job("memos").await.unwrap();

        ingestor.drain("w").await.unwrap();
        let tree = store.tree_for_set(job.document_set_id).await.unwrap();
        assert!(tree.is_some());
        let actions: Vec<_> = store
            .log_entries(job.document_set_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["complete", "build_tree"]);
    }

    struct Slow(Vec<DocumentReference>);

    #[async_trait]
    impl SearchClient for Slow {
        async fn search(&self, _query: &str) -> Result<Vec<DocumentReference>> {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn lease_is_renewed_while_a_slow_fetch_runs() {
        let store = Arc::new(InMemoryStore::new());
        let mut cfg = config(3);
        cfg.ingest.lease_secs = 2;
        cfg.ingest.fetch_timeout_secs = 10;
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            Arc::new(Slow(vec![reference("a")])),
            &cfg,
        ));
        let job = store.create_document_set_job("memos").await.unwrap();

        let running = {
            let ingestor = Arc::clone(&ingestor);
            tokio::spawn(async move { ingestor.process_next("a").await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(store.claim_job(job.id, "b", unix_now(), 2).await.unwrap().is_none());

        let done = running.await.unwrap().unwrap().unwrap();
        assert_eq!(done.state, JobState::Complete);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Complete);
        assert_eq!(stored.claimed_by, None);
    }

    /// Hands the job to another worker while the search is in flight.
    struct Stealing {
        store: Arc<InMemoryStore>,
        job: JobId,
    }

    #[async_trait]
    impl SearchClient for Stealing {
        async fn search(&self, _query: &str) -> Result<Vec<DocumentReference>> {
            let stolen = self.store.claim_job(self.job, "b", unix_now() + 10_000, 1).await?;
            assert!(stolen.is_some());
            Ok(vec![reference("a")])
        }
    }

    #[tokio::test]
    async fn worker_stops_when_its_lease_is_taken() {
        let store = Arc::new(InMemoryStore::new());
        let job = store.create_document_set_job("memos").await.unwrap();
        let search = Arc::new(Stealing {
            store: store.clone(),
            job: job.id,
        });
        let ingestor = Ingestor::new(store.clone(), search, &config(3));

        let err = ingestor.process_next("a").await.unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::LeaseLost { .. })));

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Submitted);
        assert_eq!(stored.claimed_by.as_deref(), Some("b"));
        assert!(store.list_documents(job.document_set_id).await.unwrap().is_empty());
    }
}
