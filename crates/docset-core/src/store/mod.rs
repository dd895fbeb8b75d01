//! Storage abstraction for document sets.
//!
//! The [`Store`] trait covers every entity of the data model: document
//! sets and the documents, tags, and cluster tree they own, plus the
//! ingestion jobs and log entries that describe how a set was built.
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! Ownership is expressed by cascade deletion: removing a document set
//! removes its documents, tags, tag memberships, tree, nodes, node
//! associations, and log entries. Jobs are audit records and survive.
//!
//! Every store is also a [`NodeLoader`], so tree traversal in
//! [`crate::tree`] runs directly against persisted nodes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::{DocumentId, DocumentSetId, JobId, TagId, TreeId};
use crate::job::Job;
use crate::models::{
    AddedDocument, Document, DocumentSet, ItemError, LogEntry, NewDocument, Tag, Tree,
};
use crate::tree::{NodeArena, NodeLoader};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_document_set_job`](Store::create_document_set_job) | New set and its `Submitted` job, atomically |
/// | [`add_document`](Store::add_document) | Get-or-create a document by external id |
/// | [`insert_tag`](Store::insert_tag) | Create a tag, rejecting duplicate names |
/// | [`replace_document_tags`](Store::replace_document_tags) | Exact tag membership for a document |
/// | [`save_tree`](Store::save_tree) | Persist a cluster tree, replacing the old one |
/// | [`claim_job`](Store::claim_job) | Take the lease on a job if nobody holds it |
/// | [`renew_lease`](Store::renew_lease) | Heartbeat a held lease |
/// | [`update_claimed_job`](Store::update_claimed_job) | Write a job back only while still holding its lease |
/// | [`delete_document_set`](Store::delete_document_set) | Cascade delete |
#[async_trait]
pub trait Store: NodeLoader {
    // ----- document sets -----

    async fn create_document_set(&self, query: &str) -> Result<DocumentSet>;

    async fn get_document_set(&self, id: DocumentSetId) -> Result<Option<DocumentSet>>;

    /// All sets, ascending by id.
    async fn list_document_sets(&self) -> Result<Vec<DocumentSet>>;

    /// Deletes the set and everything it owns. Returns `false` if it did
    /// not exist.
    async fn delete_document_set(&self, id: DocumentSetId) -> Result<bool>;

    // ----- documents -----

    /// Attaches a new document to `document_set_id`.
    ///
    /// When `doc.external_id` matches a document already in the set, that
    /// document is returned unchanged with `created == false`.
    async fn add_document(
        &self,
        document_set_id: DocumentSetId,
        doc: &NewDocument,
    ) -> Result<AddedDocument>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    /// Documents of a set, ascending by id.
    async fn list_documents(&self, document_set_id: DocumentSetId) -> Result<Vec<Document>>;

    /// The documents among `ids` that exist, ascending by id.
    async fn get_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>>;

    // ----- tags -----

    /// Tags of a set, ascending by id.
    async fn list_tags(&self, document_set_id: DocumentSetId) -> Result<Vec<Tag>>;

    /// Fails with `DuplicateTagViolation` if the name is taken in the set.
    async fn insert_tag(&self, document_set_id: DocumentSetId, name: &str) -> Result<Tag>;

    /// Sets the tags of `document_id` to exactly `tag_ids`. Every tag must
    /// belong to the document's own set.
    async fn replace_document_tags(&self, document_id: DocumentId, tag_ids: &[TagId])
        -> Result<()>;

    /// Tags of a document, ascending by id.
    async fn document_tags(&self, document_id: DocumentId) -> Result<Vec<Tag>>;

    async fn tag_documents(&self, tag_id: TagId) -> Result<Vec<DocumentId>>;

    // ----- trees -----

    /// Persists `arena` as the tree of `document_set_id`, replacing any
    /// previous tree of that set. Node ids are reassigned by the store in
    /// parent-before-child order.
    async fn save_tree(&self, document_set_id: DocumentSetId, arena: &NodeArena) -> Result<Tree>;

    async fn get_tree(&self, id: TreeId) -> Result<Option<Tree>>;

    async fn tree_for_set(&self, document_set_id: DocumentSetId) -> Result<Option<Tree>>;

    /// The tree's denormalized index of every document it reaches.
    async fn tree_documents(&self, tree_id: TreeId) -> Result<Vec<DocumentId>>;

    // ----- jobs -----

    /// Creates a document set and its `Submitted` creation job together.
    async fn create_document_set_job(&self, query: &str) -> Result<Job>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// All jobs, ascending by id.
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Most recent job that targets `document_set_id`.
    async fn job_for_document_set(&self, document_set_id: DocumentSetId) -> Result<Option<Job>>;

    /// Grants the lease on `id` to `worker` if the job is claimable and no
    /// live lease exists. Returns `None` when someone else holds it.
    async fn claim_job(
        &self,
        id: JobId,
        worker: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<Option<Job>>;

    /// Claims the oldest claimable job, if any.
    async fn claim_next_job(&self, worker: &str, now: i64, lease_secs: i64)
        -> Result<Option<Job>>;

    /// Moves the lease timestamp of a job `worker` holds to `now`.
    ///
    /// Fails with `LeaseLost` when the lease has passed to another worker
    /// or the job is no longer claimable.
    async fn renew_lease(&self, id: JobId, worker: &str, now: i64) -> Result<()>;

    /// Writes every mutable field of `job` back, provided `worker` still
    /// holds the lease and the stored job is not `Complete`. Fails with
    /// `LeaseLost` otherwise and leaves the stored job untouched.
    async fn update_claimed_job(&self, job: &Job, worker: &str) -> Result<()>;

    /// Writes every mutable field of `job` back unconditionally. Used for
    /// jobs nobody holds (retrying a failed job); workers go through
    /// [`update_claimed_job`](Store::update_claimed_job).
    async fn update_job(&self, job: &Job) -> Result<()>;

    async fn record_item_error(&self, job_id: JobId, error: &ItemError) -> Result<()>;

    async fn job_item_errors(&self, job_id: JobId) -> Result<Vec<ItemError>>;

    // ----- audit log -----

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Entries of a set, oldest first.
    async fn log_entries(&self, document_set_id: DocumentSetId) -> Result<Vec<LogEntry>>;
}

/// Current time as Unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
