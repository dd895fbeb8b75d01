//! SQLite-backed [`Store`] implementation.
//!
//! Ownership is enforced by the schema (`ON DELETE CASCADE`, see
//! [`crate::migrate`]); every write that touches more than one table runs
//! in a single transaction. Job leases are granted by one conditional
//! `UPDATE`, so two workers racing for the same job cannot both win.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use docset_core::error::CoreError;
use docset_core::ids::{DocumentId, DocumentSetId, JobId, NodeId, TagId, TreeId};
use docset_core::job::{Job, JobState};
use docset_core::models::{
    AddedDocument, Document, DocumentSet, ItemError, LogEntry, NewDocument, Node, Tag, Tree,
};
use docset_core::store::{unix_now, Store};
use docset_core::tree::{NodeArena, NodeLoader};

const JOB_COLUMNS: &str = "id, query, document_set_id, state, attempts, last_error, claimed_by, \
     claimed_at, initial_document_id, created_at, updated_at";

// A lease is free when nobody holds it or it was taken at or before the
// cutoff bound in the last parameter (now - lease_secs).
const CLAIMABLE: &str = "state IN ('submitted', 'in_progress') \
     AND (claimed_by IS NULL OR claimed_at IS NULL OR claimed_at <= ?)";

const UPDATE_JOB: &str = "UPDATE jobs SET state = ?, attempts = ?, last_error = ?, \
     claimed_by = ?, claimed_at = ?, initial_document_id = ?, updated_at = ?";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn require_set(&self, id: DocumentSetId) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_sets WHERE id = ?")
            .bind(id.get())
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            return Err(CoreError::NotFound(format!("document set {}", id)).into());
        }
        Ok(())
    }

    /// Error for a conditional job write that matched no row.
    async fn lease_miss(&self, id: JobId, worker: &str) -> anyhow::Error {
        match self.get_job(id).await {
            Ok(Some(_)) => CoreError::LeaseLost {
                job: id,
                worker: worker.to_string(),
            }
            .into(),
            Ok(None) => CoreError::NotFound(format!("job {}", id)).into(),
            Err(e) => e,
        }
    }

    async fn document_by_external_id(
        &self,
        document_set_id: DocumentSetId,
        external_id: &str,
    ) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, document_set_id, external_id, title, text_url, view_url \
             FROM documents WHERE document_set_id = ? AND external_id = ?",
        )
        .bind(document_set_id.get())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(document_from_row))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn set_from_row(row: &SqliteRow) -> DocumentSet {
    DocumentSet {
        id: DocumentSetId::new(row.get("id")),
        query: row.get("query"),
        created_at: row.get("created_at"),
    }
}

fn document_from_row(row: &SqliteRow) -> Document {
    Document {
        id: DocumentId::new(row.get("id")),
        document_set_id: DocumentSetId::new(row.get("document_set_id")),
        external_id: row.get("external_id"),
        title: row.get("title"),
        text_url: row.get("text_url"),
        view_url: row.get("view_url"),
    }
}

fn tag_from_row(row: &SqliteRow) -> Tag {
    Tag {
        id: TagId::new(row.get("id")),
        document_set_id: DocumentSetId::new(row.get("document_set_id")),
        name: row.get("name"),
    }
}

fn node_from_row(row: &SqliteRow) -> Node {
    let parent_id: Option<i64> = row.get("parent_id");
    Node {
        id: NodeId::new(row.get("id")),
        parent_id: parent_id.map(NodeId::new),
        description: row.get("description"),
    }
}

fn tree_from_row(row: &SqliteRow) -> Tree {
    Tree {
        id: TreeId::new(row.get("id")),
        document_set_id: DocumentSetId::new(row.get("document_set_id")),
        root_id: NodeId::new(row.get("root_id")),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.get("state");
    let attempts: i64 = row.get("attempts");
    let initial: Option<i64> = row.get("initial_document_id");
    Ok(Job {
        id: JobId::new(row.get("id")),
        query: row.get("query"),
        document_set_id: DocumentSetId::new(row.get("document_set_id")),
        state: state.parse::<JobState>()?,
        attempts: u32::try_from(attempts).context("job attempts out of range")?,
        last_error: row.get("last_error"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        initial_document_id: initial.map(DocumentId::new),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl NodeLoader for SqliteStore {
    async fn load_node(&self, id: NodeId) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT id, parent_id, description FROM nodes WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(node_from_row))
    }

    async fn load_children(&self, id: NodeId) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT id, parent_id, description FROM nodes WHERE parent_id = ? ORDER BY id ASC",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    async fn load_node_documents(&self, id: NodeId) -> Result<Vec<DocumentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT document_id FROM node_documents WHERE node_id = ? ORDER BY document_id ASC",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(DocumentId::new).collect())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_document_set(&self, query: &str) -> Result<DocumentSet> {
        let created_at = unix_now();
        let result = sqlx::query("INSERT INTO document_sets (query, created_at) VALUES (?, ?)")
            .bind(query)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(DocumentSet {
            id: DocumentSetId::new(result.last_insert_rowid()),
            query: query.to_string(),
            created_at,
        })
    }

    async fn get_document_set(&self, id: DocumentSetId) -> Result<Option<DocumentSet>> {
        let row = sqlx::query("SELECT id, query, created_at FROM document_sets WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(set_from_row))
    }

    async fn list_document_sets(&self) -> Result<Vec<DocumentSet>> {
        let rows = sqlx::query("SELECT id, query, created_at FROM document_sets ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(set_from_row).collect())
    }

    async fn delete_document_set(&self, id: DocumentSetId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM document_sets WHERE id = ?")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::debug!(set = %id, "deleted document set");
        }
        Ok(deleted)
    }

    async fn add_document(
        &self,
        document_set_id: DocumentSetId,
        doc: &NewDocument,
    ) -> Result<AddedDocument> {
        if doc.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("document title must not be empty".into()).into());
        }
        self.require_set(document_set_id).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (document_set_id, external_id, title, text_url, view_url)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_set_id, external_id) DO NOTHING
            "#,
        )
        .bind(document_set_id.get())
        .bind(&doc.external_id)
        .bind(&doc.title)
        .bind(&doc.text_url)
        .bind(&doc.view_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if let Some(external_id) = &doc.external_id {
                if let Some(document) = self.document_by_external_id(document_set_id, external_id).await? {
                    return Ok(AddedDocument {
                        document,
                        created: false,
                    });
                }
            }
            anyhow::bail!("document insert into set {} was ignored", document_set_id);
        }

        Ok(AddedDocument {
            document: Document {
                id: DocumentId::new(result.last_insert_rowid()),
                document_set_id,
                external_id: doc.external_id.clone(),
                title: doc.title.clone(),
                text_url: doc.text_url.clone(),
                view_url: doc.view_url.clone(),
            },
            created: true,
        })
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, document_set_id, external_id, title, text_url, view_url \
             FROM documents WHERE id = ?",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(document_from_row))
    }

    async fn list_documents(&self, document_set_id: DocumentSetId) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, document_set_id, external_id, title, text_url, view_url \
             FROM documents WHERE document_set_id = ? ORDER BY id ASC",
        )
        .bind(document_set_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn get_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, document_set_id, external_id, title, text_url, view_url \
             FROM documents WHERE id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.get());
        }
        separated.push_unseparated(") ORDER BY id ASC");
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(document_from_row).collect())
    }

    async fn list_tags(&self, document_set_id: DocumentSetId) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT id, document_set_id, name FROM tags WHERE document_set_id = ? ORDER BY id ASC",
        )
        .bind(document_set_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tag_from_row).collect())
    }

    async fn insert_tag(&self, document_set_id: DocumentSetId, name: &str) -> Result<Tag> {
        self.require_set(document_set_id).await?;
        let result = sqlx::query("INSERT INTO tags (document_set_id, name) VALUES (?, ?)")
            .bind(document_set_id.get())
            .bind(name)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => Ok(Tag {
                id: TagId::new(done.last_insert_rowid()),
                document_set_id,
                name: name.to_string(),
            }),
            Err(e) if is_unique_violation(&e) => Err(CoreError::DuplicateTagViolation {
                document_set_id,
                name: name.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_document_tags(
        &self,
        document_id: DocumentId,
        tag_ids: &[TagId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let set_id: Option<i64> =
            sqlx::query_scalar("SELECT document_set_id FROM documents WHERE id = ?")
                .bind(document_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        let set_id = set_id.ok_or_else(|| CoreError::NotFound(format!("document {}", document_id)))?;

        for tag_id in tag_ids {
            let owner: Option<i64> =
                sqlx::query_scalar("SELECT document_set_id FROM tags WHERE id = ?")
                    .bind(tag_id.get())
                    .fetch_optional(&mut *tx)
                    .await?;
            match owner {
                Some(owner) if owner == set_id => {}
                Some(_) => {
                    return Err(CoreError::InvalidInput(format!(
                        "tag {} does not belong to document set {}",
                        tag_id, set_id
                    ))
                    .into())
                }
                None => return Err(CoreError::NotFound(format!("tag {}", tag_id)).into()),
            }
        }

        sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
            .bind(document_id.get())
            .execute(&mut *tx)
            .await?;
        for tag_id in tag_ids {
            sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag_id) VALUES (?, ?)")
                .bind(document_id.get())
                .bind(tag_id.get())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn document_tags(&self, document_id: DocumentId) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.document_set_id, t.name
            FROM tags t
            JOIN document_tags dt ON dt.tag_id = t.id
            WHERE dt.document_id = ?
            ORDER BY t.id ASC
            "#,
        )
        .bind(document_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tag_from_row).collect())
    }

    async fn tag_documents(&self, tag_id: TagId) -> Result<Vec<DocumentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT document_id FROM document_tags WHERE tag_id = ? ORDER BY document_id ASC",
        )
        .bind(tag_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(DocumentId::new).collect())
    }

    async fn save_tree(&self, document_set_id: DocumentSetId, arena: &NodeArena) -> Result<Tree> {
        let order = arena.topological()?;
        let reached: BTreeSet<DocumentId> = order
            .iter()
            .flat_map(|local| arena.documents(*local))
            .collect();

        let mut tx = self.pool.begin().await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_sets WHERE id = ?")
            .bind(document_set_id.get())
            .fetch_one(&mut *tx)
            .await?;
        if count == 0 {
            return Err(CoreError::NotFound(format!("document set {}", document_set_id)).into());
        }

        for doc in &reached {
            let owner: Option<i64> =
                sqlx::query_scalar("SELECT document_set_id FROM documents WHERE id = ?")
                    .bind(doc.get())
                    .fetch_optional(&mut *tx)
                    .await?;
            if owner != Some(document_set_id.get()) {
                return Err(CoreError::InvalidInput(format!(
                    "document {} is not part of document set {}",
                    doc, document_set_id
                ))
                .into());
            }
        }

        sqlx::query("DELETE FROM trees WHERE document_set_id = ?")
            .bind(document_set_id.get())
            .execute(&mut *tx)
            .await?;

        let tree_id = sqlx::query("INSERT INTO trees (document_set_id, root_id) VALUES (?, 0)")
            .bind(document_set_id.get())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let mut assigned: BTreeMap<NodeId, i64> = BTreeMap::new();
        for &local in &order {
            let Some(source) = arena.node(local) else {
                continue;
            };
            let parent = source.parent_id.and_then(|p| assigned.get(&p).copied());
            let id = sqlx::query("INSERT INTO nodes (tree_id, parent_id, description) VALUES (?, ?, ?)")
                .bind(tree_id)
                .bind(parent)
                .bind(&source.description)
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();
            assigned.insert(local, id);

            for doc in arena.documents(local) {
                sqlx::query("INSERT INTO node_documents (node_id, document_id) VALUES (?, ?)")
                    .bind(id)
                    .bind(doc.get())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for doc in &reached {
            sqlx::query("INSERT INTO tree_documents (tree_id, document_id) VALUES (?, ?)")
                .bind(tree_id)
                .bind(doc.get())
                .execute(&mut *tx)
                .await?;
        }

        let root_id = order
            .first()
            .and_then(|root| assigned.get(root))
            .copied()
            .ok_or_else(|| CoreError::InvalidTreeOperation("tree has no nodes".into()))?;
        sqlx::query("UPDATE trees SET root_id = ? WHERE id = ?")
            .bind(root_id)
            .bind(tree_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Tree {
            id: TreeId::new(tree_id),
            document_set_id,
            root_id: NodeId::new(root_id),
        })
    }

    async fn get_tree(&self, id: TreeId) -> Result<Option<Tree>> {
        let row = sqlx::query("SELECT id, document_set_id, root_id FROM trees WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tree_from_row))
    }

    async fn tree_for_set(&self, document_set_id: DocumentSetId) -> Result<Option<Tree>> {
        let row =
            sqlx::query("SELECT id, document_set_id, root_id FROM trees WHERE document_set_id = ?")
                .bind(document_set_id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.as_ref().map(tree_from_row))
    }

    async fn tree_documents(&self, tree_id: TreeId) -> Result<Vec<DocumentId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT document_id FROM tree_documents WHERE tree_id = ? ORDER BY document_id ASC",
        )
        .bind(tree_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(DocumentId::new).collect())
    }

    async fn create_document_set_job(&self, query: &str) -> Result<Job> {
        let now = unix_now();
        let mut tx = self.pool.begin().await?;

        let set_id = sqlx::query("INSERT INTO document_sets (query, created_at) VALUES (?, ?)")
            .bind(query)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let job_id = sqlx::query(
            r#"
            INSERT INTO jobs (query, document_set_id, state, attempts, created_at, updated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(query)
        .bind(set_id)
        .bind(JobState::Submitted.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(Job {
            id: JobId::new(job_id),
            query: query.to_string(),
            document_set_id: DocumentSetId::new(set_id),
            state: JobState::Submitted,
            attempts: 0,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            initial_document_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {} FROM jobs ORDER BY id ASC", JOB_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn job_for_document_set(&self, document_set_id: DocumentSetId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE document_set_id = ? ORDER BY id DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_set_id.get())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_job(
        &self,
        id: JobId,
        worker: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<Option<Job>> {
        let result = sqlx::query(&format!(
            "UPDATE jobs SET claimed_by = ?, claimed_at = ?, updated_at = ? WHERE id = ? AND {}",
            CLAIMABLE
        ))
        .bind(worker)
        .bind(now)
        .bind(now)
        .bind(id.get())
        .bind(now - lease_secs)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    async fn claim_next_job(
        &self,
        worker: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<Option<Job>> {
        let cutoff = now - lease_secs;
        let claimed: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE jobs SET claimed_by = ?, claimed_at = ?, updated_at = ?
            WHERE id = (SELECT id FROM jobs WHERE {} ORDER BY id ASC LIMIT 1)
              AND {}
            RETURNING id
            "#,
            CLAIMABLE, CLAIMABLE
        ))
        .bind(worker)
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(id) => self.get_job(JobId::new(id)).await,
            None => Ok(None),
        }
    }

    async fn renew_lease(&self, id: JobId, worker: &str, now: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET claimed_at = ? \
             WHERE id = ? AND claimed_by = ? AND state IN ('submitted', 'in_progress')",
        )
        .bind(now)
        .bind(id.get())
        .bind(worker)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_miss(id, worker).await);
        }
        Ok(())
    }

    async fn update_claimed_job(&self, job: &Job, worker: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "{} WHERE id = ? AND claimed_by = ? AND state != 'complete'",
            UPDATE_JOB
        ))
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(&job.last_error)
        .bind(&job.claimed_by)
        .bind(job.claimed_at)
        .bind(job.initial_document_id.map(|d| d.get()))
        .bind(job.updated_at)
        .bind(job.id.get())
        .bind(worker)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_miss(job.id, worker).await);
        }
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(&format!("{} WHERE id = ?", UPDATE_JOB))
            .bind(job.state.as_str())
            .bind(i64::from(job.attempts))
            .bind(&job.last_error)
            .bind(&job.claimed_by)
            .bind(job.claimed_at)
            .bind(job.initial_document_id.map(|d| d.get()))
            .bind(job.updated_at)
            .bind(job.id.get())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {}", job.id)).into());
        }
        Ok(())
    }

    async fn record_item_error(&self, job_id: JobId, error: &ItemError) -> Result<()> {
        sqlx::query("INSERT INTO job_item_errors (job_id, reference_id, message) VALUES (?, ?, ?)")
            .bind(job_id.get())
            .bind(&error.reference_id)
            .bind(&error.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn job_item_errors(&self, job_id: JobId) -> Result<Vec<ItemError>> {
        let rows = sqlx::query(
            "SELECT reference_id, message FROM job_item_errors WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(job_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ItemError {
                reference_id: r.get("reference_id"),
                message: r.get("message"),
            })
            .collect())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO log_entries (document_set_id, date, component, action, details) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.document_set_id.get())
        .bind(entry.date)
        .bind(&entry.component)
        .bind(&entry.action)
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_entries(&self, document_set_id: DocumentSetId) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT document_set_id, date, component, action, details FROM log_entries \
             WHERE document_set_id = ? ORDER BY id ASC",
        )
        .bind(document_set_id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| LogEntry {
                document_set_id: DocumentSetId::new(r.get("document_set_id")),
                date: r.get("date"),
                component: r.get("component"),
                action: r.get("action"),
                details: r.get("details"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use docset_core::error::core_error;
    use docset_core::tree::breadth_first;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}", tmp.path().join("t.sqlite").display()))
                .unwrap()
                .create_if_missing(true)
                .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    #[tokio::test]
    async fn duplicate_tag_maps_to_core_error() {
        let (_tmp, store) = store().await;
        let set = store.create_document_set("q").await.unwrap();
        store.insert_tag(set.id, "foo").await.unwrap();
        let err = store.insert_tag(set.id, "foo").await.unwrap_err();
        assert!(matches!(
            core_error(&err),
            Some(CoreError::DuplicateTagViolation { .. })
        ));
    }

    #[tokio::test]
    async fn external_id_makes_add_idempotent() {
        let (_tmp, store) = store().await;
        let set = store.create_document_set("q").await.unwrap();
        let doc = NewDocument::new("Title", "t", "v").with_external_id("dc-1");

        let first = store.add_document(set.id, &doc).await.unwrap();
        let second = store.add_document(set.id, &doc).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.document, second.document);

        // Documents without an external id never collide.
        store.add_document(set.id, &NewDocument::new("a", "t", "v")).await.unwrap();
        store.add_document(set.id, &NewDocument::new("a", "t", "v")).await.unwrap();
        assert_eq!(store.list_documents(set.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cascade_delete_clears_owned_rows() {
        let (_tmp, store) = store().await;
        let job = store.create_document_set_job("q").await.unwrap();
        let set_id = job.document_set_id;
        let doc = store
            .add_document(set_id, &NewDocument::new("t", "x", "y"))
            .await
            .unwrap()
            .document;
        let tag = store.insert_tag(set_id, "foo").await.unwrap();
        store.replace_document_tags(doc.id, &[tag.id]).await.unwrap();

        let mut arena = NodeArena::new();
        let root = arena.add_node("root");
        let child = arena.add_node("child");
        arena.add_child(root, child).unwrap();
        arena.add_document(root, doc.id).unwrap();
        arena.add_document(child, doc.id).unwrap();
        let tree = store.save_tree(set_id, &arena).await.unwrap();
        store
            .append_log(&LogEntry {
                document_set_id: set_id,
                date: 1,
                component: "test".into(),
                action: "x".into(),
                details: None,
            })
            .await
            .unwrap();

        assert!(store.delete_document_set(set_id).await.unwrap());

        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(store.pool())
            .await
            .unwrap();
        let memberships: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_tags")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(nodes, 0);
        assert_eq!(memberships, 0);
        assert!(store.get_document(doc.id).await.unwrap().is_none());
        assert!(store.list_tags(set_id).await.unwrap().is_empty());
        assert!(store.get_tree(tree.id).await.unwrap().is_none());
        assert!(store.log_entries(set_id).await.unwrap().is_empty());
        assert!(store.get_job(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn saved_tree_keeps_child_order() {
        let (_tmp, store) = store().await;
        let set = store.create_document_set("q").await.unwrap();
        let mut arena = NodeArena::new();
        let root = arena.add_node("root");
        for name in ["a", "b", "c"] {
            let child = arena.add_node(name);
            arena.add_child(root, child).unwrap();
        }
        let tree = store.save_tree(set.id, &arena).await.unwrap();

        let children = store.load_children(tree.root_id).await.unwrap();
        let names: Vec<_> = children.iter().map(|n| n.description.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(children.iter().all(|n| n.parent_id == Some(tree.root_id)));
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let (_tmp, store) = store().await;
        let job = store.create_document_set_job("q").await.unwrap();

        let a = store.claim_job(job.id, "a", 1000, 60).await.unwrap();
        assert_eq!(a.unwrap().claimed_by.as_deref(), Some("a"));
        assert!(store.claim_job(job.id, "b", 1030, 60).await.unwrap().is_none());
        assert!(store.claim_next_job("b", 1030, 60).await.unwrap().is_none());

        let c = store.claim_next_job("c", 1060, 60).await.unwrap().unwrap();
        assert_eq!(c.claimed_by.as_deref(), Some("c"));
        assert_eq!(c.claimed_at, Some(1060));
    }

    #[tokio::test]
    async fn job_round_trips_every_field() {
        let (_tmp, store) = store().await;
        let mut job = store.create_document_set_job("q").await.unwrap();
        job.state = JobState::Failed;
        job.attempts = 3;
        job.last_error = Some("timeout".into());
        job.initial_document_id = Some(DocumentId::new(4));
        job.updated_at = 99;
        store.update_job(&job).await.unwrap();

        assert_eq!(store.get_job(job.id).await.unwrap().unwrap(), job);
        assert_eq!(
            store.job_for_document_set(job.document_set_id).await.unwrap(),
            Some(job)
        );
    }

    /// Each node with its parent's description, in traversal order.
    fn shape(nodes: &[Node]) -> Vec<(String, Option<String>)> {
        nodes
            .iter()
            .map(|n| {
                let parent = n
                    .parent_id
                    .and_then(|p| nodes.iter().find(|m| m.id == p))
                    .map(|m| m.description.clone());
                (n.description.clone(), parent)
            })
            .collect()
    }

    #[tokio::test]
    async fn saved_tree_loads_lazily_like_the_arena() {
        let (_tmp, store) = store().await;
        let set = store.create_document_set("q").await.unwrap();
        let mut arena = NodeArena::new();
        let root = arena.add_node("root");
        for i in 0..3 {
            let level1 = arena.add_node(&format!("l1-{}", i));
            arena.add_child(root, level1).unwrap();
            for j in 0..4 {
                let level2 = arena.add_node(&format!("l2-{}-{}", i, j));
                arena.add_child(level1, level2).unwrap();
            }
        }
        let tree = store.save_tree(set.id, &arena).await.unwrap();

        for (bound, expected) in [(4, 4), (9, 9), (26, 16)] {
            let in_memory = breadth_first(&arena, root, bound).await.unwrap();
            let loaded = breadth_first(&store, tree.root_id, bound).await.unwrap();
            assert_eq!(loaded.len(), expected);
            assert_eq!(loaded[0].id, tree.root_id);
            assert_eq!(shape(&loaded), shape(&in_memory));
        }
    }

    #[tokio::test]
    async fn job_writes_require_the_current_lease() {
        let (_tmp, store) = store().await;
        let job = store.create_document_set_job("q").await.unwrap();
        let mut a = store.claim_job(job.id, "a", 1000, 60).await.unwrap().unwrap();
        store.renew_lease(job.id, "a", 1050).await.unwrap();
        assert!(store.claim_job(job.id, "b", 1100, 60).await.unwrap().is_none());

        let b = store.claim_job(job.id, "b", 1110, 60).await.unwrap().unwrap();
        a.start(1111).unwrap();
        let err = store.update_claimed_job(&a, "a").await.unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::LeaseLost { .. })));
        let err = store.renew_lease(job.id, "a", 1112).await.unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::LeaseLost { .. })));
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap(), b);

        let mut done = b.clone();
        done.start(1120).unwrap();
        done.complete(None, 1121).unwrap();
        store.update_claimed_job(&done, "b").await.unwrap();
        // Complete is final even for the worker that finished it.
        let mut again = done.clone();
        again.state = JobState::Submitted;
        let err = store.update_claimed_job(&again, "b").await.unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::LeaseLost { .. })));
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().state, JobState::Complete);
    }
}
