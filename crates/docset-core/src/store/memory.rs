//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All state lives in one [`Catalog`] behind a `std::sync::RwLock`. Every
//! operation takes the lock once, so multi-entity writes (cascade delete,
//! tree replacement, job claims) are atomic with respect to each other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::error::CoreError;
use crate::ids::{DocumentId, DocumentSetId, JobId, NodeId, TagId, TreeId};
use crate::job::{Job, JobState};
use crate::models::{
    AddedDocument, Document, DocumentSet, ItemError, LogEntry, NewDocument, Node, Tag, Tree,
};
use crate::relation::Relation;
use crate::tree::{NodeArena, NodeLoader};

use super::{unix_now, Store};

#[derive(Default)]
struct Sequences {
    document_set: i64,
    document: i64,
    tag: i64,
    tree: i64,
    node: i64,
    job: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

struct StoredNode {
    node: Node,
    tree: TreeId,
    children: Vec<NodeId>,
}

#[derive(Default)]
struct Catalog {
    seq: Sequences,
    sets: BTreeMap<DocumentSetId, DocumentSet>,
    documents: BTreeMap<DocumentId, Document>,
    tags: BTreeMap<TagId, Tag>,
    document_tags: Relation<DocumentId, TagId>,
    trees: BTreeMap<TreeId, Tree>,
    nodes: BTreeMap<NodeId, StoredNode>,
    node_documents: Relation<NodeId, DocumentId>,
    tree_documents: Relation<TreeId, DocumentId>,
    jobs: BTreeMap<JobId, Job>,
    item_errors: BTreeMap<JobId, Vec<ItemError>>,
    logs: Vec<LogEntry>,
}

impl Catalog {
    fn insert_set(&mut self, query: &str) -> DocumentSet {
        let set = DocumentSet {
            id: DocumentSetId::new(next(&mut self.seq.document_set)),
            query: query.to_string(),
            created_at: unix_now(),
        };
        self.sets.insert(set.id, set.clone());
        set
    }

    fn remove_tree(&mut self, tree_id: TreeId) {
        self.trees.remove(&tree_id);
        self.tree_documents.remove_left(tree_id);
        let node_ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.tree == tree_id)
            .map(|(id, _)| *id)
            .collect();
        for id in node_ids {
            self.nodes.remove(&id);
            self.node_documents.remove_left(id);
        }
    }

    fn tree_of_set(&self, document_set_id: DocumentSetId) -> Option<&Tree> {
        self.trees
            .values()
            .find(|t| t.document_set_id == document_set_id)
    }

    fn claim(&mut self, id: JobId, worker: &str, now: i64, lease_secs: i64) -> Option<Job> {
        let job = self.jobs.get_mut(&id)?;
        if !job.state.is_claimable() || job.has_live_lease(now, lease_secs) {
            return None;
        }
        job.claimed_by = Some(worker.to_string());
        job.claimed_at = Some(now);
        job.updated_at = now;
        Some(job.clone())
    }
}

fn lease_lost(job: JobId, worker: &str) -> anyhow::Error {
    CoreError::LeaseLost {
        job,
        worker: worker.to_string(),
    }
    .into()
}

/// In-memory store.
pub struct InMemoryStore {
    catalog: RwLock<Catalog>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Catalog>> {
        self.catalog
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Catalog>> {
        self.catalog
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeLoader for InMemoryStore {
    async fn load_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.get(&id).map(|n| n.node.clone()))
    }

    async fn load_children(&self, id: NodeId) -> Result<Vec<Node>> {
        let catalog = self.read()?;
        let mut children: Vec<Node> = catalog
            .nodes
            .get(&id)
            .map(|n| {
                n.children
                    .iter()
                    .filter_map(|c| catalog.nodes.get(c).map(|s| s.node.clone()))
                    .collect()
            })
            .unwrap_or_default();
        children.sort_by_key(|n| n.id);
        Ok(children)
    }

    async fn load_node_documents(&self, id: NodeId) -> Result<Vec<DocumentId>> {
        Ok(self.read()?.node_documents.right_of(id))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_document_set(&self, query: &str) -> Result<DocumentSet> {
        Ok(self.write()?.insert_set(query))
    }

    async fn get_document_set(&self, id: DocumentSetId) -> Result<Option<DocumentSet>> {
        Ok(self.read()?.sets.get(&id).cloned())
    }

    async fn list_document_sets(&self) -> Result<Vec<DocumentSet>> {
        Ok(self.read()?.sets.values().cloned().collect())
    }

    async fn delete_document_set(&self, id: DocumentSetId) -> Result<bool> {
        let mut catalog = self.write()?;
        if catalog.sets.remove(&id).is_none() {
            return Ok(false);
        }

        let tree_ids: Vec<TreeId> = catalog
            .trees
            .values()
            .filter(|t| t.document_set_id == id)
            .map(|t| t.id)
            .collect();
        for tree_id in tree_ids {
            catalog.remove_tree(tree_id);
        }

        let doc_ids: Vec<DocumentId> = catalog
            .documents
            .values()
            .filter(|d| d.document_set_id == id)
            .map(|d| d.id)
            .collect();
        for doc_id in doc_ids {
            catalog.documents.remove(&doc_id);
            catalog.document_tags.remove_left(doc_id);
            catalog.node_documents.remove_right(doc_id);
        }

        let tag_ids: Vec<TagId> = catalog
            .tags
            .values()
            .filter(|t| t.document_set_id == id)
            .map(|t| t.id)
            .collect();
        for tag_id in tag_ids {
            catalog.tags.remove(&tag_id);
            catalog.document_tags.remove_right(tag_id);
        }

        catalog.logs.retain(|e| e.document_set_id != id);
        tracing::debug!(set = %id, "deleted document set");
        Ok(true)
    }

    async fn add_document(
        &self,
        document_set_id: DocumentSetId,
        doc: &NewDocument,
    ) -> Result<AddedDocument> {
        if doc.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("document title must not be empty".into()).into());
        }
        let mut catalog = self.write()?;
        if !catalog.sets.contains_key(&document_set_id) {
            return Err(CoreError::NotFound(format!("document set {}", document_set_id)).into());
        }

        if let Some(external_id) = &doc.external_id {
            let existing = catalog.documents.values().find(|d| {
                d.document_set_id == document_set_id && d.external_id.as_ref() == Some(external_id)
            });
            if let Some(document) = existing {
                return Ok(AddedDocument {
                    document: document.clone(),
                    created: false,
                });
            }
        }

        let document = Document {
            id: DocumentId::new(next(&mut catalog.seq.document)),
            document_set_id,
            external_id: doc.external_id.clone(),
            title: doc.title.clone(),
            text_url: doc.text_url.clone(),
            view_url: doc.view_url.clone(),
        };
        catalog.documents.insert(document.id, document.clone());
        Ok(AddedDocument {
            document,
            created: true,
        })
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    async fn list_documents(&self, document_set_id: DocumentSetId) -> Result<Vec<Document>> {
        Ok(self
            .read()?
            .documents
            .values()
            .filter(|d| d.document_set_id == document_set_id)
            .cloned()
            .collect())
    }

    async fn get_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>> {
        let catalog = self.read()?;
        let wanted: BTreeSet<DocumentId> = ids.iter().copied().collect();
        Ok(wanted
            .into_iter()
            .filter_map(|id| catalog.documents.get(&id).cloned())
            .collect())
    }

    async fn list_tags(&self, document_set_id: DocumentSetId) -> Result<Vec<Tag>> {
        Ok(self
            .read()?
            .tags
            .values()
            .filter(|t| t.document_set_id == document_set_id)
            .cloned()
            .collect())
    }

    async fn insert_tag(&self, document_set_id: DocumentSetId, name: &str) -> Result<Tag> {
        let mut catalog = self.write()?;
        if !catalog.sets.contains_key(&document_set_id) {
            return Err(CoreError::NotFound(format!("document set {}", document_set_id)).into());
        }
        let taken = catalog
            .tags
            .values()
            .any(|t| t.document_set_id == document_set_id && t.name == name);
        if taken {
            return Err(CoreError::DuplicateTagViolation {
                document_set_id,
                name: name.to_string(),
            }
            .into());
        }
        let tag = Tag {
            id: TagId::new(next(&mut catalog.seq.tag)),
            document_set_id,
            name: name.to_string(),
        };
        catalog.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn replace_document_tags(
        &self,
        document_id: DocumentId,
        tag_ids: &[TagId],
    ) -> Result<()> {
        let mut catalog = self.write()?;
        let set_id = catalog
            .documents
            .get(&document_id)
            .map(|d| d.document_set_id)
            .ok_or_else(|| CoreError::NotFound(format!("document {}", document_id)))?;
        for tag_id in tag_ids {
            match catalog.tags.get(tag_id) {
                Some(tag) if tag.document_set_id == set_id => {}
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
        catalog
            .document_tags
            .replace_right_of(document_id, tag_ids.iter().copied());
        Ok(())
    }

    async fn document_tags(&self, document_id: DocumentId) -> Result<Vec<Tag>> {
        let catalog = self.read()?;
        Ok(catalog
            .document_tags
            .right_of(document_id)
            .into_iter()
            .filter_map(|id| catalog.tags.get(&id).cloned())
            .collect())
    }

    async fn tag_documents(&self, tag_id: TagId) -> Result<Vec<DocumentId>> {
        Ok(self.read()?.document_tags.left_of(tag_id))
    }

    async fn save_tree(&self, document_set_id: DocumentSetId, arena: &NodeArena) -> Result<Tree> {
        let order = arena.topological()?;
        let mut catalog = self.write()?;
        if !catalog.sets.contains_key(&document_set_id) {
            return Err(CoreError::NotFound(format!("document set {}", document_set_id)).into());
        }

        let mut reached = BTreeSet::new();
        for &local in &order {
            for doc in arena.documents(local) {
                match catalog.documents.get(&doc) {
                    Some(d) if d.document_set_id == document_set_id => {
                        reached.insert(doc);
                    }
                    _ => {
                        return Err(CoreError::InvalidInput(format!(
                            "document {} is not part of document set {}",
                            doc, document_set_id
                        ))
                        .into())
                    }
                }
            }
        }

        if let Some(old) = catalog.tree_of_set(document_set_id).map(|t| t.id) {
            catalog.remove_tree(old);
        }

        let tree_id = TreeId::new(next(&mut catalog.seq.tree));
        let mut assigned: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        for &local in &order {
            let id = NodeId::new(next(&mut catalog.seq.node));
            assigned.insert(local, id);
            let Some(source) = arena.node(local) else {
                continue;
            };
            let parent_id = source.parent_id.and_then(|p| assigned.get(&p).copied());
            if let Some(parent) = parent_id.and_then(|p| catalog.nodes.get_mut(&p)) {
                parent.children.push(id);
            }
            catalog.nodes.insert(
                id,
                StoredNode {
                    node: Node {
                        id,
                        parent_id,
                        description: source.description,
                    },
                    tree: tree_id,
                    children: Vec::new(),
                },
            );
            for doc in arena.documents(local) {
                catalog.node_documents.insert(id, doc);
            }
        }

        let root_id = assigned
            .get(&order[0])
            .copied()
            .ok_or_else(|| CoreError::InvalidTreeOperation("tree has no nodes".into()))?;
        let tree = Tree {
            id: tree_id,
            document_set_id,
            root_id,
        };
        catalog.trees.insert(tree_id, tree.clone());
        catalog.tree_documents.replace_right_of(tree_id, reached);
        Ok(tree)
    }

    async fn get_tree(&self, id: TreeId) -> Result<Option<Tree>> {
        Ok(self.read()?.trees.get(&id).cloned())
    }

    async fn tree_for_set(&self, document_set_id: DocumentSetId) -> Result<Option<Tree>> {
        Ok(self.read()?.tree_of_set(document_set_id).cloned())
    }

    async fn tree_documents(&self, tree_id: TreeId) -> Result<Vec<DocumentId>> {
        Ok(self.read()?.tree_documents.right_of(tree_id))
    }

    async fn create_document_set_job(&self, query: &str) -> Result<Job> {
        let mut catalog = self.write()?;
        let set = catalog.insert_set(query);
        let job = Job {
            id: JobId::new(next(&mut catalog.seq.job)),
            query: query.to_string(),
            document_set_id: set.id,
            state: JobState::Submitted,
            attempts: 0,
            last_error: None,
            claimed_by: None,
            claimed_at: None,
            initial_document_id: None,
            created_at: set.created_at,
            updated_at: set.created_at,
        };
        catalog.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.read()?.jobs.values().cloned().collect())
    }

    async fn job_for_document_set(&self, document_set_id: DocumentSetId) -> Result<Option<Job>> {
        Ok(self
            .read()?
            .jobs
            .values()
            .rev()
            .find(|j| j.document_set_id == document_set_id)
            .cloned())
    }

    async fn claim_job(
        &self,
        id: JobId,
        worker: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<Option<Job>> {
        Ok(self.write()?.claim(id, worker, now, lease_secs))
    }

    async fn claim_next_job(
        &self,
        worker: &str,
        now: i64,
        lease_secs: i64,
    ) -> Result<Option<Job>> {
        let mut catalog = self.write()?;
        let candidate = catalog
            .jobs
            .values()
            .find(|j| j.state.is_claimable() && !j.has_live_lease(now, lease_secs))
            .map(|j| j.id);
        Ok(candidate.and_then(|id| catalog.claim(id, worker, now, lease_secs)))
    }

    async fn renew_lease(&self, id: JobId, worker: &str, now: i64) -> Result<()> {
        let mut catalog = self.write()?;
        match catalog.jobs.get_mut(&id) {
            Some(stored)
                if stored.state.is_claimable() && stored.claimed_by.as_deref() == Some(worker) =>
            {
                stored.claimed_at = Some(now);
                Ok(())
            }
            Some(_) => Err(lease_lost(id, worker)),
            None => Err(CoreError::NotFound(format!("job {}", id)).into()),
        }
    }

    async fn update_claimed_job(&self, job: &Job, worker: &str) -> Result<()> {
        let mut catalog = self.write()?;
        match catalog.jobs.get_mut(&job.id) {
            Some(stored)
                if stored.state != JobState::Complete
                    && stored.claimed_by.as_deref() == Some(worker) =>
            {
                *stored = job.clone();
                Ok(())
            }
            Some(_) => Err(lease_lost(job.id, worker)),
            None => Err(CoreError::NotFound(format!("job {}", job.id)).into()),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut catalog = self.write()?;
        match catalog.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("job {}", job.id)).into()),
        }
    }

    async fn record_item_error(&self, job_id: JobId, error: &ItemError) -> Result<()> {
        self.write()?
            .item_errors
            .entry(job_id)
            .or_default()
            .push(error.clone());
        Ok(())
    }

    async fn job_item_errors(&self, job_id: JobId) -> Result<Vec<ItemError>> {
        Ok(self
            .read()?
            .item_errors
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.write()?.logs.push(entry.clone());
        Ok(())
    }

    async fn log_entries(&self, document_set_id: DocumentSetId) -> Result<Vec<LogEntry>> {
        Ok(self
            .read()?
            .logs
            .iter()
            .filter(|e| e.document_set_id == document_set_id)
            .cloned()
            .collect())
    }
}
