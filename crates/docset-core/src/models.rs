//! Core data models shared by every store and frontend.
//!
//! Timestamps are Unix seconds (`i64`), matching the SQLite schema.

use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, DocumentSetId, NodeId, TagId, TreeId};

/// A collection of documents produced by one search query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSet {
    pub id: DocumentSetId,
    pub query: String,
    pub created_at: i64,
}

/// A document owned by exactly one [`DocumentSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub document_set_id: DocumentSetId,
    /// Id of the search reference this document was built from.
    pub external_id: Option<String>,
    pub title: String,
    pub text_url: String,
    pub view_url: String,
}

/// Fields of a document that does not have an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub external_id: Option<String>,
    pub title: String,
    pub text_url: String,
    pub view_url: String,
}

impl NewDocument {
    pub fn new(title: &str, text_url: &str, view_url: &str) -> Self {
        Self {
            external_id: None,
            title: title.to_string(),
            text_url: text_url.to_string(),
            view_url: view_url.to_string(),
        }
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }
}

/// Result of [`Store::add_document`](crate::store::Store::add_document).
#[derive(Debug, Clone)]
pub struct AddedDocument {
    pub document: Document,
    /// `false` when a document with the same external id already existed.
    pub created: bool,
}

/// A label unique by name within its [`DocumentSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub document_set_id: DocumentSetId,
    pub name: String,
}

/// One cluster in a hierarchical grouping of documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub description: String,
}

/// Handle on the root [`Node`] of a document set's cluster tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    pub document_set_id: DocumentSetId,
    pub root_id: NodeId,
}

/// One record returned by the external search service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentReference {
    pub id: String,
    pub title: String,
    pub canonical_url: String,
    pub text_url: Option<String>,
    /// Comma-separated tag list attached upstream, if any.
    #[serde(default)]
    pub tags: Option<String>,
}

/// A per-reference failure recorded against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub reference_id: String,
    pub message: String,
}

/// Audit trail entry for a document set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub document_set_id: DocumentSetId,
    pub date: i64,
    pub component: String,
    pub action: String,
    pub details: Option<String>,
}

