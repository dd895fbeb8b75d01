//! Filtered, paginated views over a cluster tree.
//!
//! A [`Selection`] combines three optional filters, each a union of its
//! members, and intersects them:
//!
//! - **nodes**: documents reachable from any selected node (the node or a
//!   descendant). No nodes means the whole tree.
//! - **tags**: documents carrying any selected tag. No tags means no
//!   constraint.
//! - **documents**: only these documents. Empty means no constraint.
//!
//! Results are ordered by document id, so `slice(0, count)` is the full
//! result and consecutive slices never overlap.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{DocumentId, NodeId, TagId};
use crate::models::{Document, Tree};
use crate::store::Store;
use crate::tree::reachable_documents;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionFilter {
    #[serde(default)]
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub documents: Vec<DocumentId>,
    #[serde(default)]
    pub tags: Vec<TagId>,
}

impl SelectionFilter {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.documents.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    tree: Tree,
    filter: SelectionFilter,
}

impl Selection {
    pub fn new(tree: Tree, filter: SelectionFilter) -> Self {
        Self { tree, filter }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn filter(&self) -> &SelectionFilter {
        &self.filter
    }

    /// Ids of every matching document, ascending.
    pub async fn matching_documents<S: Store + ?Sized>(&self, store: &S) -> Result<Vec<DocumentId>> {
        let mut matched: BTreeSet<DocumentId> = if self.filter.nodes.is_empty() {
            store.tree_documents(self.tree.id).await?.into_iter().collect()
        } else {
            let mut reached = BTreeSet::new();
            for &node in &self.filter.nodes {
                self.ensure_in_tree(store, node).await?;
                reached.extend(reachable_documents(store, node).await?);
            }
            reached
        };

        if !self.filter.tags.is_empty() {
            let mut tagged = BTreeSet::new();
            for &tag in &self.filter.tags {
                tagged.extend(store.tag_documents(tag).await?);
            }
            matched.retain(|d| tagged.contains(d));
        }

        if !self.filter.documents.is_empty() {
            let wanted: BTreeSet<DocumentId> = self.filter.documents.iter().copied().collect();
            matched.retain(|d| wanted.contains(d));
        }

        Ok(matched.into_iter().collect())
    }

    /// Matching documents in `[start, end)`. Empty when `start >= end`.
    pub async fn slice<S: Store + ?Sized>(
        &self,
        store: &S,
        start: usize,
        end: usize,
    ) -> Result<Vec<Document>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let ids: Vec<DocumentId> = self
            .matching_documents(store)
            .await?
            .into_iter()
            .skip(start)
            .take(end - start)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        store.get_documents(&ids).await
    }

    pub async fn count<S: Store + ?Sized>(&self, store: &S) -> Result<usize> {
        Ok(self.matching_documents(store).await?.len())
    }

    async fn ensure_in_tree<S: Store + ?Sized>(&self, store: &S, node: NodeId) -> Result<()> {
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == self.tree.root_id {
                return Ok(());
            }
            cursor = store
                .load_node(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("node {}", id)))?
                .parent_id;
        }
        Err(CoreError::InvalidInput(format!("node {} is not in tree {}", node, self.tree.id)).into())
    }
}
