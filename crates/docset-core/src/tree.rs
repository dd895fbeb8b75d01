//! Cluster tree construction and traversal.
//!
//! A tree is built in memory as a [`NodeArena`], persisted through
//! [`Store::save_tree`](crate::store::Store::save_tree), and read back
//! lazily through a [`NodeLoader`]. Traversal never assumes children are
//! already materialized: every expansion asks the loader, so a node that
//! was evicted and reloaded yields the same result.
//!
//! # Breadth-first bound
//!
//! [`breadth_first`] returns at most `max_count` nodes in FIFO order. It
//! may stop in the middle of a level; callers that need whole levels must
//! ask for more and trim.

use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::CoreError;
use crate::ids::{DocumentId, NodeId};
use crate::models::Node;
use crate::relation::Relation;

/// Source of node data for traversal.
///
/// Implemented by every [`Store`](crate::store::Store) and by
/// [`NodeArena`], so the same traversal code runs against a freshly built
/// tree and a persisted one.
#[async_trait]
pub trait NodeLoader: Send + Sync {
    async fn load_node(&self, id: NodeId) -> Result<Option<Node>>;

    /// Children of `id`, ascending by node id.
    async fn load_children(&self, id: NodeId) -> Result<Vec<Node>>;

    /// Documents associated directly with `id`.
    async fn load_node_documents(&self, id: NodeId) -> Result<Vec<DocumentId>>;
}

/// Breadth-first expansion from `root`, bounded by `max_count`.
pub async fn breadth_first<L: NodeLoader + ?Sized>(
    loader: &L,
    root: NodeId,
    max_count: usize,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    if max_count == 0 {
        return Ok(nodes);
    }

    let root = loader
        .load_node(root)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("node {}", root)))?;

    let mut to_expand = VecDeque::from([root]);
    while let Some(node) = to_expand.pop_front() {
        let id = node.id;
        nodes.push(node);
        if nodes.len() >= max_count {
            break;
        }
        to_expand.extend(loader.load_children(id).await?);
    }

    Ok(nodes)
}

/// Every document associated with `root` or any of its descendants.
pub async fn reachable_documents<L: NodeLoader + ?Sized>(
    loader: &L,
    root: NodeId,
) -> Result<BTreeSet<DocumentId>> {
    if loader.load_node(root).await?.is_none() {
        return Err(CoreError::NotFound(format!("node {}", root)).into());
    }

    let mut documents = BTreeSet::new();
    let mut to_visit = vec![root];
    while let Some(id) = to_visit.pop() {
        documents.extend(loader.load_node_documents(id).await?);
        to_visit.extend(loader.load_children(id).await?.into_iter().map(|n| n.id));
    }
    Ok(documents)
}

#[derive(Debug, Clone)]
struct ArenaNode {
    description: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// An in-memory tree under construction.
///
/// Node ids are local to the arena (`1..=len`); the store assigns its own
/// ids when the arena is saved.
#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<ArenaNode>,
    documents: Relation<NodeId, DocumentId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a detached node and returns its arena id.
    pub fn add_node(&mut self, description: &str) -> NodeId {
        self.nodes.push(ArenaNode {
            description: description.to_string(),
            parent: None,
            children: Vec::new(),
        });
        NodeId::new(self.nodes.len() as i64)
    }

    fn slot(&self, id: NodeId) -> Result<&ArenaNode> {
        usize::try_from(id.get() - 1)
            .ok()
            .and_then(|i| self.nodes.get(i))
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)).into())
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut ArenaNode> {
        usize::try_from(id.get() - 1)
            .ok()
            .and_then(|i| self.nodes.get_mut(i))
            .ok_or_else(|| CoreError::NotFound(format!("node {}", id)).into())
    }

    /// Attaches `child` under `parent`.
    ///
    /// Re-attaching a child to the parent it already has is a no-op.
    /// Fails with [`CoreError::InvalidTreeOperation`] if `child` already
    /// has another parent or if `child` is `parent` or one of its ancestors.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.slot(parent)?;
        match self.slot(child)?.parent {
            Some(existing) if existing == parent => return Ok(()),
            Some(existing) => {
                return Err(CoreError::InvalidTreeOperation(format!(
                    "node {} already has parent {}; cannot attach it to {}",
                    child, existing, parent
                ))
                .into())
            }
            None => {}
        }

        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(CoreError::InvalidTreeOperation(format!(
                    "attaching node {} under {} would create a cycle",
                    child, parent
                ))
                .into());
            }
            cursor = self.slot(id)?.parent;
        }

        self.slot_mut(child)?.parent = Some(parent);
        self.slot_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Associates `document` with `node` (non-owning, both directions).
    pub fn add_document(&mut self, node: NodeId, document: DocumentId) -> Result<()> {
        self.slot(node)?;
        self.documents.insert(node, document);
        Ok(())
    }

    /// The single parentless node.
    ///
    /// Fails if the arena is empty or has more than one detached node.
    pub fn root(&self) -> Result<NodeId> {
        let roots: Vec<NodeId> = (1..=self.nodes.len())
            .map(|i| NodeId::new(i as i64))
            .filter(|id| self.nodes[(id.get() - 1) as usize].parent.is_none())
            .collect();
        match roots.as_slice() {
            [root] => Ok(*root),
            [] => Err(CoreError::InvalidTreeOperation("tree has no nodes".into()).into()),
            _ => Err(CoreError::InvalidTreeOperation(format!(
                "tree has {} detached nodes; expected exactly one root",
                roots.len()
            ))
            .into()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.slot(id).ok().map(|n| Node {
            id,
            parent_id: n.parent,
            description: n.description.clone(),
        })
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.slot(id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn documents(&self, id: NodeId) -> Vec<DocumentId> {
        self.documents.right_of(id)
    }

    /// Nodes that `document` is associated with.
    pub fn nodes_of(&self, document: DocumentId) -> Vec<NodeId> {
        self.documents.left_of(document)
    }

    /// Node ids in parent-before-child order, starting at the root.
    pub fn topological(&self) -> Result<Vec<NodeId>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.root()?]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            queue.extend(self.children(id));
        }
        Ok(order)
    }
}

#[async_trait]
impl NodeLoader for NodeArena {
    async fn load_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.node(id))
    }

    async fn load_children(&self, id: NodeId) -> Result<Vec<Node>> {
        Ok(self
            .children(id)
            .into_iter()
            .filter_map(|c| self.node(c))
            .collect())
    }

    async fn load_node_documents(&self, id: NodeId) -> Result<Vec<DocumentId>> {
        Ok(self.documents(id))
    }
}
