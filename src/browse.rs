//! Paged browsing of a document set through its cluster tree.
//!
//! Used by `docset browse` / `docset nodes` and by
//! `GET /document-sets/{id}/documents` / `GET /trees/{id}/nodes`.

use anyhow::Result;
use serde::Serialize;

use docset_core::error::CoreError;
use docset_core::ids::{DocumentSetId, TreeId};
use docset_core::models::{Document, Node};
use docset_core::selection::{Selection, SelectionFilter};
use docset_core::store::Store;
use docset_core::tree::breadth_first;

use crate::config::{BrowseConfig, Config};
use crate::db;

/// One page of a filtered document set.
#[derive(Debug, Clone, Serialize)]
pub struct BrowsePage {
    pub document_set_id: DocumentSetId,
    pub tree_id: TreeId,
    /// Documents matching the filter, across all pages.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub documents: Vec<Document>,
}

/// Documents of `document_set_id` matching `filter`, starting at `offset`.
///
/// `limit` defaults to `browse.default_limit` and is clamped to
/// `browse.max_limit`. The set must have a tree.
pub async fn browse_document_set<S: Store + ?Sized>(
    store: &S,
    settings: &BrowseConfig,
    document_set_id: DocumentSetId,
    filter: SelectionFilter,
    offset: usize,
    limit: Option<usize>,
) -> Result<BrowsePage> {
    if store.get_document_set(document_set_id).await?.is_none() {
        return Err(CoreError::NotFound(format!("document set {}", document_set_id)).into());
    }
    let tree = store
        .tree_for_set(document_set_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("tree for document set {}", document_set_id)))?;

    let limit = limit.unwrap_or(settings.default_limit).min(settings.max_limit);
    let selection = Selection::new(tree, filter);
    let total = selection.count(store).await?;
    let documents = selection
        .slice(store, offset, offset.saturating_add(limit))
        .await?;

    Ok(BrowsePage {
        document_set_id,
        tree_id: selection.tree().id,
        total,
        offset,
        limit,
        documents,
    })
}

/// Up to `max_count` nodes of `tree_id` in breadth-first order, capped at
/// `browse.max_nodes`.
pub async fn breadth_first_nodes<S: Store + ?Sized>(
    store: &S,
    settings: &BrowseConfig,
    tree_id: TreeId,
    max_count: i64,
) -> Result<Vec<Node>> {
    let tree = store
        .get_tree(tree_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("tree {}", tree_id)))?;
    // A non-positive bound lists nothing.
    let bound = usize::try_from(max_count).unwrap_or(0).min(settings.max_nodes);
    breadth_first(store, tree.root_id, bound).await
}

// ============ CLI ============

pub async fn run_browse(
    config: &Config,
    document_set_id: DocumentSetId,
    filter: SelectionFilter,
    offset: usize,
    limit: Option<usize>,
) -> Result<()> {
    let store = db::open_store(config).await?;
    let page =
        browse_document_set(&store, &config.browse, document_set_id, filter, offset, limit).await?;

    if page.documents.is_empty() {
        println!("No documents.");
    } else {
        for doc in &page.documents {
            println!("{:<8} {}", doc.id, doc.title);
            println!("         {}", doc.view_url);
        }
        println!();
    }
    println!(
        "showing {}-{} of {} (tree {})",
        if page.documents.is_empty() { page.offset } else { page.offset + 1 },
        page.offset + page.documents.len(),
        page.total,
        page.tree_id
    );

    store.pool().close().await;
    Ok(())
}

pub async fn run_nodes(config: &Config, tree_id: TreeId, max_count: i64) -> Result<()> {
    let store = db::open_store(config).await?;
    let nodes = breadth_first_nodes(&store, &config.browse, tree_id, max_count).await?;

    for node in &nodes {
        let parent = node
            .parent_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<8} {}", node.id, parent, node.description);
    }

    store.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docset_core::error::core_error;
    use docset_core::models::NewDocument;
    use docset_core::store::memory::InMemoryStore;
    use docset_core::tree::NodeArena;

    fn settings() -> BrowseConfig {
        BrowseConfig {
            default_limit: 2,
            max_limit: 3,
            max_nodes: 2,
        }
    }

    async fn set_with_tree(store: &InMemoryStore, docs: usize) -> (DocumentSetId, TreeId) {
        let set = store.create_document_set("q").await.unwrap();
        let mut arena = NodeArena::new();
        let root = arena.add_node("q");
        for i in 0..docs {
            let doc = store
                .add_document(set.id, &NewDocument::new(&format!("doc {}", i), "t", "v"))
                .await
                .unwrap()
                .document;
            arena.add_document(root, doc.id).unwrap();
        }
        for name in ["a", "b", "c"] {
            let child = arena.add_node(name);
            arena.add_child(root, child).unwrap();
        }
        let tree = store.save_tree(set.id, &arena).await.unwrap();
        (set.id, tree.id)
    }

    #[tokio::test]
    async fn limit_defaults_and_clamps() {
        let store = InMemoryStore::new();
        let (set, _) = set_with_tree(&store, 5).await;

        let page = browse_document_set(&store, &settings(), set, SelectionFilter::default(), 0, None)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.limit, 2);
        assert_eq!(page.documents.len(), 2);

        let page = browse_document_set(&store, &settings(), set, SelectionFilter::default(), 3, Some(50))
            .await
            .unwrap();
        assert_eq!(page.limit, 3);
        assert_eq!(page.documents.len(), 2);
    }

    #[tokio::test]
    async fn browsing_without_tree_is_not_found() {
        let store = InMemoryStore::new();
        let set = store.create_document_set("q").await.unwrap();
        let err = browse_document_set(&store, &settings(), set.id, SelectionFilter::default(), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn node_listing_respects_server_cap() {
        let store = InMemoryStore::new();
        let (_, tree) = set_with_tree(&store, 1).await;

        let nodes = breadth_first_nodes(&store, &settings(), tree, 10).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].parent_id, None);
        assert_eq!(nodes[1].description, "a");
    }

    #[tokio::test]
    async fn non_positive_node_bound_is_empty() {
        let store = InMemoryStore::new();
        let (_, tree) = set_with_tree(&store, 1).await;

        for bound in [0, -1, i64::MIN] {
            let nodes = breadth_first_nodes(&store, &settings(), tree, bound).await.unwrap();
            assert!(nodes.is_empty());
        }
    }
}
