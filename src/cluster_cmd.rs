//! `docset tree`: (re)build the cluster tree of a document set.

use anyhow::Result;

use docset_core::cluster::build_tree;
use docset_core::ids::DocumentSetId;
use docset_core::models::Tree;
use docset_core::store::Store;
use docset_core::tree::{breadth_first, NodeLoader};

use crate::config::{Config, TreeConfig};
use crate::db;

/// Clusters the documents of `document_set_id` with the configured
/// parameters and replaces its tree.
pub async fn build_tree_for_set<S: Store + ?Sized>(
    store: &S,
    settings: &TreeConfig,
    document_set_id: DocumentSetId,
) -> Result<Tree> {
    build_tree(store, document_set_id, &settings.params()).await
}

pub async fn run_tree(config: &Config, document_set_id: DocumentSetId) -> Result<()> {
    let store = db::open_store(config).await?;
    let tree = build_tree_for_set(&store, &config.tree, document_set_id).await?;
    let top = breadth_first(&store, tree.root_id, 1 + config.tree.max_children).await?;

    println!("tree {} for document set {}", tree.id, document_set_id);
    println!("  root: {}", tree.root_id);
    for node in top.iter().skip(1) {
        let documents = store.load_node_documents(node.id).await?.len();
        println!("  {:<24} {} documents", node.description, documents);
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}
