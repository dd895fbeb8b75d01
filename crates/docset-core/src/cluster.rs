//! Hierarchical clustering of a document set by title terms.
//!
//! The root holds every document and is described by the set's query. A
//! node that is large enough and not too deep is split greedily: the most
//! frequent remaining title term (shared by at least two documents)
//! becomes a child holding the documents that contain it, and the step
//! repeats on what is left. Documents that match none of the chosen
//! terms go to an `(other)` child. Every node keeps the documents of all
//! its descendants, so a node's document list is exactly what is
//! reachable under it.
//!
//! The split is deterministic: documents are visited in id order and
//! frequency ties go to the alphabetically first term.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{DocumentId, DocumentSetId, NodeId};
use crate::job::JobState;
use crate::models::{Document, LogEntry, Tree};
use crate::store::{unix_now, Store};
use crate::tree::NodeArena;

pub const OTHER_DESCRIPTION: &str = "(other)";

const MIN_TERM_LEN: usize = 3;

/// A term child must hold at least this many documents.
const MIN_TERM_DOCUMENTS: usize = 2;

const STOP_WORDS: &[&str] = &[
    "and", "are", "but", "for", "from", "has", "have", "into", "its", "not", "of", "off", "our",
    "out", "over", "re", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "was", "were", "what", "when", "which", "who", "will", "with", "you", "your",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// Nodes at this depth are never split. The root is depth 0.
    pub max_depth: usize,
    /// Nodes with this many documents or fewer are never split.
    pub min_node_size: usize,
    /// Upper bound on term children per node, not counting `(other)`.
    pub max_children: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_node_size: 5,
            max_children: 8,
        }
    }
}

/// Lowercased title terms of at least three characters, stop words removed.
pub fn title_terms(title: &str) -> BTreeSet<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_TERM_LEN)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

struct Item {
    id: DocumentId,
    terms: BTreeSet<String>,
}

/// Clusters `documents` into a fresh arena whose root is described by
/// `description`.
pub fn cluster_documents(
    description: &str,
    documents: &[Document],
    params: &ClusterParams,
) -> Result<NodeArena> {
    let mut items: Vec<Item> = documents
        .iter()
        .map(|d| Item {
            id: d.id,
            terms: title_terms(&d.title),
        })
        .collect();
    items.sort_by_key(|i| i.id);

    let mut arena = NodeArena::new();
    let root = arena.add_node(description);
    let all: Vec<&Item> = items.iter().collect();
    split(&mut arena, root, &all, 0, &BTreeSet::new(), params)?;
    Ok(arena)
}

fn split(
    arena: &mut NodeArena,
    node: NodeId,
    docs: &[&Item],
    depth: usize,
    used: &BTreeSet<String>,
    params: &ClusterParams,
) -> Result<()> {
    for item in docs {
        arena.add_document(node, item.id)?;
    }
    if docs.len() <= params.min_node_size || depth >= params.max_depth {
        return Ok(());
    }

    let mut frequency: BTreeMap<&str, usize> = BTreeMap::new();
    for item in docs {
        for term in &item.terms {
            *frequency.entry(term.as_str()).or_default() += 1;
        }
    }
    // A term shared by every document separates nothing.
    let splittable: BTreeSet<&str> = frequency
        .into_iter()
        .filter(|(term, n)| *n < docs.len() && !used.contains(*term))
        .map(|(term, _)| term)
        .collect();

    let mut remaining: Vec<&Item> = docs.to_vec();
    let mut chosen = used.clone();
    let mut children = Vec::new();
    while children.len() < params.max_children && !remaining.is_empty() {
        let Some(term) = most_frequent(&remaining, &splittable, &chosen) else {
            break;
        };
        let (with, without): (Vec<&Item>, Vec<&Item>) =
            remaining.into_iter().partition(|i| i.terms.contains(term));
        chosen.insert(term.to_string());
        children.push((term.to_string(), with));
        remaining = without;
    }
    if children.is_empty() {
        return Ok(());
    }
    if !remaining.is_empty() {
        children.push((OTHER_DESCRIPTION.to_string(), remaining));
    }

    for (description, members) in children {
        let child = arena.add_node(&description);
        arena.add_child(node, child)?;
        split(arena, child, &members, depth + 1, &chosen, params)?;
    }
    Ok(())
}

fn most_frequent<'a>(
    docs: &[&Item],
    candidates: &BTreeSet<&'a str>,
    exclude: &BTreeSet<String>,
) -> Option<&'a str> {
    let mut counts: BTreeMap<&'a str, usize> = BTreeMap::new();
    for item in docs {
        for term in &item.terms {
            if let Some(candidate) = candidates.get(term.as_str()) {
                if !exclude.contains(term) {
                    *counts.entry(*candidate).or_default() += 1;
                }
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n >= MIN_TERM_DOCUMENTS)
        .max_by_key(|(term, n)| (*n, Reverse(*term)))
        .map(|(term, _)| term)
}

/// Clusters every document of `document_set_id` and stores the result as
/// the set's tree, replacing the old one.
///
/// Refuses with [`CoreError::TreeBuildConflict`] while the set's creation
/// job has not completed.
pub async fn build_tree<S: Store + ?Sized>(
    store: &S,
    document_set_id: DocumentSetId,
    params: &ClusterParams,
) -> Result<Tree> {
    let set = store
        .get_document_set(document_set_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("document set {}", document_set_id)))?;

    if let Some(job) = store.job_for_document_set(document_set_id).await? {
        if job.state != JobState::Complete {
            return Err(CoreError::TreeBuildConflict(format!(
                "job {} for document set {} is {}",
                job.id, document_set_id, job.state
            ))
            .into());
        }
    }

    let documents = store.list_documents(document_set_id).await?;
    let arena = cluster_documents(&set.query, &documents, params)?;
    let tree = store.save_tree(document_set_id, &arena).await?;

    store
        .append_log(&LogEntry {
            document_set_id,
            date: unix_now(),
            component: "clustering".into(),
            action: "build_tree".into(),
            details: Some(format!(
                "{} nodes over {} documents",
                arena.len(),
                documents.len()
            )),
        })
        .await?;
    tracing::info!(set = %document_set_id, tree = %tree.id, nodes = arena.len(), "tree built");
    Ok(tree)
}
