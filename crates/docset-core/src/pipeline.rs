//! Turning search references into documents.
//!
//! The ingestion worker fetches a reference list through a
//! [`SearchClient`] and hands it to [`process_references`], which walks
//! the list in order:
//!
//! 1. strip the quote characters the upstream JSON leaves around titles
//!    and URLs, then run the title through the [`Normalizer`];
//! 2. build a [`NewDocument`] keyed by the reference id;
//! 3. get-or-create it in the document set;
//! 4. apply any upstream tags and hand the document to the
//!    [`DocumentIndexer`].
//!
//! A failing reference is recorded as an [`ItemError`] and the loop moves
//! on. Steps 1 to 3 decide whether a reference counts as ingested; a
//! failure in step 4 is reported but the document stays.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::CoreError;
use crate::ids::{DocumentId, DocumentSetId};
use crate::models::{Document, DocumentReference, ItemError, NewDocument};
use crate::store::Store;
use crate::tags::set_document_tags;

/// The external document search service.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Every reference matching `query`, in the service's result order.
    async fn search(&self, query: &str) -> Result<Vec<DocumentReference>>;
}

/// Text clean-up applied to titles before they are stored.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, text: &str) -> Result<String>;
}

/// Downstream hook run for every ingested document.
#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    async fn index(&self, document: &Document) -> Result<()>;
}

/// Drops control characters, collapses whitespace runs, and rejects
/// text that ends up empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNormalizer;

impl Normalizer for DefaultNormalizer {
    fn normalize(&self, text: &str) -> Result<String> {
        let cleaned: String = text
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect();
        let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return Err(CoreError::InvalidInput("text is empty after normalization".into()).into());
        }
        Ok(collapsed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIndexer;

#[async_trait]
impl DocumentIndexer for NoopIndexer {
    async fn index(&self, _document: &Document) -> Result<()> {
        Ok(())
    }
}

/// Removes surrounding whitespace and `"` characters.
pub fn strip_quotes(text: &str) -> &str {
    text.trim().trim_matches('"').trim()
}

/// Builds the document for one reference, or explains why it can't.
pub fn build_document(
    reference: &DocumentReference,
    normalizer: &dyn Normalizer,
) -> Result<NewDocument> {
    let external_id = reference.id.trim();
    if external_id.is_empty() {
        return Err(CoreError::InvalidInput("reference has no id".into()).into());
    }
    let view_url = strip_quotes(&reference.canonical_url);
    if view_url.is_empty() {
        return Err(CoreError::InvalidInput("reference has no canonical url".into()).into());
    }
    let text_url = reference
        .text_url
        .as_deref()
        .map(strip_quotes)
        .filter(|u| !u.is_empty())
        .unwrap_or(view_url);
    let title = normalizer.normalize(strip_quotes(&reference.title))?;

    Ok(NewDocument::new(&title, text_url, view_url).with_external_id(external_id))
}

/// Result of one pass over a reference list.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Documents created by this pass.
    pub created: usize,
    /// References whose document already existed from an earlier pass.
    pub existing: usize,
    /// Document of the first reference, in result order, that was ingested.
    pub initial_document: Option<DocumentId>,
    pub errors: Vec<ItemError>,
}

impl IngestOutcome {
    pub fn ingested(&self) -> usize {
        self.created + self.existing
    }
}

fn item_error(reference: &DocumentReference, err: &anyhow::Error) -> ItemError {
    ItemError {
        reference_id: reference.id.clone(),
        message: format!("{:#}", err),
    }
}

/// Ingests `references` into `document_set_id` in order.
///
/// `on_progress(done, total)` is called after every reference.
/// Per-reference failures never abort the pass; they are collected in
/// [`IngestOutcome::errors`].
pub async fn process_references<S: Store + ?Sized>(
    store: &S,
    document_set_id: DocumentSetId,
    references: &[DocumentReference],
    normalizer: &dyn Normalizer,
    indexer: &dyn DocumentIndexer,
    mut on_progress: impl FnMut(usize, usize) + Send,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();
    let total = references.len();

    for (i, reference) in references.iter().enumerate() {
        let added = match build_document(reference, normalizer) {
            Ok(doc) => store.add_document(document_set_id, &doc).await,
            Err(e) => Err(e),
        };

        match added {
            Ok(added) => {
                if added.created {
                    outcome.created += 1;
                } else {
                    outcome.existing += 1;
                }
                outcome.initial_document.get_or_insert(added.document.id);

                if let Some(tags) = reference.tags.as_deref() {
                    if let Err(e) = set_document_tags(store, added.document.id, tags).await {
                        outcome.errors.push(item_error(reference, &e));
                    }
                }
                if let Err(e) = indexer.index(&added.document).await {
                    outcome.errors.push(item_error(reference, &e));
                }
            }
            Err(e) => {
                tracing::warn!(reference = %reference.id, error = %format!("{:#}", e), "skipping reference");
                outcome.errors.push(item_error(reference, &e));
            }
        }

        on_progress(i + 1, total);
    }

    Ok(outcome)
}
