//! Per-document-set tag registry.
//!
//! Tags are unique by exact name within a document set. Resolution always
//! reads the set's current tags first and only creates the names that are
//! missing, so repeated or overlapping calls never produce a second tag
//! with the same name. The store's own uniqueness constraint backs this
//! up: a racing insert surfaces as [`CoreError::DuplicateTagViolation`].

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::error::CoreError;
use crate::ids::{DocumentId, DocumentSetId};
use crate::models::Tag;
use crate::store::Store;

/// Splits a comma-separated tag list into distinct, trimmed, non-empty
/// names, keeping first-occurrence order.
///
/// ```rust
/// use docset_core::tags::parse_tag_names;
///
/// assert_eq!(parse_tag_names("  foo , bar,,foo "), vec!["foo", "bar"]);
/// ```
pub fn parse_tag_names(tag_list: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tag_list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.to_string()))
        .map(str::to_string)
        .collect()
}

/// Resolves `tag_list` against the tags of `document_set_id`, creating the
/// missing ones.
///
/// Returns one tag per distinct input name, in input order.
pub async fn find_or_create_tags<S: Store + ?Sized>(
    store: &S,
    document_set_id: DocumentSetId,
    tag_list: &str,
) -> Result<Vec<Tag>> {
    let names = parse_tag_names(tag_list);
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let mut existing: HashMap<String, Tag> = store
        .list_tags(document_set_id)
        .await?
        .into_iter()
        .map(|tag| (tag.name.clone(), tag))
        .collect();

    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        let tag = match existing.remove(&name) {
            Some(tag) => tag,
            None => {
                tracing::debug!(set = %document_set_id, tag = %name, "creating tag");
                store.insert_tag(document_set_id, &name).await?
            }
        };
        resolved.push(tag);
    }
    Ok(resolved)
}

/// Replaces the tag membership of `document_id` with exactly the tags
/// named in `tag_list`.
///
/// Tags dropped from the document stay in the set's registry.
pub async fn set_document_tags<S: Store + ?Sized>(
    store: &S,
    document_id: DocumentId,
    tag_list: &str,
) -> Result<Vec<Tag>> {
    let document = store
        .get_document(document_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("document {}", document_id)))?;

    let tags = find_or_create_tags(store, document.document_set_id, tag_list).await?;
    let ids: Vec<_> = tags.iter().map(|t| t.id).collect();
    store.replace_document_tags(document_id, &ids).await?;
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::core_error;
    use crate::models::NewDocument;
    use crate::store::memory::InMemoryStore;

    fn names(tags: &[Tag]) -> Vec<&str> {
        tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn parse_trims_and_collapses() {
        assert_eq!(parse_tag_names("  foo , bar"), vec!["foo", "bar"]);
        assert_eq!(parse_tag_names("a,b,a, b ,c"), vec!["a", "b", "c"]);
        assert!(parse_tag_names(" , ,, ").is_empty());
        assert!(parse_tag_names("").is_empty());
    }

    #[test]
    fn parse_is_case_sensitive() {
        assert_eq!(parse_tag_names("Foo,foo"), vec!["Foo", "foo"]);
    }

    #[tokio::test]
    async fn overlapping_calls_reuse_existing_tags() {
        let store = InMemoryStore::new();
        let set = store.create_document_set("query").await.unwrap();

        let first = find_or_create_tags(&store, set.id, "foo,bar,baz").await.unwrap();
        let second = find_or_create_tags(&store, set.id, "foo,faz,baz").await.unwrap();

        assert_eq!(names(&first), vec!["foo", "bar", "baz"]);
        assert_eq!(names(&second), vec!["foo", "faz", "baz"]);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[2].id, second[2].id);

        let mut all = names(&store.list_tags(set.id).await.unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        all.sort();
        assert_eq!(all, vec!["bar", "baz", "faz", "foo"]);
    }

    #[tokio::test]
    async fn same_name_in_different_sets_is_distinct() {
        let store = InMemoryStore::new();
        let a = store.create_document_set("a").await.unwrap();
        let b = store.create_document_set("b").await.unwrap();

        let ta = find_or_create_tags(&store, a.id, "shared").await.unwrap();
        let tb = find_or_create_tags(&store, b.id, "shared").await.unwrap();
        assert_ne!(ta[0].id, tb[0].id);
        assert_eq!(tb[0].document_set_id, b.id);
    }

    #[tokio::test]
    async fn direct_duplicate_insert_is_surfaced() {
        let store = InMemoryStore::new();
        let set = store.create_document_set("q").await.unwrap();
        store.insert_tag(set.id, "foo").await.unwrap();

        let err = store.insert_tag(set.id, "foo").await.unwrap_err();
        assert!(matches!(
            core_error(&err),
            Some(CoreError::DuplicateTagViolation { .. })
        ));
    }

    #[tokio::test]
    async fn set_tags_replaces_membership_and_keeps_registry() {
        let store = InMemoryStore::new();
        let set = store.create_document_set("q").await.unwrap();
        let doc = store
            .add_document(set.id, &NewDocument::new("title", "http://text", "http://view"))
            .await
            .unwrap()
            .document;

        set_document_tags(&store, doc.id, "  foo , bar").await.unwrap();
        assert_eq!(names(&store.document_tags(doc.id).await.unwrap()), vec!["foo", "bar"]);

        set_document_tags(&store, doc.id, "bar, qux").await.unwrap();
        assert_eq!(names(&store.document_tags(doc.id).await.unwrap()), vec!["bar", "qux"]);
        assert_eq!(store.list_tags(set.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn set_tags_on_missing_document_is_not_found() {
        let store = InMemoryStore::new();
        let err = set_document_tags(&store, DocumentId::new(404), "x")
            .await
            .unwrap_err();
        assert!(matches!(core_error(&err), Some(CoreError::NotFound(_))));
    }
}
