//! HTTP client for a DocumentCloud-style search endpoint.
//!
//! Issues `GET {base_url}?q=<query>&page=<n>&per_page=<k>` and reads the
//! `documents` array of each page. Paging stops at the first short page or
//! once `max_documents` references have been collected.
//!
//! Retry strategy, per page:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use docset_core::error::CoreError;
use docset_core::models::DocumentReference;
use docset_core::pipeline::SearchClient;

use crate::config::SearchConfig;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid search response: {0}")]
    Decode(String),
    #[error("search request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl SearchError {
    fn is_retryable(&self) -> bool {
        match self {
            SearchError::Status { status, .. } => *status == 429 || *status >= 500,
            SearchError::Decode(_) => false,
            SearchError::Transport(_) => true,
        }
    }
}

/// One page of results. Records are kept as raw JSON so a malformed
/// record only spoils itself; see [`reference_from_value`].
#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    documents: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDocument {
    #[serde(deserialize_with = "lenient_id")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    canonical_url: Option<String>,
    resources: Option<serde_json::Value>,
    #[serde(deserialize_with = "lenient_string")]
    tags: Option<String>,
}

/// Ids arrive as strings or numbers; anything else counts as missing.
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    })
}

/// Converts one search record. Missing or mistyped fields come out empty,
/// which ingestion then reports as an item error for that record alone.
fn reference_from_value(value: serde_json::Value) -> DocumentReference {
    let raw: RawDocument = serde_json::from_value(value).unwrap_or_default();
    let text_url = raw
        .resources
        .as_ref()
        .and_then(|r| r.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_string);
    DocumentReference {
        id: raw.id.unwrap_or_default(),
        title: raw.title.unwrap_or_default(),
        canonical_url: raw.canonical_url.unwrap_or_default(),
        text_url,
        tags: raw.tags,
    }
}

pub struct DocumentCloudClient {
    client: reqwest::Client,
    config: SearchConfig,
}

impl DocumentCloudClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn fetch_page_once(
        &self,
        query: &str,
        page: usize,
    ) -> std::result::Result<Vec<serde_json::Value>, SearchError> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("q", query.to_string()),
                ("page", page.to_string()),
                ("per_page", self.config.per_page.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let parsed: SearchPage =
            serde_json::from_slice(&bytes).map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(parsed.documents)
    }

    async fn fetch_page(&self, query: &str, page: usize) -> Result<Vec<serde_json::Value>> {
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.fetch_page_once(query, page).await {
                Ok(documents) => return Ok(documents),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(page, attempt, error = %e, "search page failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(CoreError::IngestionFetchError(e.to_string()).into()),
            }
        }

        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "search failed after retries".to_string());
        Err(CoreError::IngestionFetchError(message).into())
    }
}

#[async_trait]
impl SearchClient for DocumentCloudClient {
    async fn search(&self, query: &str) -> Result<Vec<DocumentReference>> {
        let mut references = Vec::new();
        let mut page = 1;

        loop {
            let documents = self.fetch_page(query, page).await?;
            let short = documents.len() < self.config.per_page;
            references.extend(documents.into_iter().map(reference_from_value));

            if short || references.len() >= self.config.max_documents {
                break;
            }
            page += 1;
        }

        references.truncate(self.config.max_documents);
        tracing::debug!(query, pages = page, results = references.len(), "search finished");
        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_document_maps_text_resource() {
        let json = r#"{
            "documents": [
                {"id": "123-memo", "title": "\"Memo\"", "canonical_url": "https://dc/123",
                 "resources": {"text": "https://dc/123.txt"}},
                {"id": 77, "title": "Bare", "canonical_url": "https://dc/77"}
            ]
        }"#;
        let page: SearchPage = serde_json::from_str(json).unwrap();
        let refs: Vec<DocumentReference> =
            page.documents.into_iter().map(reference_from_value).collect();

        assert_eq!(refs[0].id, "123-memo");
        assert_eq!(refs[0].text_url.as_deref(), Some("https://dc/123.txt"));
        assert_eq!(refs[1].id, "77");
        assert_eq!(refs[1].text_url, None);
    }

    #[test]
    fn malformed_records_do_not_spoil_the_page() {
        let json = r#"{
            "documents": [
                {"id": "1-good", "title": "Good", "canonical_url": "https://dc/1"},
                {"id": null, "title": "No id", "canonical_url": "https://dc/2"},
                {"id": "3-untitled", "title": null, "canonical_url": "https://dc/3"},
                "not a record",
                {"id": 5, "title": "Also good", "canonical_url": "https://dc/5",
                 "resources": {"text": 12}}
            ]
        }"#;
        let page: SearchPage = serde_json::from_str(json).unwrap();
        let refs: Vec<DocumentReference> =
            page.documents.into_iter().map(reference_from_value).collect();

        assert_eq!(refs.len(), 5);
        assert_eq!(refs[0].id, "1-good");
        assert_eq!(refs[1].id, "");
        assert_eq!(refs[1].title, "No id");
        assert_eq!(refs[2].id, "3-untitled");
        assert_eq!(refs[2].title, "");
        assert_eq!(refs[3].id, "");
        assert_eq!(refs[4].id, "5");
        assert_eq!(refs[4].text_url, None);
    }

    #[tokio::test]
    async fn malformed_records_become_item_errors() {
        use docset_core::pipeline::{process_references, DefaultNormalizer, NoopIndexer};
        use docset_core::store::memory::InMemoryStore;
        use docset_core::store::Store;

        let json = r#"{"documents": [
            {"id": "a", "title": "First", "canonical_url": "https://dc/a"},
            {"id": null, "title": "Lost", "canonical_url": "https://dc/b"},
            {"id": "c", "title": null, "canonical_url": "https://dc/c"},
            {"id": "d", "title": "Last", "canonical_url": "https://dc/d"}
        ]}"#;
        let page: SearchPage = serde_json::from_str(json).unwrap();
        let refs: Vec<DocumentReference> =
            page.documents.into_iter().map(reference_from_value).collect();

        let store = InMemoryStore::new();
        let set = store.create_document_set("q").await.unwrap();
        let outcome = process_references(
            &store,
            set.id,
            &refs,
            &DefaultNormalizer,
            &NoopIndexer,
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[1].reference_id, "c");
        let titles: Vec<_> = store
            .list_documents(set.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.title)
            .collect();
        assert_eq!(titles, vec!["First", "Last"]);
    }

    #[test]
    fn missing_documents_is_an_empty_page() {
        let page: SearchPage = serde_json::from_str("{}").unwrap();
        assert!(page.documents.is_empty());
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        let status = |s| SearchError::Status {
            status: s,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!SearchError::Decode("x".into()).is_retryable());
    }
}
