//! `docset tag`: replace the tags of one document.

use anyhow::Result;

use docset_core::ids::DocumentId;
use docset_core::tags::set_document_tags;

use crate::config::Config;
use crate::db;

pub async fn run_tag(config: &Config, document_id: DocumentId, tag_list: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let tags = set_document_tags(&store, document_id, tag_list).await?;

    if tags.is_empty() {
        println!("document {}: no tags", document_id);
    } else {
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        println!("document {}: {}", document_id, names.join(", "));
    }

    store.pool().close().await;
    Ok(())
}
