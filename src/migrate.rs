use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS document_sets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_set_id INTEGER NOT NULL
            REFERENCES document_sets(id) ON DELETE CASCADE,
        external_id TEXT,
        title TEXT NOT NULL,
        text_url TEXT NOT NULL,
        view_url TEXT NOT NULL,
        UNIQUE(document_set_id, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_set_id INTEGER NOT NULL
            REFERENCES document_sets(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        UNIQUE(document_set_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_tags (
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        PRIMARY KEY (document_id, tag_id)
    )
    "#,
    // root_id is not a foreign key: nodes reference their tree, so the
    // tree row goes in first and root_id is filled in once the nodes exist.
    r#"
    CREATE TABLE IF NOT EXISTS trees (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_set_id INTEGER NOT NULL UNIQUE
            REFERENCES document_sets(id) ON DELETE CASCADE,
        root_id INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tree_id INTEGER NOT NULL REFERENCES trees(id) ON DELETE CASCADE,
        parent_id INTEGER REFERENCES nodes(id) ON DELETE CASCADE,
        description TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_documents (
        node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        PRIMARY KEY (node_id, document_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tree_documents (
        tree_id INTEGER NOT NULL REFERENCES trees(id) ON DELETE CASCADE,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        PRIMARY KEY (tree_id, document_id)
    )
    "#,
    // Jobs outlive their document set, so document_set_id has no FK.
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        query TEXT NOT NULL,
        document_set_id INTEGER NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        claimed_by TEXT,
        claimed_at INTEGER,
        initial_document_id INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_item_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        reference_id TEXT NOT NULL,
        message TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS log_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_set_id INTEGER NOT NULL
            REFERENCES document_sets(id) ON DELETE CASCADE,
        date INTEGER NOT NULL,
        component TEXT NOT NULL,
        action TEXT NOT NULL,
        details TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_set ON documents(document_set_id)",
    "CREATE INDEX IF NOT EXISTS idx_document_tags_tag ON document_tags(tag_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_tree ON nodes(tree_id)",
    "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_node_documents_document ON node_documents(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_set ON jobs(document_set_id)",
    "CREATE INDEX IF NOT EXISTS idx_log_entries_set ON log_entries(document_set_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Applies the schema to an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!(statements = SCHEMA.len(), "schema up to date");
    Ok(())
}
