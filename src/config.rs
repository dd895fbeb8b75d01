use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docset_core::cluster::ClusterParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub browse: BrowseConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// The DocumentCloud-style search endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            per_page: default_per_page(),
            max_documents: default_max_documents(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_url() -> String {
    "https://www.documentcloud.org/api/search.json".to_string()
}
fn default_per_page() -> usize {
    100
}
fn default_max_documents() -> usize {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Upper bound on the whole search fetch, retries included.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cluster the set as soon as its job completes.
    #[serde(default = "default_build_tree")]
    pub build_tree: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            build_tree: default_build_tree(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    120
}
fn default_lease_secs() -> i64 {
    600
}
fn default_max_attempts() -> u32 {
    3
}
fn default_workers() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_build_tree() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct TreeConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_min_node_size")]
    pub min_node_size: usize,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            min_node_size: default_min_node_size(),
            max_children: default_max_children(),
        }
    }
}

fn default_max_depth() -> usize {
    3
}
fn default_min_node_size() -> usize {
    5
}
fn default_max_children() -> usize {
    8
}

impl TreeConfig {
    pub fn params(&self) -> ClusterParams {
        ClusterParams {
            max_depth: self.max_depth,
            min_node_size: self.min_node_size,
            max_children: self.max_children,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowseConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    /// Cap on `breadth_first_nodes` requests.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_nodes: default_max_nodes(),
        }
    }
}

fn default_limit() -> usize {
    25
}
fn default_max_limit() -> usize {
    500
}
fn default_max_nodes() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Run ingestion workers inside the server process.
    #[serde(default)]
    pub workers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate search
    if config.search.base_url.trim().is_empty() {
        anyhow::bail!("search.base_url must not be empty");
    }
    if config.search.per_page == 0 {
        anyhow::bail!("search.per_page must be > 0");
    }
    if config.search.max_documents == 0 {
        anyhow::bail!("search.max_documents must be > 0");
    }

    // Validate ingest
    if config.ingest.max_attempts == 0 {
        anyhow::bail!("ingest.max_attempts must be >= 1");
    }
    if config.ingest.workers == 0 {
        anyhow::bail!("ingest.workers must be >= 1");
    }
    if config.ingest.lease_secs <= 0 {
        anyhow::bail!("ingest.lease_secs must be > 0");
    }
    if config.ingest.fetch_timeout_secs == 0 {
        anyhow::bail!("ingest.fetch_timeout_secs must be > 0");
    }
    if config.ingest.lease_secs as u64 <= config.ingest.fetch_timeout_secs {
        anyhow::bail!(
            "ingest.lease_secs ({}) must exceed ingest.fetch_timeout_secs ({})",
            config.ingest.lease_secs,
            config.ingest.fetch_timeout_secs
        );
    }

    // Validate tree
    if config.tree.max_children == 0 {
        anyhow::bail!("tree.max_children must be >= 1");
    }

    // Validate browse
    if config.browse.max_limit == 0 {
        anyhow::bail!("browse.max_limit must be >= 1");
    }
    if config.browse.default_limit > config.browse.max_limit {
        anyhow::bail!(
            "browse.default_limit ({}) must not exceed browse.max_limit ({})",
            config.browse.default_limit,
            config.browse.max_limit
        );
    }

    Ok(())
}
