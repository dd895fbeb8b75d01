//! # docset
//!
//! Turns the results of an external document search into a browsable,
//! taggable, hierarchical cluster tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ docset create│──▶│  jobs table  │◀──│  worker  │──▶ search API
//! └──────────────┘   └──────────────┘   └────┬─────┘
//!                                            │ documents, tags
//!                                            ▼
//!                    ┌──────────┐       ┌──────────┐
//!                    │ browse / │◀──────│  SQLite  │
//!                    │  HTTP    │       │ + trees  │
//!                    └──────────┘       └──────────┘
//! ```
//!
//! Domain logic (models, tags, trees, clustering, selection, the job state
//! machine, and the [`Store`](docset_core::store::Store) trait) lives in
//! the runtime-free `docset-core` crate. This crate adds SQLite storage,
//! the HTTP search client, the worker, the CLI commands, and the server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite [`Store`](docset_core::store::Store) |
//! | [`search_client`] | DocumentCloud-style search client |
//! | [`ingest`] | Ingestion worker |
//! | [`progress`] | Worker progress reporting |
//! | [`jobs`] | Create, inspect, retry, list, delete |
//! | [`browse`] | Paged browsing and node listing |
//! | [`cluster_cmd`] | Tree building |
//! | [`tag_cmd`] | Document tagging |
//! | [`server`] | JSON HTTP API |

pub mod browse;
pub mod cluster_cmd;
pub mod config;
pub mod db;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod progress;
pub mod search_client;
pub mod server;
pub mod sqlite_store;
pub mod tag_cmd;
