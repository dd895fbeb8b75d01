//! # docset core
//!
//! Runtime-free domain logic for docset: typed ids and models, the
//! per-set tag registry, the node arena and bounded breadth-first
//! traversal, title clustering, selections, the document set creation job
//! state machine, and the collaborator traits the application plugs into
//! ([`store::Store`], [`pipeline::SearchClient`], [`pipeline::Normalizer`],
//! [`pipeline::DocumentIndexer`]).
//!
//! This crate has no tokio, sqlx, or network dependencies. The in-memory
//! [`store::memory::InMemoryStore`] makes every operation testable
//! without a database.

pub mod cluster;
pub mod error;
pub mod ids;
pub mod job;
pub mod models;
pub mod pipeline;
pub mod relation;
pub mod selection;
pub mod store;
pub mod tags;
pub mod tree;

pub use error::CoreError;
