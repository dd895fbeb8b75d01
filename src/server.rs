//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/document-sets` | Create a set for `{"query"}` and enqueue its job |
//! | `GET`  | `/document-sets` | List sets with document counts and job state |
//! | `DELETE` | `/document-sets/{id}` | Delete a set and everything it owns |
//! | `GET`  | `/document-sets/{id}/documents` | Browse a page (`nodes`, `tags`, `documents`, `offset`, `limit`) |
//! | `POST` | `/document-sets/{id}/tree` | Rebuild the cluster tree |
//! | `GET`  | `/jobs/{id}` | Job state, attempts, item errors |
//! | `POST` | `/jobs/{id}/retry` | Resubmit a failed job |
//! | `GET`  | `/trees/{id}/nodes` | Breadth-first nodes (`max`) |
//! | `PUT`  | `/documents/{id}/tags` | Replace a document's tags (`{"tags": "a, b"}`) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document set 4 not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use docset_core::error::{core_error, CoreError};
use docset_core::ids::{DocumentId, DocumentSetId, JobId, TreeId};
use docset_core::job::Job;
use docset_core::models::{Node, Tag, Tree};
use docset_core::pipeline::SearchClient;
use docset_core::selection::SelectionFilter;
use docset_core::store::Store;
use docset_core::tags::set_document_tags;

use crate::browse::{self, BrowsePage};
use crate::cluster_cmd::build_tree_for_set;
use crate::config::Config;
use crate::db;
use crate::ingest::{spawn_workers, Ingestor};
use crate::jobs::{self, DocumentSetSummary, JobStatus};
use crate::search_client::DocumentCloudClient;
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub config: Arc<Config>,
}

/// Builds the router over an existing store. Used by [`run_server`] and
/// by tests that serve on an ephemeral port.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/document-sets",
            post(handle_create_set).get(handle_list_sets),
        )
        .route("/document-sets/{id}", delete(handle_delete_set))
        .route("/document-sets/{id}/documents", get(handle_browse))
        .route("/document-sets/{id}/tree", post(handle_build_tree))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/jobs/{id}/retry", post(handle_retry_job))
        .route("/trees/{id}/nodes", get(handle_nodes))
        .route("/documents/{id}/tags", put(handle_set_tags))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// `docset serve`: binds to `[server].bind` and serves until terminated.
///
/// With `[server].workers = true` the ingestion workers run in the same
/// process.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

    if config.server.workers {
        let search: Arc<dyn SearchClient> = Arc::new(DocumentCloudClient::new(&config.search)?);
        let ingestor = Arc::new(Ingestor::new(store.clone(), search, config));
        let handles = spawn_workers(ingestor, config.ingest.workers, false);
        tracing::info!(workers = handles.len(), "ingestion workers started");
    }

    let app = build_router(AppState {
        store,
        config: Arc::new(config.clone()),
    });

    println!("docset server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Maps a domain error kind to its status code; anything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match core_error(&err) {
            Some(CoreError::NotFound(_)) => not_found(message),
            Some(
                CoreError::InvalidInput(_)
                | CoreError::InvalidTreeOperation(_)
                | CoreError::IngestionItemError { .. },
            ) => bad_request(message),
            Some(
                CoreError::InvalidStateTransition { .. }
                | CoreError::DuplicateTagViolation { .. }
                | CoreError::TreeBuildConflict(_)
                | CoreError::LeaseLost { .. },
            ) => conflict(message),
            Some(CoreError::IngestionFetchError(_)) | None => {
                tracing::error!(error = %message, "request failed");
                internal(message)
            }
        }
    }
}

/// Parses a comma-separated id list such as `"3,5, 8"`.
fn parse_ids<T: FromStr>(name: &str, raw: Option<&str>) -> Result<Vec<T>, AppError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|_| bad_request(format!("{}: '{}' is not a valid id", name, s)))
        })
        .collect()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Document sets ============

#[derive(Deserialize)]
struct CreateSetRequest {
    query: String,
}

async fn handle_create_set(
    State(state): State<AppState>,
    Json(req): Json<CreateSetRequest>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let job = jobs::create_document_set(state.store.as_ref(), &req.query).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn handle_list_sets(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentSetSummary>>, AppError> {
    Ok(Json(jobs::list_document_sets(state.store.as_ref()).await?))
}

async fn handle_delete_set(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    jobs::delete_document_set(state.store.as_ref(), DocumentSetId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct BrowseParams {
    nodes: Option<String>,
    tags: Option<String>,
    documents: Option<String>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn handle_browse(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<BrowseParams>,
) -> Result<Json<BrowsePage>, AppError> {
    let filter = SelectionFilter {
        nodes: parse_ids("nodes", params.nodes.as_deref())?,
        documents: parse_ids("documents", params.documents.as_deref())?,
        tags: parse_ids("tags", params.tags.as_deref())?,
    };
    let page = browse::browse_document_set(
        state.store.as_ref(),
        &state.config.browse,
        DocumentSetId::new(id),
        filter,
        params.offset,
        params.limit,
    )
    .await?;
    Ok(Json(page))
}

async fn handle_build_tree(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Tree>, AppError> {
    let tree =
        build_tree_for_set(state.store.as_ref(), &state.config.tree, DocumentSetId::new(id)).await?;
    Ok(Json(tree))
}

// ============ Jobs ============

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<JobStatus>, AppError> {
    Ok(Json(jobs::get_job(state.store.as_ref(), JobId::new(id)).await?))
}

async fn handle_retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(jobs::retry_job(state.store.as_ref(), JobId::new(id)).await?))
}

// ============ Trees ============

#[derive(Deserialize)]
struct NodesParams {
    /// Zero or negative lists nothing.
    max: Option<i64>,
}

#[derive(Serialize)]
struct NodesResponse {
    tree_id: TreeId,
    nodes: Vec<Node>,
}

async fn handle_nodes(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<NodesParams>,
) -> Result<Json<NodesResponse>, AppError> {
    let tree_id = TreeId::new(id);
    let max = params
        .max
        .unwrap_or_else(|| i64::try_from(state.config.browse.max_nodes).unwrap_or(i64::MAX));
    let nodes =
        browse::breadth_first_nodes(state.store.as_ref(), &state.config.browse, tree_id, max).await?;
    Ok(Json(NodesResponse { tree_id, nodes }))
}

// ============ Tags ============

#[derive(Deserialize)]
struct SetTagsRequest {
    /// Comma-separated tag names; empty clears the document's tags.
    tags: String,
}

#[derive(Serialize)]
struct SetTagsResponse {
    document_id: DocumentId,
    tags: Vec<Tag>,
}

async fn handle_set_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SetTagsRequest>,
) -> Result<Json<SetTagsResponse>, AppError> {
    let document_id = DocumentId::new(id);
    let tags = set_document_tags(state.store.as_ref(), document_id, &req.tags).await?;
    Ok(Json(SetTagsResponse { document_id, tags }))
}
