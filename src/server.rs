//! Search HTTP API.
//!
//! Serves the query contract over JSON, plus the index administration
//! operations the console needs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Run a keyword, vector or hybrid query |
//! | `GET`  | `/indices` | List user indices |
//! | `DELETE` | `/indices/{name}` | Delete an index (missing is not an error) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Errors are a flat JSON object:
//!
//! ```json
//! { "error": "invalid search method" }
//! ```
//!
//! Request validation failures are `400` with the validation message.
//! Anything else is `500` with the fixed message `Internal server error`;
//! details go to the log only.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the web console can
//! call the API from another origin.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedding::BedrockEmbedderFactory;
use crate::index::IndexManager;
use crate::models::SearchHit;
use crate::opensearch::{OpenSearchClient, SearchEngine};
use crate::search::{SearchRequest, SearchRequestError, Searcher};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    searcher: Searcher,
    indices: IndexManager,
}

impl AppState {
    pub fn new(searcher: Searcher, indices: IndexManager) -> Self {
        Self { searcher, indices }
    }
}

/// Starts the HTTP server on `[server].bind` with clients built from
/// configuration. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    config.require_cluster()?;

    let engine: Arc<dyn SearchEngine> =
        Arc::new(OpenSearchClient::from_config(&config.opensearch).await?);
    let embedders = Arc::new(BedrockEmbedderFactory::from_config(&config.embedding).await?);
    let state = AppState::new(
        Searcher::new(engine.clone(), embedders),
        IndexManager::new(engine, Duration::ZERO),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("search API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;

    Ok(())
}

/// Build the router with all routes and CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/indices", get(handle_list_indices))
        .route("/indices/{name}", delete(handle_delete_index))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

fn internal_error() -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Internal server error".to_string(),
    }
}

/// Validation errors keep their message; everything else is logged and hidden.
fn classify_error(context: &str, err: anyhow::Error) -> AppError {
    if let Some(invalid) = err.downcast_ref::<SearchRequestError>() {
        tracing::warn!("{}: {}", context, invalid);
        return bad_request(invalid.to_string());
    }
    tracing::error!("{} failed: {:#}", context, err);
    internal_error()
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

// ============ POST /search ============

/// Handler for `POST /search`.
///
/// Returns the hits as a bare JSON array of
/// `{text, score, service, docs_root, doc_name}`.
async fn handle_search(
    State(state): State<AppState>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    let hits = state
        .searcher
        .search(&request)
        .await
        .map_err(|e| classify_error("search", e))?;
    Ok(Json(hits))
}

// ============ /indices ============

#[derive(Serialize)]
struct IndexListResponse {
    indices: Vec<String>,
}

async fn handle_list_indices(
    State(state): State<AppState>,
) -> Result<Json<IndexListResponse>, AppError> {
    let indices = state
        .indices
        .list_indices()
        .await
        .map_err(|e| classify_error("list indices", e))?;
    Ok(Json(IndexListResponse { indices }))
}

#[derive(Serialize)]
struct DeleteResponse {
    index: String,
    deleted: bool,
}

/// Handler for `DELETE /indices/{name}`. Deleting a missing index succeeds
/// with `deleted: false`.
async fn handle_delete_index(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state
        .indices
        .delete_index(&name)
        .await
        .map_err(|e| classify_error("delete index", e))?;
    Ok(Json(DeleteResponse {
        index: name,
        deleted,
    }))
}
