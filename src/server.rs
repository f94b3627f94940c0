//! Backend HTTP server.
//!
//! Indexes uploaded documents and answers queries over them, streaming the
//! answer as server-sent events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness probe (returns version) |
//! | `GET`  | `/check-document/{documentId}` | `{exists, ragId?}` |
//! | `POST` | `/upload-pdf` | Multipart upload (`file`, `document_id`, `display_name`) |
//! | `POST` | `/activate-document/{documentId}` | Pre-activate before querying |
//! | `POST` | `/query?stream=true` | Answer `{query}` for header `X-Document-Id` |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `payload_too_large`
//! (413), `extraction_failed` (422), `generation_failed` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! call the backend directly.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use docqa_core::models::{Citation, StreamEvent};
use docqa_core::protocol::encode_frame;
use docqa_core::store::{IndexedDocument, PassageStore};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::extract::{detect_content_type, ExtractError};
use crate::ingest::{IndexReport, Indexer};
use crate::migrate::migrate_backend;
use crate::pipeline::QueryEngine;
use crate::sqlite_store::SqliteStore;

/// Header naming the document a query is about.
pub const DOCUMENT_ID_HEADER: &str = "x-document-id";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn PassageStore>,
    indexer: Arc<Indexer>,
    engine: Arc<QueryEngine>,
}

impl AppState {
    pub fn new(store: Arc<dyn PassageStore>, indexer: Indexer, engine: QueryEngine) -> Self {
        Self {
            store,
            indexer: Arc::new(indexer),
            engine: Arc::new(engine),
        }
    }

    /// Open the backend database and wire providers from config.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config.db.path).await?;
        migrate_backend(&pool).await?;
        let store: Arc<dyn PassageStore> = Arc::new(SqliteStore::new(pool));
        let indexer = Indexer::new(
            store.clone(),
            create_embedder(&config.embedding)?,
            config.chunking.params(),
            config.embedding.batch_size,
        );
        let engine = QueryEngine::from_config(config, store.clone())?;
        Ok(Self::new(store, indexer, engine))
    }
}

/// All routes, CORS, and the upload size limit.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/check-document/{document_id}", get(handle_check_document))
        .route("/upload-pdf", post(handle_upload))
        .route("/activate-document/{document_id}", post(handle_activate))
        .route("/query", post(handle_query))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .with_state(state)
}

/// Starts the backend server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = router(state, config.server.max_upload_mb * 1024 * 1024);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "backend listening");
    println!("docqa backend listening on http://{}", config.server.bind);
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

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    warn!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

/// Map indexing failures: bad input is the uploader's problem, the rest is ours.
fn classify_index_error(err: anyhow::Error) -> AppError {
    match err.downcast_ref::<ExtractError>() {
        Some(e) => AppError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "extraction_failed",
            message: e.to_string(),
        },
        None => internal(err),
    }
}

/// Resolve a document by upload handle or by upstream id.
async fn lookup(store: &dyn PassageStore, key: &str) -> Result<IndexedDocument, AppError> {
    if let Some(doc) = store.get_document(key).await.map_err(internal)? {
        return Ok(doc);
    }
    store
        .find_by_document_id(key)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", key)))
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

// ============ GET /check-document/{id} ============

#[derive(Serialize)]
struct CheckResponse {
    exists: bool,
    #[serde(rename = "ragId", skip_serializing_if = "Option::is_none")]
    rag_id: Option<String>,
}

async fn handle_check_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<CheckResponse>, AppError> {
    let doc = state
        .store
        .find_by_document_id(&document_id)
        .await
        .map_err(internal)?;
    Ok(Json(CheckResponse {
        exists: doc.is_some(),
        rag_id: doc.map(|d| d.handle),
    }))
}

// ============ POST /upload-pdf ============

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IndexReport>, AppError> {
    let mut file: Option<(Vec<u8>, Option<String>, Option<String>)> = None;
    let mut document_id: Option<String> = None;
    let mut display_name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let filename = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|e| {
                    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                        AppError {
                            status: StatusCode::PAYLOAD_TOO_LARGE,
                            code: "payload_too_large",
                            message: e.body_text(),
                        }
                    } else {
                        bad_request(format!("failed to read file: {}", e))
                    }
                })?;
                file = Some((bytes.to_vec(), filename, content_type));
            }
            "document_id" | "documentId" => {
                document_id = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
            }
            "display_name" | "displayName" => {
                display_name = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
            }
            _ => {}
        }
    }

    let (bytes, filename, content_type) =
        file.ok_or_else(|| bad_request("missing 'file' field"))?;
    if bytes.is_empty() {
        return Err(bad_request("uploaded file is empty"));
    }
    let document_id = document_id
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| bad_request("missing 'document_id' field"))?;
    let display_name = display_name.or(filename.clone());
    let content_type = detect_content_type(content_type.as_deref(), filename.as_deref(), &bytes);

    let report = state
        .indexer
        .index(&document_id, display_name.as_deref(), &bytes, &content_type)
        .await
        .map_err(classify_index_error)?;
    Ok(Json(report))
}

// ============ POST /activate-document/{id} ============

#[derive(Serialize)]
struct ActivateResponse {
    activated: bool,
}

async fn handle_activate(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<ActivateResponse>, AppError> {
    let doc = lookup(state.store.as_ref(), &document_id).await?;
    let activated = state
        .store
        .mark_activated(&doc.handle, chrono::Utc::now().timestamp())
        .await
        .map_err(internal)?;
    Ok(Json(ActivateResponse { activated }))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryParams {
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
}

#[derive(Serialize)]
struct AnswerResponse {
    response: String,
    citations: Vec<Citation>,
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<Response, AppError> {
    let key = headers
        .get(DOCUMENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request("missing X-Document-Id header"))?;
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let doc = lookup(state.store.as_ref(), key).await?;

    let cancel = CancellationToken::new();
    let events = state
        .engine
        .answer(&doc.handle, &body.query, cancel.clone())
        .await
        .map_err(internal)?;

    if params.stream {
        // The guard lives as long as the response body; a client disconnect
        // drops it and cancels generation.
        let guard = cancel.drop_guard();
        let frames = events.map(move |event| {
            let _ = &guard;
            Ok::<_, Infallible>(encode_frame(&event))
        });
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(frames))
            .map_err(|e| internal(e.into()));
    }

    let mut events = events;
    while let Some(event) = events.next().await {
        match event {
            StreamEvent::ContentChunk { .. } => {}
            StreamEvent::Complete {
                final_text,
                citations,
            } => {
                return Ok(Json(AnswerResponse {
                    response: final_text,
                    citations,
                })
                .into_response());
            }
            StreamEvent::Error { message, .. } => {
                return Err(AppError {
                    status: StatusCode::BAD_GATEWAY,
                    code: "generation_failed",
                    message,
                });
            }
        }
    }
    Err(internal(anyhow::anyhow!("answer stream ended without a result")))
}
