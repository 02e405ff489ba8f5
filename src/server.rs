//! HTTP API for document upload, status, deletion and question answering.
//!
//! Every route except `/health` requires an `Authorization: Bearer <token>`
//! header; the token is resolved to a user id by the configured
//! [`IdentityProvider`]. User ids are never read from request bodies.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/document/upload` | Multipart upload (field `file`), ingests in background |
//! | `GET`    | `/document` | List the caller's documents |
//! | `GET`    | `/document/{id}/status` | Processing status |
//! | `DELETE` | `/document/{id}` | Delete a document and its index |
//! | `POST`   | `/document/ask` | `{ question, task_id }` with default retrieval settings |
//! | `POST`   | `/document/chat` | `{ question, document_id, use_mmr?, k? }` |
//! | `POST`   | `/document/cleanup` | Evict orphaned indices |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Document not found" } }
//! ```
//!
//! | Error | Status |
//! |-------|--------|
//! | `bad_request`, `unsupported_file_type` | 400 |
//! | `unauthenticated` | 401 |
//! | `forbidden` | 403 |
//! | `not_found`, `vector_store_missing` | 404 |
//! | `still_processing` | 202 |
//! | `answer_generation_error` | 502 |
//! | anything else | 500 |

use axum::{
    extract::{DefaultBodyLimit, FromRequestParts, Multipart, Path, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::answer::{Answerer, AskRequest};
use crate::config::Config;
use crate::error::DocError;
use crate::identity::{HmacTokenVerifier, IdentityProvider};
use crate::llm;
use crate::manager::DocumentStoreManager;
use crate::models::{
    AnswerResponse, CleanupReport, DeleteReport, DocumentSummary, StatusReport, UploadReceipt,
};

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_SLACK_BYTES: usize = 64 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DocumentStoreManager>,
    pub answerer: Arc<Answerer>,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build every collaborator from configuration.
    ///
    /// Fails if no auth secret is configured, or if a provider cannot be
    /// initialised (for example a missing API key).
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let secret = config.server.resolved_auth_secret().ok_or_else(|| {
            anyhow::anyhow!("server.auth_secret (or DOCQA_AUTH_SECRET) must be set to serve")
        })?;
        let identity: Arc<dyn IdentityProvider> = Arc::new(HmacTokenVerifier::new(secret)?);
        let manager = DocumentStoreManager::from_config(config).await?;
        let model = llm::create_model(&config.llm)?;
        let answerer = Arc::new(Answerer::new(
            Arc::clone(&manager),
            model,
            config.retrieval.clone(),
        ));
        Ok(Self {
            manager,
            answerer,
            identity,
            config: Arc::new(config.clone()),
        })
    }
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = build_router(state)?;

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(
        bind = %bind_addr,
        embedding = %config.embedding.provider,
        llm = %config.llm.provider,
        metadata = %config.metadata.backend,
        "docqa server listening"
    );
    if !config.embedding.is_enabled() {
        tracing::warn!("embedding provider is disabled; every upload will end in status=error");
    }
    axum::serve(listener, app).await?;

    Ok(())
}

/// Assemble routes, body limit, CORS and request tracing.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let cors = cors_layer(&state.config.server.cors_origins)?;
    let body_limit = state.config.upload.max_upload_bytes + MULTIPART_SLACK_BYTES;

    Ok(Router::new()
        .route("/health", get(handle_health))
        .route("/document", get(handle_list))
        .route("/document/upload", post(handle_upload))
        .route("/document/ask", post(handle_ask))
        .route("/document/chat", post(handle_chat))
        .route("/document/cleanup", post(handle_cleanup))
        .route("/document/{id}/status", get(handle_status))
        .route("/document/{id}", delete(handle_delete))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).map_err(|e| anyhow::anyhow!("invalid CORS origin '{}': {}", o, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(values)))
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

/// Error type that renders as the JSON error contract.
pub struct AppError {
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

pub fn status_for(err: &DocError) -> StatusCode {
    match err {
        DocError::Validation(_) | DocError::UnsupportedFileType { .. } => StatusCode::BAD_REQUEST,
        DocError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        DocError::Forbidden => StatusCode::FORBIDDEN,
        DocError::NotFound | DocError::VectorStoreMissing => StatusCode::NOT_FOUND,
        DocError::StillProcessing => StatusCode::ACCEPTED,
        DocError::AnswerGeneration(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DocError> for AppError {
    fn from(err: DocError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Authentication ============

/// The authenticated caller, resolved from the bearer token.
pub struct CurrentUser(pub String);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::from(DocError::Unauthenticated("missing bearer token".into())))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| AppError::from(DocError::Unauthenticated("expected a bearer token".into())))?;
        let user_id = state.identity.authenticate(token).await?;
        Ok(CurrentUser(user_id))
    }
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

// ============ Documents ============

async fn handle_upload(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| AppError {
            status: e.status(),
            code: "bad_request".to_string(),
            message: e.body_text(),
        })?;
        let (receipt, _handle) = state
            .manager
            .upload(bytes.to_vec(), &filename, &user_id)
            .await?;
        return Ok(Json(receipt));
    }
    Err(bad_request("multipart field 'file' is required"))
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentSummary>,
}

async fn handle_list(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.manager.list(&user_id).await?;
    Ok(Json(DocumentListResponse { documents }))
}

async fn handle_status(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.manager.status(&id, &user_id).await?))
}

async fn handle_delete(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<DeleteReport>, AppError> {
    Ok(Json(state.manager.delete(&id, &user_id).await?))
}

async fn handle_cleanup(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
) -> Result<Json<CleanupReport>, AppError> {
    Ok(Json(state.manager.cleanup_orphans().await?))
}

// ============ Questions ============

#[derive(Deserialize)]
struct AskBody {
    question: String,
    task_id: String,
}

async fn handle_ask(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<AskBody>,
) -> Result<Json<AnswerResponse>, AppError> {
    let retrieval = state.answerer.retrieval();
    let request = AskRequest {
        question: body.question,
        document_id: body.task_id,
        use_mmr: retrieval.use_mmr,
        k: retrieval.default_k,
    };
    Ok(Json(state.answerer.answer(&request, &user_id).await?))
}

#[derive(Deserialize)]
struct ChatBody {
    question: String,
    #[serde(default)]
    document_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    use_mmr: Option<bool>,
    #[serde(default)]
    k: Option<usize>,
}

async fn handle_chat(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(body): Json<ChatBody>,
) -> Result<Json<AnswerResponse>, AppError> {
    let document_id = body
        .document_id
        .or(body.task_id)
        .ok_or_else(|| bad_request("document_id is required"))?;
    let retrieval = state.answerer.retrieval();
    let request = AskRequest {
        question: body.question,
        document_id,
        use_mmr: body.use_mmr.unwrap_or(retrieval.use_mmr),
        k: body.k.unwrap_or(retrieval.default_k),
    };
    Ok(Json(state.answerer.answer(&request, &user_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_contract() {
        assert_eq!(status_for(&DocError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&DocError::StillProcessing), StatusCode::ACCEPTED);
        assert_eq!(status_for(&DocError::VectorStoreMissing), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&DocError::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&DocError::AnswerGeneration("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&DocError::Metadata("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn cors_rejects_invalid_origin() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["https://app.example.com".to_string()]).is_ok());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }
}
