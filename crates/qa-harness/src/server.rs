//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/knowledge-bases` | Create a knowledge base and build it |
//! | `GET`  | `/knowledge-bases/{id}` | State and build summary |
//! | `POST` | `/knowledge-bases/{id}/build` | Rebuild from fresh inputs |
//! | `POST` | `/knowledge-bases/{id}/test-cases` | Generate test cases for a query |
//! | `POST` | `/knowledge-bases/{id}/scripts` | Generate a Selenium script for a test case |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "knowledge base 'kb1' is not ready (state: empty)" } }
//! ```
//!
//! | Status | Codes |
//! |--------|-------|
//! | 400 | `bad_request`, `chunking_failed` |
//! | 404 | `not_found`, `no_evidence` |
//! | 408 | `cancelled` |
//! | 409 | `not_ready`, `build_in_progress` |
//! | 422 | `grounding_failed`, `selector_grounding_failed` |
//! | 502 | `schema_parse`, `generation_unavailable` |
//! | 503 | `embedding_unavailable` |
//!
//! Builds run on their own task. When a client disconnects mid-build the
//! build is cancelled and the knowledge base keeps its previous state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use parking_lot::RwLock;
use qa_harness_core::models::{AutomationScript, SourceDocument, TestCase};
use qa_harness_core::QaError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::{Config, ServerConfig};
use crate::extract::{extract_document, parse_markup};
use crate::knowledge_base::{BuildSummary, KbStatus, KnowledgeBase, MarkupPage};
use crate::orchestrator::{GeneratedTestCases, TestCaseRequest};
use crate::pipeline::Pipeline;

const DEFAULT_MARKUP_ID: &str = "page.html";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    knowledge_bases: Arc<RwLock<HashMap<String, Arc<KnowledgeBase>>>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            knowledge_bases: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn knowledge_base(&self, id: &str) -> Result<Arc<KnowledgeBase>, AppError> {
        self.knowledge_bases
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(format!("no knowledge base with id: {}", id)))
    }
}

/// The API router with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.pipeline.config().server);
    Router::new()
        .route("/health", get(handle_health))
        .route("/knowledge-bases", post(handle_create))
        .route("/knowledge-bases/{id}", get(handle_status))
        .route("/knowledge-bases/{id}/build", post(handle_build))
        .route("/knowledge-bases/{id}/test-cases", post(handle_test_cases))
        .route("/knowledge-bases/{id}/scripts", post(handle_script))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if server.allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = server
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Start the server on `[server].bind` and run until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::from_config(config.clone())?);
    let app = router(AppState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "QA Harness API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
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
pub struct AppError {
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

impl From<QaError> for AppError {
    fn from(err: QaError) -> Self {
        let (status, code) = match &err {
            QaError::Chunking { .. } => (StatusCode::BAD_REQUEST, "chunking_failed"),
            QaError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            QaError::NoEvidence { .. } => (StatusCode::NOT_FOUND, "no_evidence"),
            QaError::Cancelled { .. } => (StatusCode::REQUEST_TIMEOUT, "cancelled"),
            QaError::KnowledgeBaseNotReady { .. } | QaError::IndexNotReady => {
                (StatusCode::CONFLICT, "not_ready")
            }
            QaError::BuildInProgress { .. } => (StatusCode::CONFLICT, "build_in_progress"),
            QaError::GenerationGroundingFailed { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "grounding_failed")
            }
            QaError::SelectorGroundingFailed { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "selector_grounding_failed")
            }
            QaError::SchemaParse { .. } => (StatusCode::BAD_GATEWAY, "schema_parse"),
            QaError::GenerationUnavailable { .. } => (StatusCode::BAD_GATEWAY, "generation_unavailable"),
            QaError::EmbeddingUnavailable { .. } | QaError::DimensionMismatch { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "embedding_unavailable")
            }
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| bad_request(e.body_text()))
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

// ============ Build ============

/// One uploaded document. `content` is UTF-8 text, or base64 when
/// `encoding` is `"base64"` (PDF, DOCX).
#[derive(Debug, Deserialize)]
pub struct DocumentInput {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkupInput {
    #[serde(default)]
    pub name: Option<String>,
    pub html: String,
}

#[derive(Debug, Deserialize)]
pub struct BuildRequest {
    /// Knowledge base id on create; ignored on rebuild.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub documents: Vec<DocumentInput>,
    #[serde(default)]
    pub markup: Option<MarkupInput>,
}

#[derive(Serialize)]
struct BuildResponse {
    knowledge_base: KbStatus,
    build: BuildSummary,
}

fn decode_inputs(request: BuildRequest) -> Result<(Vec<SourceDocument>, Option<MarkupPage>), AppError> {
    let mut documents = Vec::with_capacity(request.documents.len());
    for doc in request.documents {
        if documents.iter().any(|d: &SourceDocument| d.id == doc.name) {
            return Err(bad_request(format!("duplicate document name: {}", doc.name)));
        }
        let bytes = match doc.encoding.as_deref() {
            None | Some("utf-8") | Some("text") => doc.content.into_bytes(),
            Some("base64") => base64::engine::general_purpose::STANDARD
                .decode(doc.content.trim())
                .map_err(|e| bad_request(format!("{}: invalid base64: {}", doc.name, e)))?,
            Some(other) => return Err(bad_request(format!("{}: unknown encoding '{}'", doc.name, other))),
        };
        let extracted =
            extract_document(&doc.name, &bytes).map_err(|e| bad_request(format!("{}: {}", doc.name, e)))?;
        documents.push(extracted);
    }
    let markup = match request.markup {
        Some(input) => {
            let root = parse_markup(&input.html).map_err(|e| bad_request(e.to_string()))?;
            Some(MarkupPage {
                id: input.name.unwrap_or_else(|| DEFAULT_MARKUP_ID.to_string()),
                root,
            })
        }
        None => None,
    };
    Ok((documents, markup))
}

/// Run a build on its own task; the token is cancelled if this future is
/// dropped before the build finishes.
async fn spawn_build(
    state: &AppState,
    kb: Arc<KnowledgeBase>,
    documents: Vec<SourceDocument>,
    markup: Option<MarkupPage>,
) -> Result<BuildResponse, AppError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let pipeline = Arc::clone(&state.pipeline);
    let task_kb = Arc::clone(&kb);
    let summary = tokio::spawn(async move {
        pipeline
            .build_knowledge_base(&task_kb, &documents, markup.as_ref(), &cancel)
            .await
    })
    .await
    .map_err(|e| AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: format!("build task failed: {}", e),
    })??;
    Ok(BuildResponse {
        knowledge_base: kb.status(),
        build: summary,
    })
}

async fn handle_create(
    State(state): State<AppState>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BuildResponse>), AppError> {
    let mut request = json_body(payload)?;
    let kb = match request.id.take() {
        Some(id) if id.trim().is_empty() => return Err(bad_request("id must not be empty")),
        Some(id) => KnowledgeBase::new(id.trim()),
        None => KnowledgeBase::with_random_id(),
    };
    let (documents, markup) = decode_inputs(request)?;

    let kb = {
        let mut registry = state.knowledge_bases.write();
        if registry.contains_key(kb.id()) {
            return Err(AppError {
                status: StatusCode::CONFLICT,
                code: "already_exists",
                message: format!("knowledge base '{}' already exists", kb.id()),
            });
        }
        let kb = Arc::new(kb);
        registry.insert(kb.id().to_string(), Arc::clone(&kb));
        kb
    };
    let response = spawn_build(&state, kb, documents, markup).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn handle_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<BuildRequest>, JsonRejection>,
) -> Result<Json<BuildResponse>, AppError> {
    let kb = state.knowledge_base(&id)?;
    let (documents, markup) = decode_inputs(json_body(payload)?)?;
    Ok(Json(spawn_build(&state, kb, documents, markup).await?))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KbStatus>, AppError> {
    Ok(Json(state.knowledge_base(&id)?.status()))
}

// ============ Generation ============

async fn handle_test_cases(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TestCaseRequest>, JsonRejection>,
) -> Result<Json<GeneratedTestCases>, AppError> {
    let kb = state.knowledge_base(&id)?;
    let request = json_body(payload)?;
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    Ok(Json(state.pipeline.query(&kb, &request, &cancel).await?))
}

#[derive(Debug, Deserialize)]
pub struct ScriptRequest {
    pub test_case: TestCase,
}

async fn handle_script(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ScriptRequest>, JsonRejection>,
) -> Result<Json<AutomationScript>, AppError> {
    let kb = state.knowledge_base(&id)?;
    let request = json_body(payload)?;
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    Ok(Json(
        state
            .pipeline
            .generate_script(&kb, &request.test_case, &cancel)
            .await?,
    ))
}
