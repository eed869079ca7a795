//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness plus a database round-trip |
//! | `GET`  | `/status` | Connection, entry count, enabled modules |
//! | `POST` | `/search` | Run a search in any enabled mode |
//! | `GET`  | `/entries/{id}` | Fetch one entry |
//! | `GET`  | `/embedding-tables` | Embedding tables with row counts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "module_disabled", "message": "Module 'semantic' is not enabled ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `module_disabled` (400),
//! `configuration_error` (400), `not_found` (404), `upstream_error` (502),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ArielError;
use crate::models::{EmbeddingTableInfo, Entry, SearchMode, SearchParams, SearchResponse};
use crate::service::SearchService;
use crate::status::ServiceStatus;

/// Build the router over a ready service.
pub fn router(service: SearchService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/search", post(handle_search))
        .route("/entries/{id}", get(handle_get_entry))
        .route("/embedding-tables", get(handle_embedding_tables))
        .layer(cors)
        .with_state(service)
}

/// Serve on `server.bind` until the process is terminated.
pub async fn run_server(service: SearchService) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "ariel server listening");
    axum::serve(listener, router(service)).await?;
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

impl From<ArielError> for AppError {
    fn from(err: ArielError) -> Self {
        let message = err.to_string();
        match err {
            ArielError::ModuleNotEnabled { .. } => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "module_disabled",
                message,
            },
            ArielError::Configuration(_) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "configuration_error",
                message,
            },
            ArielError::InvalidArguments(_) => bad_request(message),
            ArielError::EntryNotFound(_) => not_found(message),
            ArielError::Embedding(_) | ArielError::Reasoning(_) | ArielError::Http(_) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream_error",
                message,
            },
            _ => {
                tracing::error!(error = %message, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message,
                }
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    message: String,
}

async fn handle_health(State(service): State<SearchService>) -> Response {
    let (healthy, message) = service.health_check().await;
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        message,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ============ GET /status ============

async fn handle_status(State(service): State<SearchService>) -> Json<ServiceStatus> {
    Json(service.get_status().await)
}

// ============ POST /search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    mode: Option<SearchMode>,
    #[serde(flatten)]
    params: SearchParams,
}

async fn handle_search(
    State(service): State<SearchService>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.params.max_results == 0 {
        return Err(bad_request("max_results must be >= 1"));
    }
    let mode = req.mode.unwrap_or(SearchMode::Keyword);
    let response = service.search(&req.query, mode, &req.params).await?;
    Ok(Json(response))
}

// ============ GET /entries/{id} ============

async fn handle_get_entry(
    State(service): State<SearchService>,
    Path(id): Path<String>,
) -> Result<Json<Entry>, AppError> {
    service
        .repo()
        .get_entry(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("entry not found: {}", id)))
}

// ============ GET /embedding-tables ============

#[derive(Serialize)]
struct EmbeddingTablesResponse {
    tables: Vec<EmbeddingTableInfo>,
}

async fn handle_embedding_tables(
    State(service): State<SearchService>,
) -> Result<Json<EmbeddingTablesResponse>, AppError> {
    let tables = service.repo().get_embedding_tables().await?;
    Ok(Json(EmbeddingTablesResponse { tables }))
}
