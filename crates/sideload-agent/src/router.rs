//! HTTP request routing.
//!
//! | Method | Path            | Operation                    |
//! |--------|-----------------|------------------------------|
//! | GET    | `/files`        | list the sandbox             |
//! | PUT    | `/files/{path}` | upload one file              |
//! | DELETE | `/files/{path}` | delete one file (idempotent) |
//! | GET    | `/application`  | managed application status   |
//! | POST   | `/application`  | start the application        |
//! | DELETE | `/application`  | stop the application         |
//!
//! Anything else is answered with 404.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use sideload::{
    ApplicationStatus, FileRecord, FileStore, ProcessError, ProcessManager, RelativePath,
    StoreError, parse_timestamp,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AgentConfig;

/// Header carrying the modification time of an uploaded file.
pub const MTIME_HEADER: &str = "mtime";

/// State shared by every connection.
#[derive(Debug)]
pub struct AgentState {
    /// Sandbox file store
    pub store: FileStore,
    /// Managed application slot
    pub processes: ProcessManager,
}

impl AgentState {
    /// Build state from configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            store: FileStore::new(&config.sideload_dir),
            processes: ProcessManager::new(config.entrypoints(), config.launchers()),
        }
    }
}

/// Error answered to the operator tool.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown route or missing resource
    #[error("{0}")]
    NotFound(String),
    /// Request conflicts with the application state
    #[error("{0}")]
    Conflict(String),
    /// Malformed path, header or body
    #[error("{0}")]
    BadRequest(String),
    /// Disk or process failure on the device
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(_)
            | StoreError::OutsideRoot(_)
            | StoreError::InvalidTimestamp(_) => Self::BadRequest(err.to_string()),
            StoreError::Io(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::AlreadyRunning { .. } | ProcessError::NotRunning => {
                Self::Conflict(err.to_string())
            }
            ProcessError::NoEntrypoint { .. } => Self::NotFound(err.to_string()),
            ProcessError::UnsupportedEntrypoint(_)
            | ProcessError::Spawn { .. }
            | ProcessError::Kill(_) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(status = status.as_u16(), "{}", self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the request router.
pub fn router(state: Arc<AgentState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/files", get(list_files).fallback(not_found))
        .route(
            "/files/{*path}",
            put(upload_file).delete(delete_file).fallback(not_found),
        )
        .route(
            "/application",
            get(application_status)
                .post(start_application)
                .delete(stop_application)
                .fallback(not_found),
        )
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn log_request(request: Request, next: Next) -> Response {
    info!(method = %request.method(), path = %request.uri().path(), "Request");
    next.run(request).await
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Resource not found".to_string())
}

fn ack() -> Json<Value> {
    Json(json!({}))
}

async fn list_files(State(state): State<Arc<AgentState>>) -> Result<Json<Vec<FileRecord>>, ApiError> {
    let records = state.store.list().await?;
    Ok(Json(records))
}

async fn upload_file(
    State(state): State<Arc<AgentState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = RelativePath::parse(&path)?;
    let mtime = headers
        .get(MTIME_HEADER)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {MTIME_HEADER} header")))?
        .to_str()
        .map_err(|_| ApiError::BadRequest(format!("{MTIME_HEADER} header is not ASCII")))?;
    let modified = parse_timestamp(mtime)?;

    let record = state.store.write(&path, body.to_vec(), modified).await?;
    info!(path = %path, bytes = record.size, "File written");
    Ok(ack())
}

async fn delete_file(
    State(state): State<Arc<AgentState>>,
    Path(path): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = RelativePath::parse(&path)?;
    if state.store.delete(&path).await? {
        info!(path = %path, "File deleted");
    } else {
        info!(path = %path, "File to delete not found");
    }
    Ok(ack())
}

async fn application_status(State(state): State<Arc<AgentState>>) -> Json<ApplicationStatus> {
    Json(state.processes.status().await)
}

async fn start_application(State(state): State<Arc<AgentState>>) -> Result<Json<Value>, ApiError> {
    state.processes.start().await?;
    Ok(ack())
}

async fn stop_application(State(state): State<Arc<AgentState>>) -> Result<Json<Value>, ApiError> {
    state.processes.stop().await?;
    Ok(ack())
}
