//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::interval;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::SandboxError;
use crate::executor::{CommandOutput, FileNode, ListOptions};
use crate::handle::HandleSummary;
use crate::provisioner::Language;
use crate::state::AppState;

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_AFTER_SECS: &str = "5";

// Request/Response types
#[derive(Deserialize, Default)]
struct CreateSandboxRequest {
    language: Option<String>,
}

#[derive(Serialize)]
struct TerminateResponse {
    terminated: bool,
}

#[derive(Deserialize)]
struct RunRequest {
    command: String,
    workdir: Option<String>,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct WriteFileResponse {
    success: bool,
}

#[derive(Deserialize)]
struct ReadFileQuery {
    path: String,
}

#[derive(Serialize)]
struct ReadFileResponse {
    success: bool,
    content: String,
}

#[derive(Deserialize)]
struct TreeQuery {
    root: Option<String>,
    max_depth: Option<usize>,
    max_files: Option<usize>,
}

/// Error body returned by every handler.
pub enum ApiError {
    BadRequest(String),
    Sandbox(SandboxError),
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self::Sandbox(err)
    }
}

fn status_for(err: &SandboxError) -> StatusCode {
    match err {
        SandboxError::LockTimeout { .. } | SandboxError::Provision(_) | SandboxError::Store(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
        SandboxError::ReadTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SandboxError::Exec(_) => StatusCode::BAD_GATEWAY,
        SandboxError::Write { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            Self::BadRequest(message) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": message, "retryable": false })))
                    .into_response();
            }
            Self::Sandbox(err) => err,
        };

        let status = status_for(&err);
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %err, "request failed");
        }
        let body = json!({ "error": err.public_message(), "retryable": err.is_retryable() });
        let mut response = (status, Json(body)).into_response();
        if matches!(err, SandboxError::LockTimeout { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

/// Build the router. Split out from [`run_server`] so tests can drive it.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(
            "/sessions/:id/sandbox",
            post(create_sandbox).delete(terminate_sandbox),
        )
        .route("/sessions/:id/run", post(run_command))
        .route("/sessions/:id/files", get(read_file).put(write_file))
        .route("/sessions/:id/tree", get(file_tree))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    // Spawn idle reaper
    let manager = state.manager.clone();
    tokio::spawn(async move {
        let mut interval = interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            let reaped = manager.reap_idle().await;
            if reaped > 0 {
                info!(reaped, "terminated idle sandboxes");
            }
        }
    });

    let app = build_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn create_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CreateSandboxRequest>>,
) -> Result<Json<HandleSummary>, ApiError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let language = request.language.as_deref().map(Language::parse);
    let handle = state.manager.get_or_create(&id, language).await?;
    Ok(Json(handle.summary()))
}

async fn terminate_sandbox(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<TerminateResponse> {
    let terminated = state.executor.terminate(&id).await;
    Json(TerminateResponse { terminated })
}

async fn run_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<Json<CommandOutput>, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    let output = state
        .executor
        .run_command(&id, &req.command, req.workdir.as_deref())
        .await?;
    Ok(Json(output))
}

async fn write_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WriteFileRequest>,
) -> Result<Json<WriteFileResponse>, ApiError> {
    state
        .executor
        .write_file(&id, &req.path, req.content.as_bytes())
        .await?;
    Ok(Json(WriteFileResponse { success: true }))
}

async fn read_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadFileQuery>,
) -> Result<Json<ReadFileResponse>, ApiError> {
    let bytes = state.executor.read_file(&id, &query.path).await?;
    Ok(Json(ReadFileResponse {
        success: true,
        content: String::from_utf8_lossy(&bytes).into_owned(),
    }))
}

async fn file_tree(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TreeQuery>,
) -> Result<Json<Vec<FileNode>>, ApiError> {
    let options = ListOptions::new(query.max_depth, query.max_files);
    let nodes = state
        .executor
        .list_files(&id, query.root.as_deref(), options)
        .await?;
    Ok(Json(nodes))
}
