//! HTTP and WebSocket server implementation using Axum.

use crate::evaluate::{EvaluationReport, EvaluationRequest};
use crate::registry::SandboxHandle;
use crate::state::AppState;
use crate::store::ActiveSession;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}

// Request/Response types
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalQuery {
    user_id: Option<String>,
    terminal_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxRequest {
    user_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveFileRequest {
    user_id: Option<String>,
    filename: String,
    #[serde(default)]
    file_path: Option<String>,
    code: String,
    /// `"base64"` when `code` carries binary content.
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Serialize)]
struct SaveFileResponse {
    success: bool,
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameRequest {
    user_id: Option<String>,
    old_path: String,
    new_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesQuery {
    user_id: Option<String>,
    cwd: Option<String>,
    filename: Option<String>,
}

#[derive(Serialize)]
struct ListFilesResponse {
    files: Vec<String>,
}

#[derive(Serialize)]
struct ReadFileResponse {
    code: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignModuleRequest {
    module_id: String,
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssignModuleResponse {
    session_id: String,
    module_id: String,
    student_count: u64,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Browser terminal
        .route("/ws/terminal", get(terminal))
        // Editor actions
        .route("/api/sandbox", post(ensure_sandbox))
        .route("/api/save-file", post(save_file))
        .route("/api/rename-file", post(rename_file))
        .route("/api/list-files", get(list_files))
        .route("/api/read-file", get(read_file))
        .route("/api/run-evaluate", post(run_evaluate))
        // Teacher dashboard
        .route("/api/sessions/active", get(active_sessions))
        .route("/api/sessions/assign-module", post(assign_module))
        // Health check
        .route("/health", get(health))
        .layer(middleware::from_fn(pass_through_auth))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server on the configured address until SIGINT or SIGTERM.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.bind_address, state.config.server.port
    )
    .parse()
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_until(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `signal` completes, then end every open terminal.
pub async fn serve_until<F>(
    listener: tokio::net::TcpListener,
    state: AppState,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bridge = state.bridge.clone();
    let grace = state.config.server.shutdown_grace();

    let ending = bridge.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            info!(terminals = ending.terminals().len(), "Shutting down, ending open terminals");
            ending.shutdown();
        })
        .await?;

    if !bridge.drain(grace).await {
        warn!(
            terminals = bridge.terminals().len(),
            "Terminals still attached after the shutdown grace period"
        );
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(%err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

/// Authentication placeholder: requests are never rejected.
async fn pass_through_auth(request: Request, next: Next) -> Response {
    let has_token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer "));
    if !has_token {
        debug!(path = %request.uri().path(), "No auth token provided, continuing");
    }
    next.run(request).await
}

fn user_or_default(state: &AppState, user_id: Option<String>) -> String {
    user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.config.server.default_user_id.clone())
}

async fn prepare_sandbox(state: &AppState, user_id: &str) -> Result<SandboxHandle, ApiError> {
    state.registry.ensure_sandbox(user_id).await.map_err(|e| {
        if e.is_creation_race() {
            api_error(StatusCode::CONFLICT, "Sandbox is being created, retry shortly")
        } else {
            error!(user_id, error = %e, "Failed to ensure sandbox");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Sandbox unavailable")
        }
    })
}

async fn health() -> &'static str {
    "OK"
}

async fn terminal(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = user_or_default(&state, query.user_id);
    let terminal_id = query
        .terminal_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| async move {
        state.bridge.serve(socket, user_id, terminal_id).await;
    })
}

async fn ensure_sandbox(
    State(state): State<AppState>,
    Json(req): Json<SandboxRequest>,
) -> Result<Json<SandboxHandle>, ApiError> {
    let user_id = user_or_default(&state, req.user_id);
    let handle = prepare_sandbox(&state, &user_id).await?;
    Ok(Json(handle))
}

async fn save_file(
    State(state): State<AppState>,
    Json(req): Json<SaveFileRequest>,
) -> Result<Json<SaveFileResponse>, ApiError> {
    let user_id = user_or_default(&state, req.user_id);
    let path = req
        .file_path
        .filter(|path| !path.is_empty())
        .unwrap_or(req.filename);

    let content = match req.encoding.as_deref() {
        Some("base64") => base64::engine::general_purpose::STANDARD
            .decode(req.code.as_bytes())
            .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid base64 content"))?,
        Some(other) if other != "utf8" && other != "utf-8" => {
            return Err(api_error(StatusCode::BAD_REQUEST, "Unsupported encoding"))
        }
        _ => req.code.into_bytes(),
    };

    prepare_sandbox(&state, &user_id).await?;
    let written = state
        .sync
        .push(&user_id, &path, &content)
        .await
        .map_err(|e| {
            error!(user_id, path, error = %e, "Failed to save file");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save file")
        })?;

    Ok(Json(SaveFileResponse {
        success: true,
        path: written,
    }))
}

async fn rename_file(
    State(state): State<AppState>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let user_id = user_or_default(&state, req.user_id);
    prepare_sandbox(&state, &user_id).await?;
    state
        .sync
        .rename(&user_id, &req.old_path, &req.new_path)
        .await
        .map_err(|e| {
            error!(user_id, old = req.old_path, new = req.new_path, error = %e, "Failed to rename file");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to rename file")
        })?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ListFilesResponse>, ApiError> {
    let user_id = user_or_default(&state, query.user_id);
    let cwd = query.cwd.filter(|cwd| !cwd.is_empty());
    prepare_sandbox(&state, &user_id).await?;
    let files = state
        .sync
        .list(&user_id, cwd.as_deref())
        .await
        .map_err(|e| {
            error!(user_id, ?cwd, error = %e, "Failed to list files");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list files")
        })?;
    Ok(Json(ListFilesResponse { files }))
}

async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<ReadFileResponse>, ApiError> {
    let user_id = user_or_default(&state, query.user_id);
    let filename = query
        .filename
        .filter(|name| !name.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Filename is required"))?;
    let path = match query.cwd.filter(|cwd| !cwd.is_empty()) {
        Some(cwd) => format!("{}/{}", cwd.trim_end_matches('/'), filename.trim_start_matches('/')),
        None => filename,
    };

    prepare_sandbox(&state, &user_id).await?;
    let code = state.sync.read(&user_id, &path).await.map_err(|e| {
        error!(user_id, path, error = %e, "Failed to read file");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file")
    })?;
    Ok(Json(ReadFileResponse { code }))
}

async fn run_evaluate(
    State(state): State<AppState>,
    Json(mut req): Json<EvaluationRequest>,
) -> Result<Json<EvaluationReport>, ApiError> {
    req.user_id = user_or_default(&state, Some(std::mem::take(&mut req.user_id)));
    info!(user_id = req.user_id, script = req.evaluation_script_name, "POST /api/run-evaluate");

    prepare_sandbox(&state, &req.user_id).await?;
    let report = state.evaluator.run_and_evaluate(&req).await.map_err(|e| {
        error!(user_id = req.user_id, error = %e, "Evaluation failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Evaluation failed")
    })?;
    Ok(Json(report))
}

async fn active_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<ActiveSession>>, ApiError> {
    let since = chrono::Utc::now() - chrono::Duration::days(1);
    let sessions = state.store.active_sessions(since).await.map_err(|e| {
        error!(error = %e, "Failed to list active sessions");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list sessions")
    })?;
    Ok(Json(sessions))
}

async fn assign_module(
    State(state): State<AppState>,
    Json(req): Json<AssignModuleRequest>,
) -> Result<Json<AssignModuleResponse>, ApiError> {
    if req.module_id.is_empty() || req.session_id.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Module ID and session ID are required",
        ));
    }
    let student_count = state
        .store
        .assign_module(&req.session_id, &req.module_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to assign module");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to assign module")
        })?;
    if student_count == 0 {
        return Err(api_error(StatusCode::NOT_FOUND, "Session not found"));
    }
    Ok(Json(AssignModuleResponse {
        session_id: req.session_id,
        module_id: req.module_id,
        student_count,
    }))
}
