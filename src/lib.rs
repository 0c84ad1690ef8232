pub mod application;
pub mod domain;
pub mod infrastructure;

use application::commands::{
    complete_session_impl, get_current_session_impl, heartbeat_impl, pause_session_impl,
    rename_session_impl, resume_session_impl, scheduled_rollover_impl, start_session_impl,
    stop_session_impl, AppState, CommandError, CompleteSessionResponse, HeartbeatResponse,
};
use application::error::SessionError;
use application::rollover::ScheduledRolloverResult;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use domain::models::SessionView;
use infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const OWNER_HEADER: &str = "x-user-id";
const WORKSPACE_ENV: &str = "LOCKED_IN_WORKSPACE";

type SharedState = Arc<AppState>;
type ApiResult<T> = Result<Json<OkResponse<T>>, CommandError>;

#[derive(Debug, Serialize)]
pub struct OkResponse<T> {
    ok: bool,
    data: T,
}

fn ok<T>(data: T) -> Json<OkResponse<T>> {
    Json(OkResponse { ok: true, data })
}

#[derive(Debug, Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest {
    label: String,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameSessionRequest {
    session_id: String,
    label: String,
}

fn error_status(code: &str) -> StatusCode {
    match code {
        "validation_error" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_state" => StatusCode::CONFLICT,
        "collaborator_error" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        (error_status(self.error), Json(self)).into_response()
    }
}

fn unauthorized(message: &str) -> CommandError {
    CommandError {
        ok: false,
        error: "unauthorized",
        message: message.to_string(),
    }
}

fn owner_from(headers: &HeaderMap) -> Result<String, CommandError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| unauthorized("missing x-user-id header"))
}

/// Unwraps a JSON body, reporting malformed or incomplete bodies in the
/// same envelope as every other validation failure.
fn request_body<T>(
    state: &AppState,
    command: &str,
    payload: Result<Json<T>, JsonRejection>,
) -> Result<T, CommandError> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(rejection) => Err(state.command_error(
            command,
            SessionError::Validation(rejection.body_text()),
        )),
    }
}

async fn health() -> Json<OkResponse<HealthInfo>> {
    ok(HealthInfo {
        service: "locked-in",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn current_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<Option<SessionView>> {
    let owner = owner_from(&headers)?;
    get_current_session_impl(&state, owner)
        .await
        .map(ok)
        .map_err(|error| state.command_error("get_current_session", error))
}

async fn start_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> ApiResult<SessionView> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "start_session", payload)?;
    start_session_impl(&state, owner, request.label, request.mode)
        .await
        .map(ok)
        .map_err(|error| state.command_error("start_session", error))
}

async fn pause_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<SessionView> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "pause_session", payload)?;
    pause_session_impl(&state, owner, request.session_id)
        .await
        .map(ok)
        .map_err(|error| state.command_error("pause_session", error))
}

async fn resume_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<SessionView> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "resume_session", payload)?;
    resume_session_impl(&state, owner, request.session_id)
        .await
        .map(ok)
        .map_err(|error| state.command_error("resume_session", error))
}

async fn stop_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<SessionView> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "stop_session", payload)?;
    stop_session_impl(&state, owner, request.session_id)
        .await
        .map(ok)
        .map_err(|error| state.command_error("stop_session", error))
}

async fn complete_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> ApiResult<CompleteSessionResponse> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "complete_session", payload)?;
    complete_session_impl(&state, owner, request.session_id)
        .await
        .map(ok)
        .map_err(|error| state.command_error("complete_session", error))
}

async fn rename_session(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<RenameSessionRequest>, JsonRejection>,
) -> ApiResult<SessionView> {
    let owner = owner_from(&headers)?;
    let request = request_body(&state, "rename_session", payload)?;
    rename_session_impl(&state, owner, request.session_id, request.label)
        .await
        .map(ok)
        .map_err(|error| state.command_error("rename_session", error))
}

async fn heartbeat(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<HeartbeatResponse> {
    let owner = owner_from(&headers)?;
    heartbeat_impl(&state, owner)
        .await
        .map(ok)
        .map_err(|error| state.command_error("heartbeat", error))
}

async fn scheduled_rollover(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> ApiResult<ScheduledRolloverResult> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);

    match scheduled_rollover_impl(&state, authorization).await {
        Ok(ScheduledRolloverResult::Unauthorized) => Err(unauthorized("invalid rollover secret")),
        Ok(result) => Ok(ok(result)),
        Err(error) => Err(state.command_error("scheduled_rollover", error)),
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/current", get(current_session))
        .route("/sessions/start", post(start_session))
        .route("/sessions/pause", post(pause_session))
        .route("/sessions/resume", post(resume_session))
        .route("/sessions/stop", post(stop_session))
        .route("/sessions/complete", post(complete_session))
        .route("/sessions/rename", post(rename_session))
        .route("/heartbeat", post(heartbeat))
        .route("/cron/rollover", get(scheduled_rollover).post(scheduled_rollover))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

pub async fn run() -> Result<(), InfraError> {
    let workspace_root = match std::env::var_os(WORKSPACE_ENV) {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    let state = Arc::new(AppState::new(workspace_root)?);
    let listen = state.listen_address().to_string();

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(
        listen = %listen,
        database = %state.database_path().display(),
        "locked-in listening"
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
