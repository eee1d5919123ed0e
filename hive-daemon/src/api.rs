use crate::app::approvals::ApprovalError;
use crate::app::supervisor::SupervisorError;
use crate::domain::session::SessionId;
use crate::stream::sse_response;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hive_protocol::{
    ApprovalsResponse, DecideRequest, ErrorBody, ExitRequest, HealthResponse, OkResponse,
    SendMessageRequest, SessionSnapshot, SessionsResponse, StartSessionRequest, StreamFilter,
};
use serde::Deserialize;
use tracing::{info, warn};

const DEFAULT_TAIL_LINES: usize = 100;
const DEFAULT_EVENT_LIMIT: usize = 1000;

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(self.body);
        (status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::invalid("invalid_request", rejection.body_text())
    }
}

fn supervisor_error(err: SupervisorError) -> ApiError {
    match err {
        SupervisorError::Invalid(message) => ApiError::invalid("invalid_request", message),
        SupervisorError::NotFound(id) => {
            ApiError::not_found("session_not_found", format!("session {id} not found"))
        }
        SupervisorError::Transition(err) => ApiError::invalid("invalid_transition", err.to_string()),
        SupervisorError::Approval(err @ ApprovalError::NotFound { .. }) => {
            ApiError::not_found("approval_not_found", err.to_string())
        }
        SupervisorError::Approval(err) => ApiError::invalid("approval_conflict", err.to_string()),
        err @ SupervisorError::Spawn { .. } => ApiError::internal("spawn_failed", err.to_string()),
        SupervisorError::Internal(message) => ApiError::internal("internal_error", message),
    }
}

/// A malformed id cannot name a session, so it is reported like an unknown
/// one.
fn session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found("session_not_found", format!("session {raw} not found")))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Rejects requests without the daemon's bearer token before any handler runs.
pub(crate) async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = bearer_token(request.headers())
        .is_some_and(|presented| state.token().matches(presented));
    if !authorized {
        warn!(path = %request.uri().path(), "rejected request without valid token");
        return Err(ApiError::unauthorized(
            "unauthorized",
            "missing or invalid bearer token",
        ));
    }
    Ok(next.run(request).await)
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: hive_version::hive_version().to_string(),
        pid: std::process::id(),
    })
}

pub(crate) async fn shutdown(State(state): State<AppState>) -> Json<OkResponse> {
    info!("msg" = "shutdown requested over the control API");
    state.request_shutdown();
    Json(OkResponse::ok())
}

pub(crate) async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.supervisor().list().await,
    })
}

pub(crate) async fn start_session(
    State(state): State<AppState>,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let Json(request) = payload?;
    let session = state
        .supervisor()
        .start(request)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(session))
}

pub(crate) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = session_id(&id)?;
    let session = state.supervisor().get(&id).await.map_err(supervisor_error)?;
    Ok(Json(session))
}

pub(crate) async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = session_id(&id)?;
    let session = state.supervisor().kill(&id).await.map_err(supervisor_error)?;
    Ok(Json(session))
}

pub(crate) async fn interrupt_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id(&id)?;
    state
        .supervisor()
        .interrupt(&id)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(OkResponse::ok()))
}

pub(crate) async fn mark_exited(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Option<Json<ExitRequest>>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = session_id(&id)?;
    let exit_code = payload.and_then(|Json(request)| request.exit_code);
    let session = state
        .supervisor()
        .mark_exited(&id, exit_code)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(session))
}

pub(crate) async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id(&id)?;
    let Json(request) = payload?;
    state
        .supervisor()
        .send_message(&id, &request.text)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(OkResponse::ok()))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TailQuery {
    lines: Option<usize>,
    stream: Option<String>,
    follow: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct FeedQuery {
    limit: Option<usize>,
    follow: Option<String>,
}

fn follow_requested(value: Option<&str>) -> bool {
    matches!(
        value.map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes")
    )
}

pub(crate) async fn tail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Response, ApiError> {
    let id = session_id(&id)?;
    let stream = match query.stream.as_deref() {
        Some(raw) => raw
            .parse::<StreamFilter>()
            .map_err(|err| ApiError::invalid("invalid_stream", err))?,
        None => StreamFilter::default(),
    };
    let supervisor = state.supervisor();
    if follow_requested(query.follow.as_deref()) {
        let subscription = supervisor
            .subscribe_logs(&id, stream, query.lines.unwrap_or(0))
            .await
            .map_err(supervisor_error)?;
        return Ok(sse_response(subscription, state.shutdown_watch()).into_response());
    }
    let lines = supervisor
        .tail(&id, query.lines.unwrap_or(DEFAULT_TAIL_LINES), stream)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(lines).into_response())
}

pub(crate) async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response, ApiError> {
    let id = session_id(&id)?;
    let supervisor = state.supervisor();
    if follow_requested(query.follow.as_deref()) {
        let subscription = supervisor
            .subscribe_events(&id, query.limit.unwrap_or(0))
            .await
            .map_err(supervisor_error)?;
        return Ok(sse_response(subscription, state.shutdown_watch()).into_response());
    }
    let events = supervisor
        .events(&id, query.limit.unwrap_or(DEFAULT_EVENT_LIMIT))
        .await
        .map_err(supervisor_error)?;
    Ok(Json(events).into_response())
}

pub(crate) async fn items(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FeedQuery>,
) -> Result<Response, ApiError> {
    let id = session_id(&id)?;
    let supervisor = state.supervisor();
    if follow_requested(query.follow.as_deref()) {
        let subscription = supervisor
            .subscribe_items(&id, query.limit.unwrap_or(0))
            .await
            .map_err(supervisor_error)?;
        return Ok(sse_response(subscription, state.shutdown_watch()).into_response());
    }
    let items = supervisor
        .items(&id, query.limit.unwrap_or(DEFAULT_EVENT_LIMIT))
        .await
        .map_err(supervisor_error)?;
    Ok(Json(items).into_response())
}

pub(crate) async fn list_approvals(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApprovalsResponse>, ApiError> {
    let id = session_id(&id)?;
    let approvals = state
        .supervisor()
        .list_approvals(&id)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(ApprovalsResponse { approvals }))
}

pub(crate) async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DecideRequest>, JsonRejection>,
) -> Result<Json<OkResponse>, ApiError> {
    let id = session_id(&id)?;
    let Json(request) = payload?;
    state
        .supervisor()
        .decide_approval(&id, request)
        .await
        .map_err(supervisor_error)?;
    Ok(Json(OkResponse::ok()))
}
