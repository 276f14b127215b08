use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::{
    error::{Error, ErrorKind},
    journal,
    models::{NewServer, Server},
    server_config::ServerConfig,
    state::AppState,
};

const DEFAULT_LOG_LIMIT: usize = 200;
const DEFAULT_STATS_LIMIT: usize = 60;
const MAX_QUERY_LIMIT: usize = 5000;
const AGENT_RESTART_DELAY: Duration = Duration::from_millis(1000);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Core error translated to an HTTP response.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Internal => {
                tracing::error!("Request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetail {
    #[serde(flatten)]
    pub server: Server,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    pub players: Vec<String>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct JournalQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct CommandRequest {
    command: String,
}

pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/servers/{id}", get(get_server).delete(delete_server))
        .route("/api/servers/{id}/config", get(get_config).put(update_config))
        .route("/api/servers/{id}/start", post(start_server))
        .route("/api/servers/{id}/stop", post(stop_server))
        .route("/api/servers/{id}/restart", post(restart_server))
        .route("/api/servers/{id}/command", post(send_command))
        .route("/api/servers/{id}/install", post(install_server))
        .route("/api/servers/{id}/logs", get(server_logs))
        .route("/api/servers/{id}/stats", get(server_stats))
        .route("/api/installations", get(active_installations))
        .route("/api/system/journal", get(system_journal))
        .route("/api/system/restart", post(restart_agent))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .merge(authenticated)
        .route("/api/ws", get(events_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_session(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.sessions.get_session_from_handshake(req.headers()) {
        Some(_) => next.run(req).await,
        None => ApiError(Error::Unauthorized("missing or invalid session".to_string()))
            .into_response(),
    }
}

pub async fn list_servers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.lifecycle.list_servers()?))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(input): Json<NewServer>,
) -> ApiResult<impl IntoResponse> {
    let server = state.lifecycle.create_server(input).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn get_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let server = state.lifecycle.get_server(&id)?;
    Ok(Json(ServerDetail {
        running: state.lifecycle.is_running(&id),
        uptime_seconds: state.lifecycle.uptime(&id).map(|d| d.as_secs()),
        players: state.lifecycle.online_players(&id).await,
        server,
    }))
}

pub async fn delete_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.delete_server(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_config(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.get_server(&id)?;
    let cfg = state
        .lifecycle
        .get_config(&id)
        .await?
        .ok_or_else(|| Error::Config(format!("server '{}' is not configured", id)))?;
    Ok(Json(cfg))
}

pub async fn update_config(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<ServerConfig>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.update_config(&id, input).await?;
    Ok(StatusCode::OK)
}

pub async fn start_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.start(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.stop(&id).await?;
    Ok(StatusCode::OK)
}

pub async fn restart_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.restart(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn send_command(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<CommandRequest>,
) -> ApiResult<impl IntoResponse> {
    state.lifecycle.send_command(&id, &input.command).await?;
    Ok(StatusCode::OK)
}

pub async fn install_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    // Runs detached; progress arrives over the event bus.
    let _task = state.installer.install_server(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn active_installations(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.installer.active_installations())
}

pub async fn server_logs(
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).min(MAX_QUERY_LIMIT);
    Ok(Json(state.lifecycle.recent_logs(&id, limit)?))
}

pub async fn server_stats(
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_STATS_LIMIT).min(MAX_QUERY_LIMIT);
    Ok(Json(state.lifecycle.recent_stats(&id, limit)?))
}

pub async fn system_journal(
    Query(query): Query<JournalQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let page = journal::read_unit_journal(
        &state.config.journal_unit,
        query.limit.unwrap_or(DEFAULT_LOG_LIMIT),
        query.cursor.as_deref(),
    )
    .await?;
    Ok(Json(page))
}

pub async fn restart_agent(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    journal::queue_restart_unit(&state.config.journal_unit, AGENT_RESTART_DELAY)?;
    Ok(StatusCode::ACCEPTED)
}

/// The event bus authenticates the socket itself, so this route sits outside
/// the session middleware and refuses with a close frame instead of a 401.
pub async fn events_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = state.sessions.get_session_from_handshake(&headers);
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| bus.serve_socket(socket, session))
}
