use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::auth::TokenValidator;
use super::broadcast::Broadcaster;
use super::db::DbHandle;
use super::models::{BuildInclude, BuildView};
use super::queue::{BuildQueue, BuildRequest, BuildTrigger};
use super::webhook;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub hub: Arc<Broadcaster>,
    pub queue: BuildQueue,
    pub webhook_secret: String,
    pub tokens: Arc<dyn TokenValidator>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListBuildsQuery {
    pub include: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

fn internal(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "request failed");
    ApiError::Internal(e.to_string())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/webhook", post(webhook::webhook_handler))
        .route("/api/v1/games/{game_id}/builds", post(trigger_build))
        .route("/api/v1/builds/game/{game_id}", get(list_builds))
        .route(
            "/api/v1/builds/game/{game_id}/latest-success",
            get(latest_successful_build),
        )
        .route("/api/v1/builds/{build_id}", get(get_build))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn trigger_build(
    State(state): State<SharedState>,
    Path(game_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let game = state
        .db
        .call(move |db| db.get_game(game_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::NotFound(format!("Game {} not found", game_id)))?;

    state
        .queue
        .enqueue(BuildRequest {
            game,
            trigger: BuildTrigger::Manual,
        })
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    tracing::info!(game_id, "manual build queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "queued", "game_id": game_id})),
    ))
}

async fn list_builds(
    State(state): State<SharedState>,
    Path(game_id): Path<i64>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let includes = match query.include.as_deref() {
        Some(raw) => BuildInclude::parse_list(raw).map_err(ApiError::BadRequest)?,
        None => Vec::new(),
    };
    let with_game = includes.contains(&BuildInclude::Game);

    let (game, builds) = state
        .db
        .call(move |db| {
            let game = db.get_game(game_id)?;
            let builds = match game {
                Some(_) => db.list_builds_for_game(game_id)?,
                None => Vec::new(),
            };
            Ok((game, builds))
        })
        .await
        .map_err(internal)?;
    let game = game.ok_or_else(|| ApiError::NotFound(format!("Game {} not found", game_id)))?;

    let views: Vec<BuildView> = builds
        .into_iter()
        .map(|build| BuildView {
            build,
            game: with_game.then(|| game.clone()),
        })
        .collect();
    Ok(Json(views))
}

async fn latest_successful_build(
    State(state): State<SharedState>,
    Path(game_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.latest_successful_build(game_id))
        .await
        .map_err(internal)?;
    match build {
        Some(build) => Ok(Json(build)),
        None => Err(ApiError::NotFound(format!(
            "No successful build for game {}",
            game_id
        ))),
    }
}

async fn get_build(
    State(state): State<SharedState>,
    Path(build_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state
        .db
        .call(move |db| db.get_build(build_id))
        .await
        .map_err(internal)?;
    match build {
        Some(build) => Ok(Json(build)),
        None => Err(ApiError::NotFound(format!("Build {} not found", build_id))),
    }
}
