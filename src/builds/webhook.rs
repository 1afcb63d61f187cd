//! Inbound repository webhooks: authenticate, classify, enqueue.
//!
//! The handler answers synchronously and never waits on a build. Only `push`
//! events can trigger anything; every other event type is acknowledged and
//! ignored.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;

use super::api::SharedState;
use super::db::DbHandle;
use super::models::Game;
use super::queue::{BuildRequest, BuildTrigger};
use super::signature;
use crate::errors::WebhookError;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Commit messages containing this marker never trigger a build.
pub const SKIP_MARKER: &str = "{skip-build}";

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// The fields of a push payload the classifier looks at.
///
/// Every field is optional: a missing or mistyped value makes the related
/// check fail closed instead of rejecting the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushEvent {
    pub repository_id: Option<i64>,
    pub master_branch: Option<String>,
    pub git_ref: Option<String>,
    pub head_commit_id: Option<String>,
    pub head_commit_message: Option<String>,
}

impl PushEvent {
    /// Parse a push body. Only syntactically invalid JSON is an error.
    pub fn from_json(body: &[u8]) -> Result<Self, WebhookError> {
        let root: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::Validation(format!("Invalid JSON: {}", e)))?;

        let text = |value: Option<&Value>| value.and_then(Value::as_str).map(str::to_string);
        let repository = root.get("repository");
        let head_commit = root.get("head_commit");

        Ok(Self {
            repository_id: repository.and_then(|r| r.get("id")).and_then(Value::as_i64),
            master_branch: text(repository.and_then(|r| r.get("master_branch"))),
            git_ref: text(root.get("ref")),
            head_commit_id: text(head_commit.and_then(|c| c.get("id"))),
            head_commit_message: text(head_commit.and_then(|c| c.get("message"))),
        })
    }

    /// Whether the pushed ref is exactly `refs/heads/<master_branch>`.
    /// Without both values nothing matches. Suffix matches do not count:
    /// `refs/heads/x-main` and `refs/tags/main` never target `main`.
    pub fn targets_branch(&self) -> bool {
        match (&self.git_ref, &self.master_branch) {
            (Some(git_ref), Some(branch)) => git_ref
                .strip_prefix(BRANCH_REF_PREFIX)
                .is_some_and(|name| name == branch),
            _ => false,
        }
    }

    pub fn requests_skip(&self) -> bool {
        self.head_commit_message
            .as_deref()
            .is_some_and(|m| m.contains(SKIP_MARKER))
    }
}

/// Why a verified push produced no build.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    UnlinkedRepository { repository_id: Option<i64> },
    SkipMarker,
    BranchMismatch {
        git_ref: Option<String>,
        branch: Option<String>,
    },
}

/// Outcome of classifying a verified webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Build {
        game: Game,
        commit_id: Option<String>,
    },
    Skip(SkipReason),
    Ignored { event: String },
}

/// Resolves a hosting-provider repository id to the game linked to it.
#[async_trait]
pub trait GameLookup: Send + Sync {
    async fn game_for_repository(&self, remote_id: i64) -> anyhow::Result<Option<Game>>;
}

#[async_trait]
impl GameLookup for DbHandle {
    async fn game_for_repository(&self, remote_id: i64) -> anyhow::Result<Option<Game>> {
        self.call(move |db| db.find_game_by_repository(remote_id)).await
    }
}

/// Decide what a verified delivery should do.
///
/// The signature must already have been checked. Lookup failures are
/// reported as [`WebhookError::Lookup`].
pub async fn classify(
    event_type: &str,
    body: &[u8],
    games: &dyn GameLookup,
) -> Result<Classification, WebhookError> {
    if event_type != "push" {
        return Ok(Classification::Ignored {
            event: event_type.to_string(),
        });
    }

    let push = PushEvent::from_json(body)?;

    let game = match push.repository_id {
        Some(remote_id) => games
            .game_for_repository(remote_id)
            .await
            .map_err(|e| WebhookError::Lookup(e.to_string()))?,
        None => None,
    };
    let Some(game) = game else {
        return Ok(Classification::Skip(SkipReason::UnlinkedRepository {
            repository_id: push.repository_id,
        }));
    };

    if push.requests_skip() {
        return Ok(Classification::Skip(SkipReason::SkipMarker));
    }

    if !push.targets_branch() {
        return Ok(Classification::Skip(SkipReason::BranchMismatch {
            git_ref: push.git_ref,
            branch: push.master_branch,
        }));
    }

    Ok(Classification::Build {
        game,
        commit_id: push.head_commit_id,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /webhook`
pub async fn webhook_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature_header = header_str(&headers, SIGNATURE_HEADER);
    if !signature::verify(state.webhook_secret.as_bytes(), &body, signature_header) {
        tracing::warn!(
            has_signature = signature_header.is_some(),
            "rejected webhook with invalid signature"
        );
        return (StatusCode::UNAUTHORIZED, WebhookError::Authentication.to_string()).into_response();
    }

    let event_type = header_str(&headers, EVENT_HEADER).unwrap_or_default();
    let classification = match classify(event_type, &body, &state.db).await {
        Ok(c) => c,
        Err(WebhookError::Validation(msg)) => {
            tracing::warn!(error = %msg, "rejected malformed webhook payload");
            return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "webhook classification failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    match classification {
        Classification::Build { game, commit_id } => {
            tracing::info!(
                game_id = game.id,
                commit = commit_id.as_deref().unwrap_or("unknown"),
                "push accepted, queueing build"
            );
            let request = BuildRequest {
                game,
                trigger: BuildTrigger::Push { commit_id },
            };
            if let Err(e) = state.queue.enqueue(request) {
                tracing::error!(error = %e, "failed to enqueue build");
                return (StatusCode::SERVICE_UNAVAILABLE, "Build queue unavailable").into_response();
            }
            (StatusCode::OK, "Build triggered").into_response()
        }
        Classification::Skip(reason) => {
            tracing::info!(?reason, "skipping build for push");
            (StatusCode::OK, "Skipping build").into_response()
        }
        Classification::Ignored { event } => {
            tracing::debug!(event = %event, "ignoring webhook event");
            (StatusCode::OK, "Event ignored").into_response()
        }
    }
}
