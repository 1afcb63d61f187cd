//! End-to-end build pipeline: signed webhook in, exported build out.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gamenest::builds::api::AppState;
use gamenest::builds::auth::StaticTokens;
use gamenest::builds::broadcast::{Broadcaster, Topic};
use gamenest::builds::db::{BuildDb, DbHandle};
use gamenest::builds::fetcher::GitFetcher;
use gamenest::builds::models::{BuildStatus, GameRepository, LogLine, StatusUpdate};
use gamenest::builds::orchestrator::{BuildOrchestrator, BuildSettings};
use gamenest::builds::queue::BuildQueue;
use gamenest::builds::server::build_router;
use gamenest::builds::signature;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

const SECRET: &str = "pipeline-secret";

/// Create a git repository with a project file at `<root>/<name>.git`.
fn init_game_repo(root: &Path, name: &str) -> PathBuf {
    let path = root.join(format!("{}.git", name));
    let repo = git2::Repository::init(&path).unwrap();
    std::fs::write(path.join("project.godot"), "config_version=5\n").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    path
}

/// A stand-in export toolchain: checks its inputs and writes `index.html`.
fn fake_toolchain(root: &Path) -> PathBuf {
    let path = root.join("godot");
    std::fs::write(
        &path,
        r#"#!/bin/sh
[ "$1" = "--headless" ] || { echo "missing --headless" >&2; exit 64; }
[ -f "$2" ] || { echo "project file missing: $2" >&2; exit 65; }
[ -f "$(dirname "$2")/export_presets.cfg" ] || { echo "preset missing" >&2; exit 66; }
echo "Exporting preset $4"
echo "<html>game</html>" > "$5"
"#,
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Pipeline {
    root: TempDir,
    db: DbHandle,
    hub: Arc<Broadcaster>,
    state: Arc<AppState>,
}

fn pipeline(with_toolchain: bool) -> Pipeline {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("export_presets.cfg"), "[preset.0]\n").unwrap();
    let toolchain = with_toolchain.then(|| fake_toolchain(root.path()));

    let db = DbHandle::new(BuildDb::new_in_memory().unwrap());
    let hub = Arc::new(Broadcaster::new());
    let settings = BuildSettings {
        toolchain_path: toolchain,
        export_root: root.path().join("exports").join("build"),
        export_preset: root.path().join("export_presets.cfg"),
        workspace_root: Some(root.path().join("workspaces")),
    };
    let orchestrator = Arc::new(BuildOrchestrator::new(
        db.clone(),
        hub.clone(),
        Arc::new(GitFetcher),
        settings,
    ));
    let (queue, _consumer) = BuildQueue::start(orchestrator);
    let state = Arc::new(AppState {
        db: db.clone(),
        hub: hub.clone(),
        queue,
        webhook_secret: SECRET.into(),
        tokens: Arc::new(StaticTokens::new(["t"])),
    });
    Pipeline {
        root,
        db,
        hub,
        state,
    }
}

fn link_game(db: &DbHandle, repo_path: &Path, remote_id: i64) -> i64 {
    // The clone URL is the web URL plus ".git".
    let html_url = repo_path.to_str().unwrap().trim_end_matches(".git").to_string();
    db.lock_sync()
        .unwrap()
        .create_game(
            "Pipeline Game",
            &GameRepository {
                remote_id,
                html_url,
                default_branch: "main".into(),
            },
        )
        .unwrap()
        .id
}

fn signed_push(remote_id: i64, message: &str) -> Request<Body> {
    let body = serde_json::json!({
        "ref": "refs/heads/main",
        "repository": { "id": remote_id, "master_branch": "main" },
        "head_commit": { "id": "deadbeef", "message": message },
    })
    .to_string();
    let sig = signature::sign(SECRET.as_bytes(), body.as_bytes());
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", sig)
        .body(Body::from(body))
        .unwrap()
}

async fn next_status(rx: &mut tokio::sync::broadcast::Receiver<String>) -> StatusUpdate {
    let raw = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for build status")
        .unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn test_push_webhook_produces_successful_build() {
    let p = pipeline(true);
    let repo = init_game_repo(p.root.path(), "platformer");
    let game_id = link_game(&p.db, &repo, 501);

    let mut status_rx = p
        .hub
        .subscribe(&Topic::Status { game_id }.to_string())
        .unwrap();

    let response = build_router(p.state.clone())
        .oneshot(signed_push(501, "new level"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Build triggered");

    let running = next_status(&mut status_rx).await;
    assert_eq!(running.status, BuildStatus::Running);
    let finished = next_status(&mut status_rx).await;
    assert_eq!(finished.build_id, running.build_id);
    assert_eq!(finished.status, BuildStatus::Success, "error: {:?}", finished.error);

    let build_id = finished.build_id;
    let build = p
        .db
        .call(move |db| db.get_build(build_id))
        .await
        .unwrap()
        .unwrap();
    let output = p.root.path().join("exports").join(format!("build-{}", build_id));
    assert_eq!(build.path.as_deref(), Some(output.to_str().unwrap()));
    assert_eq!(
        std::fs::read_to_string(output.join("index.html")).unwrap(),
        "<html>game</html>\n"
    );
    assert!(build.logs.contains("Exporting preset Web"));

    // Checkouts do not outlive the run.
    let leftovers: Vec<_> = std::fs::read_dir(p.root.path().join("workspaces"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());

    // The latest successful build is queryable over HTTP.
    let response = build_router(p.state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/builds/game/{}/latest-success", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_toolchain_fails_build_and_cleans_workspace() {
    let p = pipeline(false);
    let repo = init_game_repo(p.root.path(), "puzzler");
    let game_id = link_game(&p.db, &repo, 502);

    let mut status_rx = p
        .hub
        .subscribe(&Topic::Status { game_id }.to_string())
        .unwrap();
    // First build in a fresh store.
    let mut logs_rx = p
        .hub
        .subscribe(&Topic::Logs { build_id: 1 }.to_string())
        .unwrap();

    let response = build_router(p.state.clone())
        .oneshot(signed_push(502, "tweak"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let running = next_status(&mut status_rx).await;
    assert_eq!(running.build_id, 1);
    let failed = next_status(&mut status_rx).await;
    assert_eq!(failed.status, BuildStatus::Fail);
    assert!(failed.error.unwrap().contains("toolchain path is not set"));

    let build_id = failed.build_id;
    let build = p
        .db
        .call(move |db| db.get_build(build_id))
        .await
        .unwrap()
        .unwrap();
    assert!(build.path.is_none());
    assert!(build.logs.contains("Repository cloned to"));
    assert!(!p.root.path().join("exports").join(format!("build-{}", build_id)).exists());

    // The final line is broadcast after the row is settled.
    let last: LogLine = loop {
        let raw = tokio::time::timeout(Duration::from_secs(30), logs_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let line: LogLine = serde_json::from_str(&raw).unwrap();
        if line.line == "Build process finished." {
            break line;
        }
    };
    assert_eq!(last.build_id, build_id);

    let leftovers: Vec<_> = std::fs::read_dir(p.root.path().join("workspaces"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_skip_marker_does_not_create_build() {
    let p = pipeline(false);
    let repo = init_game_repo(p.root.path(), "skipper");
    let game_id = link_game(&p.db, &repo, 503);

    let response = build_router(p.state.clone())
        .oneshot(signed_push(503, "readme {skip-build}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Skipping build");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let builds = p
        .db
        .call(move |db| db.list_builds_for_game(game_id))
        .await
        .unwrap();
    assert!(builds.is_empty());
}
