//! Runs one build end to end: clone, prepare, export, record.
//!
//! Every run owns a fresh checkout directory and, once the toolchain has been
//! resolved, a per-build output directory under the export root. Progress is
//! appended to the build's log and mirrored live on `builds/{build_id}/logs`;
//! status transitions are announced on `builds/{game_id}/status`. Runs never
//! return errors: whatever goes wrong ends up in the build row as `FAIL`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use super::broadcast::{Broadcaster, Topic};
use super::db::DbHandle;
use super::export::ExportCommand;
use super::fetcher::{SourceFetcher, SourceHandle};
use super::models::{BuildJob, BuildStatus, BuildUpdate, Game, LogLine, StatusUpdate};
use crate::errors::BuildError;

/// Name the toolchain expects for the preset file at the project root.
pub const EXPORT_PRESET_FILE: &str = "export_presets.cfg";

const WORKSPACE_PREFIX: &str = "repo-";

/// Host configuration the orchestrator reads for every run.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Export toolchain executable. Unset means every build fails.
    pub toolchain_path: Option<PathBuf>,
    /// Output directories are created as `<export_root>-<build_id>`.
    pub export_root: PathBuf,
    /// Preset file copied into each checkout before export.
    pub export_preset: PathBuf,
    /// Parent for per-run checkouts. Defaults to the system temp directory.
    pub workspace_root: Option<PathBuf>,
}

impl BuildSettings {
    pub fn output_dir(&self, build_id: i64) -> PathBuf {
        let mut root = self.export_root.clone().into_os_string();
        root.push(format!("-{}", build_id));
        PathBuf::from(root)
    }
}

pub struct BuildOrchestrator {
    db: DbHandle,
    hub: Arc<Broadcaster>,
    fetcher: Arc<dyn SourceFetcher>,
    settings: BuildSettings,
}

impl BuildOrchestrator {
    pub fn new(
        db: DbHandle,
        hub: Arc<Broadcaster>,
        fetcher: Arc<dyn SourceFetcher>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            db,
            hub,
            fetcher,
            settings,
        }
    }

    /// Execute a build for `game`.
    ///
    /// Returns the final build row, or `None` if the run could not be
    /// recorded at all. Subscribers always hear a terminal status once the
    /// run has been announced as `RUNNING`, even when the store rejects it.
    pub async fn run(&self, game: &Game) -> Option<BuildJob> {
        let game_id = game.id;
        let build = match self
            .db
            .call(move |db| db.create_build(game_id, BuildStatus::Running))
            .await
        {
            Ok(build) => build,
            Err(e) => {
                tracing::error!(game_id, error = %e, "failed to create build record");
                return None;
            }
        };
        tracing::info!(build_id = build.id, game_id, "build started");
        self.announce(&build, None);

        let mut log = BuildLog::new(&self.hub, build.id, game_id);
        let mut workspace = Workspace::default();

        let outcome = self.execute(game, &build, &mut workspace, &mut log).await;

        let update = match &outcome {
            Ok(output_dir) => BuildUpdate {
                status: Some(BuildStatus::Success),
                logs: Some(log.text.clone()),
                path: Some(output_dir.display().to_string()),
            },
            Err(e) => {
                tracing::warn!(build_id = build.id, game_id, error = %e, "build failed");
                log.line(format!("Build process failed: {}", e));
                BuildUpdate {
                    status: Some(BuildStatus::Fail),
                    logs: Some(log.text.clone()),
                    path: None,
                }
            }
        };

        // Disk state is settled before anyone hears the build is over.
        workspace.release_on_blocking_pool(outcome.is_err()).await;

        let build_id = build.id;
        let error = outcome.as_ref().err().map(|e| e.to_string());
        let finished = match self
            .db
            .call(move |db| db.update_build(build_id, &update))
            .await
        {
            Ok(finished) => {
                self.announce(&finished, error);
                tracing::info!(build_id, game_id, status = %finished.status, "build finished");
                Some(finished)
            }
            Err(e) => {
                tracing::error!(build_id, game_id, error = %e, "failed to record build result");
                let reason = format!("Failed to record build result: {}", e);
                log.line(reason.clone());

                let recorded = if outcome.is_ok() {
                    // The export succeeded but cannot be recorded as such.
                    workspace.release_on_blocking_pool(true).await;
                    self.record_failure(build_id, &log.text).await
                } else {
                    None
                };

                let terminal = recorded.clone().unwrap_or_else(|| BuildJob {
                    status: BuildStatus::Fail,
                    logs: log.text.clone(),
                    path: None,
                    ..build.clone()
                });
                self.announce(&terminal, Some(reason));
                recorded
            }
        };

        log.line("Build process finished.");
        finished
    }

    /// Single attempt to settle a build as `FAIL` after its result could not be stored.
    async fn record_failure(&self, build_id: i64, logs: &str) -> Option<BuildJob> {
        let update = BuildUpdate {
            status: Some(BuildStatus::Fail),
            logs: Some(logs.to_string()),
            path: None,
        };
        match self
            .db
            .call(move |db| db.update_build(build_id, &update))
            .await
        {
            Ok(build) => Some(build),
            Err(e) => {
                tracing::error!(build_id, error = %e, "failed to record build failure");
                None
            }
        }
    }

    async fn execute(
        &self,
        game: &Game,
        build: &BuildJob,
        workspace: &mut Workspace,
        log: &mut BuildLog<'_>,
    ) -> Result<PathBuf, BuildError> {
        let checkout = workspace
            .create_checkout_dir(self.settings.workspace_root.clone())
            .await?;

        let url = game.repository.clone_url();
        log.line(format!("Cloning repository from {}", url));
        let source = self.fetcher.fetch(&url, &checkout).await?;
        workspace.attach_source(source);
        log.line(format!("Repository cloned to {}", checkout.display()));

        log.line("Starting export...");
        self.install_export_preset(&checkout, log).await;

        let toolchain = self.resolve_toolchain(log).await?;
        log.line(format!("Using export toolchain {}", toolchain.display()));

        let output_dir = self.settings.output_dir(build.id);
        workspace.output_dir = Some(output_dir.clone());
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|source| BuildError::Workspace {
                path: output_dir.clone(),
                source,
            })?;
        log.line(format!("Build output folder created at {}", output_dir.display()));

        let command = ExportCommand::new(&toolchain, &checkout, &output_dir);
        log.line(format!(
            "Export output will be written to {}",
            command.output_file().display()
        ));

        let mut process = command.spawn().map_err(BuildError::ToolchainLaunch)?;
        while let Some(line) = process.next_line().await {
            log.line(line);
        }
        let exit_code = process.wait().await.map_err(BuildError::ToolchainLaunch)?;

        if exit_code == 0 {
            log.line("Export succeeded.");
            Ok(output_dir)
        } else {
            log.line(format!("Export failed with exit code {}", exit_code));
            Err(BuildError::ToolchainExit { exit_code })
        }
    }

    /// Copy the configured preset file into the checkout, replacing any copy
    /// the repository ships. Failures are logged and the build continues.
    async fn install_export_preset(&self, checkout: &Path, log: &mut BuildLog<'_>) {
        let source = &self.settings.export_preset;
        let target = checkout.join(EXPORT_PRESET_FILE);

        if let Err(e) = tokio::fs::remove_file(&target).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log.line(format!(
                "Could not remove existing {}: {}",
                target.display(),
                e
            ));
        }

        match tokio::fs::copy(source, &target).await {
            Ok(_) => log.line(format!("Export preset copied to {}", target.display())),
            Err(e) => log.line(format!(
                "Could not copy export preset from {}: {}",
                source.display(),
                e
            )),
        }
    }

    async fn resolve_toolchain(&self, log: &mut BuildLog<'_>) -> Result<PathBuf, BuildError> {
        let Some(path) = self
            .settings
            .toolchain_path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
        else {
            return Err(BuildError::ToolchainConfig(
                "toolchain path is not set (set GODOT_PATH or build.toolchain_path)".into(),
            ));
        };

        let metadata = tokio::fs::metadata(path).await.map_err(|_| {
            BuildError::ToolchainConfig(format!("executable not found at {}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(BuildError::ToolchainConfig(format!(
                "{} is not a file",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                log.line(format!(
                    "Warning: {} is not marked executable",
                    path.display()
                ));
            }
        }
        #[cfg(not(unix))]
        let _ = &log;

        Ok(path.clone())
    }

    fn announce(&self, build: &BuildJob, error: Option<String>) {
        let update = StatusUpdate {
            build_id: build.id,
            game_id: build.game_id,
            status: build.status,
            path: build.path.clone(),
            error,
        };
        self.hub.publish_json(
            &Topic::Status {
                game_id: build.game_id,
            },
            &update,
        );
    }
}

/// Cumulative build log, mirrored line by line to the build's log topic.
struct BuildLog<'a> {
    hub: &'a Broadcaster,
    topic: Topic,
    build_id: i64,
    game_id: i64,
    text: String,
}

impl<'a> BuildLog<'a> {
    fn new(hub: &'a Broadcaster, build_id: i64, game_id: i64) -> Self {
        Self {
            hub,
            topic: Topic::Logs { build_id },
            build_id,
            game_id,
            text: String::new(),
        }
    }

    fn line(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.text.push_str(&line);
        self.text.push('\n');
        self.hub.publish_json(
            &self.topic,
            &LogLine {
                build_id: self.build_id,
                game_id: self.game_id,
                line,
            },
        );
    }
}

/// Disk resources acquired during a run.
#[derive(Default)]
struct Workspace {
    checkout: Option<TempDir>,
    source: Option<SourceHandle>,
    output_dir: Option<PathBuf>,
}

impl Workspace {
    async fn create_checkout_dir(&mut self, parent: Option<PathBuf>) -> Result<PathBuf, BuildError> {
        let fallback = parent.clone().unwrap_or_else(std::env::temp_dir);
        let dir = tokio::task::spawn_blocking(move || new_checkout_dir(parent.as_deref()))
            .await
            .map_err(|e| BuildError::Workspace {
                path: fallback,
                source: std::io::Error::other(e),
            })??;
        let path = dir.path().to_path_buf();
        self.checkout = Some(dir);
        Ok(path)
    }

    fn attach_source(&mut self, source: SourceHandle) {
        self.source = Some(source);
    }

    fn holds_checkout(&self) -> bool {
        self.checkout.is_some() || self.source.is_some()
    }

    /// Close the checkout, delete its directory and, for failed builds, the
    /// output directory. Safe to call more than once.
    fn release(&mut self, failed: bool) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        if let Some(dir) = self.checkout.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove build workspace");
            }
        }
        if failed
            && let Some(output_dir) = self.output_dir.take()
            && output_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(&output_dir)
        {
            tracing::warn!(path = %output_dir.display(), error = %e, "failed to remove build output");
        }
    }

    /// [`Workspace::release`] on the blocking pool. A kept output directory
    /// stays tracked, so a later failed release can still remove it.
    async fn release_on_blocking_pool(&mut self, failed: bool) {
        let mut resources = std::mem::take(self);
        let result = tokio::task::spawn_blocking(move || {
            resources.release(failed);
            resources.output_dir.take()
        })
        .await;
        match result {
            Ok(kept) => self.output_dir = kept,
            Err(e) => tracing::warn!(error = %e, "workspace cleanup task failed"),
        }
    }
}

fn new_checkout_dir(parent: Option<&Path>) -> Result<TempDir, BuildError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(WORKSPACE_PREFIX);
    match parent {
        Some(parent) => {
            std::fs::create_dir_all(parent).map_err(|source| BuildError::Workspace {
                path: parent.to_path_buf(),
                source,
            })?;
            builder.tempdir_in(parent)
        }
        None => builder.tempdir(),
    }
    .map_err(|source| BuildError::Workspace {
        path: parent.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
        source,
    })
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.holds_checkout() {
            return;
        }
        let mut resources = std::mem::take(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || resources.release(false));
            }
            Err(_) => resources.release(false),
        }
    }
}
