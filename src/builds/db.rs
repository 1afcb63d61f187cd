use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the build database.
///
/// Wraps `BuildDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BuildDb>>,
}

impl DbHandle {
    pub fn new(db: BuildDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BuildDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BuildDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct BuildDb {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

const BUILD_COLUMNS: &str = "id, game_id, status, logs, path, created_at, updated_at";
const GAME_COLUMNS: &str =
    "id, title, repository_remote_id, repository_url, default_branch, created_at";

impl BuildDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS games (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    repository_remote_id INTEGER NOT NULL UNIQUE,
                    repository_url TEXT NOT NULL,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS builds (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    game_id INTEGER NOT NULL REFERENCES games(id),
                    status TEXT NOT NULL DEFAULT 'PENDING',
                    logs TEXT NOT NULL DEFAULT '',
                    path TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_builds_game ON builds(game_id, created_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Games ─────────────────────────────────────────────────────────

    /// Register a game and its repository. The CRUD layer owns games; this is
    /// the minimal write path needed to link a repository to builds.
    pub fn create_game(&self, title: &str, repository: &GameRepository) -> Result<Game> {
        self.conn
            .execute(
                "INSERT INTO games (title, repository_remote_id, repository_url, default_branch, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    title,
                    repository.remote_id,
                    repository.html_url,
                    repository.default_branch,
                    now()
                ],
            )
            .context("Failed to insert game")?;
        let id = self.conn.last_insert_rowid();
        self.get_game(id)?.context("Game not found after insert")
    }

    pub fn get_game(&self, id: i64) -> Result<Option<Game>> {
        let sql = format!("SELECT {} FROM games WHERE id = ?1", GAME_COLUMNS);
        self.conn
            .query_row(&sql, params![id], game_from_row)
            .optional()
            .context("Failed to query game")
    }

    /// Resolve the game linked to a hosting provider's repository id.
    pub fn find_game_by_repository(&self, remote_id: i64) -> Result<Option<Game>> {
        let sql = format!(
            "SELECT {} FROM games WHERE repository_remote_id = ?1",
            GAME_COLUMNS
        );
        self.conn
            .query_row(&sql, params![remote_id], game_from_row)
            .optional()
            .context("Failed to query game by repository")
    }

    // ── Builds ────────────────────────────────────────────────────────

    /// Insert a new build row. Only transient statuses are accepted.
    pub fn create_build(&self, game_id: i64, status: BuildStatus) -> Result<BuildJob> {
        if status.is_terminal() {
            anyhow::bail!("Cannot create a build in terminal status {}", status);
        }
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO builds (game_id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![game_id, status.as_str(), ts],
            )
            .context("Failed to insert build")?;
        let id = self.conn.last_insert_rowid();
        self.get_build(id)?.context("Build not found after insert")
    }

    pub fn get_build(&self, id: i64) -> Result<Option<BuildJob>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE id = ?1 AND deleted_at IS NULL",
            BUILD_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![id], BuildRow::from_row)
            .optional()
            .context("Failed to query build")?;
        row.map(BuildRow::into_build).transpose()
    }

    /// Apply a partial update. Empty `logs`/`path` values are ignored, and a
    /// status change must be a valid forward transition.
    pub fn update_build(&self, id: i64, update: &BuildUpdate) -> Result<BuildJob> {
        let current = self
            .get_build(id)?
            .with_context(|| format!("Build {} not found", id))?;

        if let Some(to) = update.status
            && !is_valid_transition(&current.status, &to)
        {
            anyhow::bail!(
                "Invalid build status transition {} -> {} for build {}",
                current.status,
                to,
                id
            );
        }

        // Use unchecked_transaction so all column updates land together.
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        if let Some(status) = update.status {
            tx.execute(
                "UPDATE builds SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), ts, id],
            )
            .context("Failed to update build status")?;
        }
        if let Some(logs) = update.logs.as_deref().filter(|l| !l.is_empty()) {
            tx.execute(
                "UPDATE builds SET logs = ?1, updated_at = ?2 WHERE id = ?3",
                params![logs, ts, id],
            )
            .context("Failed to update build logs")?;
        }
        if let Some(path) = update.path.as_deref().filter(|p| !p.is_empty()) {
            tx.execute(
                "UPDATE builds SET path = ?1, updated_at = ?2 WHERE id = ?3",
                params![path, ts, id],
            )
            .context("Failed to update build path")?;
        }
        tx.commit().context("Failed to commit build update")?;

        self.get_build(id)?.context("Build not found after update")
    }

    /// All live builds for a game, newest first.
    pub fn list_builds_for_game(&self, game_id: i64) -> Result<Vec<BuildJob>> {
        let sql = format!(
            "SELECT {} FROM builds WHERE game_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC",
            BUILD_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_builds_for_game")?;
        let rows = stmt
            .query_map(params![game_id], BuildRow::from_row)
            .context("Failed to query builds")?;
        let mut builds = Vec::new();
        for row in rows {
            let r = row.context("Failed to read build row")?;
            builds.push(r.into_build()?);
        }
        Ok(builds)
    }

    pub fn latest_successful_build(&self, game_id: i64) -> Result<Option<BuildJob>> {
        let sql = format!(
            "SELECT {} FROM builds
             WHERE game_id = ?1 AND status = 'SUCCESS' AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC LIMIT 1",
            BUILD_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![game_id], BuildRow::from_row)
            .optional()
            .context("Failed to query latest successful build")?;
        row.map(BuildRow::into_build).transpose()
    }

    /// Hide a build from every query. Rows are never physically removed.
    pub fn soft_delete_build(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE builds SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
                params![now(), id],
            )
            .context("Failed to soft-delete build")?;
        Ok(count > 0)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

fn game_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Game> {
    Ok(Game {
        id: row.get(0)?,
        title: row.get(1)?,
        repository: GameRepository {
            remote_id: row.get(2)?,
            html_url: row.get(3)?,
            default_branch: row.get(4)?,
        },
        created_at: row.get(5)?,
    })
}

struct BuildRow {
    id: i64,
    game_id: i64,
    status: String,
    logs: String,
    path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl BuildRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            game_id: row.get(1)?,
            status: row.get(2)?,
            logs: row.get(3)?,
            path: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_build(self) -> Result<BuildJob> {
        let status = BuildStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse build status")?;
        Ok(BuildJob {
            id: self.id,
            game_id: self.game_id,
            status,
            logs: self.logs,
            path: self.path,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
