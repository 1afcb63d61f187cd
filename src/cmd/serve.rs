//! Build server command: `gamenest serve` and `gamenest init-db`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use gamenest::builds::db::BuildDb;
use gamenest::builds::server;
use gamenest::config::GamenestConfig;

pub async fn cmd_serve(
    config: GamenestConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server_config = config.server_config();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(db_path) = db_path {
        server_config.db_path = db_path;
    }
    if dev {
        server_config.dev_mode = true;
        server_config.host = "0.0.0.0".to_string();
    }

    server::start_server(server_config).await
}

pub fn cmd_init_db(config: &GamenestConfig, db_path: Option<PathBuf>) -> Result<()> {
    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    open_db(&db_path)?;
    println!("Build database initialized at {}", db_path.display());
    Ok(())
}

/// Open (creating if needed) the database at `path`.
pub(crate) fn open_db(path: &Path) -> Result<BuildDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    BuildDb::new(path)
}
