//! Layered configuration for gamenest.
//!
//! Values resolve in order: built-in defaults, then `.gamenest/gamenest.toml`
//! (or the file given with `--config`), then environment variables, then CLI
//! flags applied by the caller.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = ".gamenest/builds.db"
//! dev_mode = false
//!
//! [build]
//! toolchain_path = "/opt/godot/godot"
//! export_root = "./builds/build"
//! export_preset = "./export/export_presets.cfg"
//!
//! [webhook]
//! secret = "change-me"
//!
//! [realtime]
//! tokens = ["dashboard-token"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::builds::orchestrator::BuildSettings;
use crate::builds::server::ServerConfig;

pub const CONFIG_DIR: &str = ".gamenest";
pub const CONFIG_FILE: &str = "gamenest.toml";

const REDACTED: &str = "********";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from(CONFIG_DIR).join("builds.db"),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Export toolchain executable (`GODOT_PATH`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toolchain_path: Option<PathBuf>,
    pub export_root: PathBuf,
    pub export_preset: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            toolchain_path: None,
            export_root: PathBuf::from("./builds/build"),
            export_preset: PathBuf::from("./export/export_presets.cfg"),
            workspace_root: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSection {
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSection {
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamenestConfig {
    pub server: ServerSection,
    pub build: BuildSection,
    pub webhook: WebhookSection,
    pub realtime: RealtimeSection,
}

impl GamenestConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gamenest.toml")
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Default config file location under `base`.
    pub fn default_path(base: &Path) -> PathBuf {
        base.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Resolve file and environment layers.
    ///
    /// An explicit path must exist. Without one, the default location is used
    /// when present and built-in defaults otherwise.
    pub fn resolve(explicit: Option<&Path>, base: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => {
                let path = Self::default_path(base);
                if path.exists() {
                    Self::load(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = var("GODOT_PATH") {
            self.build.toolchain_path = Some(PathBuf::from(path));
        }
        if let Some(root) = var("BUILD_EXPORT_PATH") {
            self.build.export_root = PathBuf::from(root);
        }
        if let Some(preset) = var("EXPORT_PRESET_PATH") {
            self.build.export_preset = PathBuf::from(preset);
        }
        if let Some(root) = var("GAMENEST_WORKSPACE_ROOT") {
            self.build.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(secret) = var("GITHUB_WEBHOOK_SECRET") {
            self.webhook.secret = secret;
        }
        if let Some(tokens) = var("GAMENEST_WS_TOKENS") {
            self.realtime.tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(db_path) = var("GAMENEST_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(port) = var("GAMENEST_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid GAMENEST_PORT: {}", port))?;
        }
        Ok(())
    }

    /// Problems that make the service unable to do useful work. Not fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.webhook.secret.is_empty() {
            warnings.push("webhook.secret is empty; all webhooks will be rejected".to_string());
        }
        if self.build.toolchain_path.is_none() {
            warnings.push("build.toolchain_path is not set; all builds will fail".to_string());
        }
        if self.realtime.tokens.is_empty() {
            warnings.push("realtime.tokens is empty; websocket clients cannot connect".to_string());
        }
        warnings
    }

    /// TOML rendering with secrets masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.webhook.secret.is_empty() {
            shown.webhook.secret = REDACTED.to_string();
        }
        shown.realtime.tokens = shown
            .realtime
            .tokens
            .iter()
            .map(|_| REDACTED.to_string())
            .collect();
        toml::to_string_pretty(&shown).context("Failed to serialize configuration")
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            toolchain_path: self.build.toolchain_path.clone(),
            export_root: self.build.export_root.clone(),
            export_preset: self.build.export_preset.clone(),
            workspace_root: self.build.workspace_root.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            db_path: self.server.db_path.clone(),
            dev_mode: self.server.dev_mode,
            webhook_secret: self.webhook.secret.clone(),
            ws_tokens: self.realtime.tokens.clone(),
            build: self.build_settings(),
        }
    }
}
