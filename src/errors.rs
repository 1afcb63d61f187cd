//! Typed error hierarchy for the gamenest build service.
//!
//! Three top-level enums cover the three failure domains:
//! - `WebhookError`: synchronous ingress failures, surfaced as HTTP statuses
//! - `FetchError`: source checkout failures raised by a `SourceFetcher`
//! - `BuildError`: build-fatal failures captured into a build's log

use thiserror::Error;

/// Errors from the webhook ingress path. Skips are not errors.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid signature")]
    Authentication,

    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Game lookup failed: {0}")]
    Lookup(String),
}

/// Errors from cloning a remote repository.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    #[error("Fetch task failed: {0}")]
    Join(String),
}

/// Build-fatal failures. These end a build in `FAIL` and never reach a caller.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Export toolchain misconfigured: {0}")]
    ToolchainConfig(String),

    #[error("Failed to launch export toolchain: {0}")]
    ToolchainLaunch(#[source] std::io::Error),

    #[error("Export toolchain failed with exit code {exit_code}")]
    ToolchainExit { exit_code: i32 },

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}
