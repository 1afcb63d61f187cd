use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single build attempt.
///
/// `Pending` only exists as the store default; the orchestrator writes `Running`
/// when it creates the row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Fail,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid build status: {}", s)),
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a build status transition is allowed.
///
/// Builds move strictly forward: `Pending -> Running -> {Success, Fail}`.
/// Creating a row directly in `Running` is handled by the store, not here.
pub fn is_valid_transition(from: &BuildStatus, to: &BuildStatus) -> bool {
    matches!(
        (from, to),
        (BuildStatus::Pending, BuildStatus::Running)
            | (BuildStatus::Running, BuildStatus::Success)
            | (BuildStatus::Running, BuildStatus::Fail)
    )
}

/// The source repository a game is built from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameRepository {
    /// Identifier assigned by the hosting provider (`repository.id` in push payloads).
    pub remote_id: i64,
    pub html_url: String,
    pub default_branch: String,
}

impl GameRepository {
    /// Clone URL using the `<html_url>.git` convention.
    pub fn clone_url(&self) -> String {
        let url = self.html_url.trim_end_matches('/');
        if url.ends_with(".git") {
            url.to_string()
        } else {
            format!("{}.git", url)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub id: i64,
    pub title: String,
    pub repository: GameRepository,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildJob {
    pub id: i64,
    pub game_id: i64,
    pub status: BuildStatus,
    pub logs: String,
    /// Directory holding the exported artifact. Only set on success.
    pub path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update applied to a build row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct BuildUpdate {
    pub status: Option<BuildStatus>,
    pub logs: Option<String>,
    pub path: Option<String>,
}

/// A build with optional projections requested through `?include=`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: BuildJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game: Option<Game>,
}

/// Related records a build listing may embed.
///
/// Parsed from the `include` query parameter against this fixed set; unknown
/// names are rejected rather than passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildInclude {
    Game,
}

impl BuildInclude {
    pub const ALLOWED: &'static [&'static str] = &["game"];

    /// Parse a comma-separated include list. Empty segments are ignored.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>, String> {
        let mut includes = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let include = part.parse::<Self>()?;
            if !includes.contains(&include) {
                includes.push(include);
            }
        }
        Ok(includes)
    }
}

impl FromStr for BuildInclude {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "game" => Ok(Self::Game),
            _ => Err(format!(
                "Invalid include '{}'. Allowed: {}",
                s,
                Self::ALLOWED.join(", ")
            )),
        }
    }
}

/// Payload published on `builds/{game_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub build_id: i64,
    pub game_id: i64,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload published on `builds/{build_id}/logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogLine {
    pub build_id: i64,
    pub game_id: i64,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_roundtrip_strings() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Fail,
        ] {
            assert_eq!(BuildStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(BuildStatus::from_str("running").is_err());
    }

    #[test]
    fn test_build_status_serializes_screaming_case() {
        let json = serde_json::to_string(&BuildStatus::Success).unwrap();
        assert_eq!(json, "\"SUCCESS\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Fail.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        assert!(is_valid_transition(&BuildStatus::Pending, &BuildStatus::Running));
        assert!(is_valid_transition(&BuildStatus::Running, &BuildStatus::Success));
        assert!(is_valid_transition(&BuildStatus::Running, &BuildStatus::Fail));
    }

    #[test]
    fn test_invalid_transitions() {
        // RUNNING is never skipped
        assert!(!is_valid_transition(&BuildStatus::Pending, &BuildStatus::Success));
        assert!(!is_valid_transition(&BuildStatus::Pending, &BuildStatus::Fail));
        // Nothing leaves a terminal state
        assert!(!is_valid_transition(&BuildStatus::Success, &BuildStatus::Running));
        assert!(!is_valid_transition(&BuildStatus::Fail, &BuildStatus::Running));
        assert!(!is_valid_transition(&BuildStatus::Fail, &BuildStatus::Success));
        assert!(!is_valid_transition(&BuildStatus::Running, &BuildStatus::Running));
    }

    #[test]
    fn test_clone_url_appends_git_suffix() {
        let repo = GameRepository {
            remote_id: 1,
            html_url: "https://github.com/acme/platformer".to_string(),
            default_branch: "main".to_string(),
        };
        assert_eq!(repo.clone_url(), "https://github.com/acme/platformer.git");
    }

    #[test]
    fn test_clone_url_does_not_double_suffix() {
        let repo = GameRepository {
            remote_id: 1,
            html_url: "https://github.com/acme/platformer.git/".to_string(),
            default_branch: "main".to_string(),
        };
        assert_eq!(repo.clone_url(), "https://github.com/acme/platformer.git");
    }

    #[test]
    fn test_build_include_parse_list() {
        assert_eq!(BuildInclude::parse_list("game").unwrap(), vec![BuildInclude::Game]);
        assert_eq!(
            BuildInclude::parse_list(" game , game ,").unwrap(),
            vec![BuildInclude::Game]
        );
        assert!(BuildInclude::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_build_include_rejects_unknown() {
        let err = BuildInclude::parse_list("game,owner").unwrap_err();
        assert!(err.contains("owner"));
        assert!(err.contains("game"));
    }

    #[test]
    fn test_status_update_omits_empty_fields() {
        let update = StatusUpdate {
            build_id: 3,
            game_id: 7,
            status: BuildStatus::Running,
            path: None,
            error: None,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"status\":\"RUNNING\""));
        assert!(!json.contains("path"));
        assert!(!json.contains("error"));
    }
}
