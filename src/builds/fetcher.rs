//! Source checkout for builds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{Repository, build::RepoBuilder};

use crate::errors::FetchError;

/// An open checkout. Closing releases the underlying repository handle and is
/// safe to repeat; the files on disk belong to whoever owns the directory.
pub struct SourceHandle {
    path: PathBuf,
    repo: Option<Repository>,
}

impl SourceHandle {
    pub fn new(path: PathBuf, repo: Option<Repository>) -> Self {
        Self { path, repo }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.repo.is_some()
    }

    pub fn close(&mut self) {
        if self.repo.take().is_some() {
            tracing::debug!(path = %self.path.display(), "closed source checkout");
        }
    }
}

/// Produces a working copy of a repository's default branch in `dest`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<SourceHandle, FetchError>;
}

/// Clones with libgit2 on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitFetcher;

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<SourceHandle, FetchError> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let repo = RepoBuilder::new()
                .clone(&url, &dest)
                .map_err(|e| FetchError::Clone {
                    url: url.clone(),
                    message: e.message().to_string(),
                })?;
            Ok(SourceHandle::new(dest, Some(repo)))
        })
        .await
        .map_err(|e| FetchError::Join(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_origin(dir: &Path) {
        let repo = Repository::init(dir).unwrap();
        fs::write(dir.join("project.godot"), "config_version=5\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
    }

    #[tokio::test]
    async fn test_git_fetcher_clones_local_repository() {
        let origin = tempdir().unwrap();
        let origin_path = origin.path().join("game.git");
        init_origin(&origin_path);

        let work = tempdir().unwrap();
        let dest = work.path().join("checkout");
        let mut handle = GitFetcher
            .fetch(origin_path.to_str().unwrap(), &dest)
            .await
            .unwrap();

        assert!(handle.is_open());
        assert_eq!(handle.path(), dest.as_path());
        assert!(dest.join("project.godot").exists());

        handle.close();
        handle.close();
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_git_fetcher_reports_clone_failure() {
        let missing = tempdir().unwrap();
        let url = missing.path().join("nope.git");
        let dest = missing.path().join("checkout");

        let err = GitFetcher
            .fetch(url.to_str().unwrap(), &dest)
            .await
            .err()
            .unwrap();
        match err {
            FetchError::Clone { url: reported, .. } => {
                assert!(reported.ends_with("nope.git"));
            }
            other => panic!("expected clone error, got {:?}", other),
        }
    }
}
