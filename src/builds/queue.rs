//! Fire-and-forget hand-off from request handlers to the build orchestrator.
//!
//! Handlers push a [`BuildRequest`] and return immediately. A single consumer
//! task drains the channel and spawns one orchestrator run per request, so
//! builds for different (or the same) games run concurrently.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::models::Game;
use super::orchestrator::BuildOrchestrator;

/// What caused a build to be requested.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildTrigger {
    /// A verified push to the game's default branch.
    Push { commit_id: Option<String> },
    /// An explicit request through the HTTP API.
    Manual,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub game: Game,
    pub trigger: BuildTrigger,
}

/// Sending half of the build channel. Cheap to clone.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::UnboundedSender<BuildRequest>,
}

impl BuildQueue {
    /// Create a queue and hand back the receiving end, for callers that
    /// drive consumption themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuildRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a queue whose requests are executed by `orchestrator`.
    ///
    /// The consumer task ends once every `BuildQueue` clone has been dropped.
    pub fn start(orchestrator: Arc<BuildOrchestrator>) -> (Self, JoinHandle<()>) {
        let (queue, rx) = Self::channel();
        let consumer = tokio::spawn(run_consumer(rx, orchestrator));
        (queue, consumer)
    }

    /// Enqueue a build. Never waits on the build itself.
    pub fn enqueue(&self, request: BuildRequest) -> Result<()> {
        let game_id = request.game.id;
        self.tx
            .send(request)
            .map_err(|_| anyhow!("Build queue is closed; dropped request for game {}", game_id))
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<BuildRequest>,
    orchestrator: Arc<BuildOrchestrator>,
) {
    while let Some(request) = rx.recv().await {
        tracing::info!(
            game_id = request.game.id,
            trigger = ?request.trigger,
            "build request dequeued"
        );
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run(&request.game).await;
        });
    }
    tracing::debug!("build queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builds::models::GameRepository;

    fn game(id: i64) -> Game {
        Game {
            id,
            title: "Test".into(),
            repository: GameRepository {
                remote_id: 100 + id,
                html_url: "https://example.com/acme/test".into(),
                default_branch: "main".into(),
            },
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_delivers_in_order() {
        let (queue, mut rx) = BuildQueue::channel();
        queue
            .enqueue(BuildRequest {
                game: game(1),
                trigger: BuildTrigger::Manual,
            })
            .unwrap();
        queue
            .enqueue(BuildRequest {
                game: game(2),
                trigger: BuildTrigger::Push {
                    commit_id: Some("abc".into()),
                },
            })
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().game.id, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.game.id, 2);
        assert_eq!(
            second.trigger,
            BuildTrigger::Push {
                commit_id: Some("abc".into())
            }
        );
    }

    #[test]
    fn test_enqueue_after_receiver_dropped_errors() {
        let (queue, rx) = BuildQueue::channel();
        drop(rx);
        let err = queue
            .enqueue(BuildRequest {
                game: game(5),
                trigger: BuildTrigger::Manual,
            })
            .unwrap_err();
        assert!(err.to_string().contains("game 5"));
    }
}
