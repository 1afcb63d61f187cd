//! Topic-keyed publish/subscribe registry for build status and log events.
//!
//! Delivery is best-effort and at-most-once: a message reaches whoever is
//! subscribed at publish time, nothing is persisted, and late subscribers see
//! nothing that came before them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

/// Per-topic buffer. A subscriber that falls further behind than this skips ahead.
const TOPIC_CAPACITY: usize = 1024;

/// A realtime channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// `builds/{game_id}/status`
    Status { game_id: i64 },
    /// `builds/{build_id}/logs`
    Logs { build_id: i64 },
}

impl Topic {
    /// Parse a topic string. Only the two build topic families are accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim_start_matches('/').strip_prefix("builds/")?;
        let (id, kind) = rest.split_once('/')?;
        let id: i64 = id.parse().ok()?;
        match kind {
            "status" => Some(Self::Status { game_id: id }),
            "logs" => Some(Self::Logs { build_id: id }),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { game_id } => write!(f, "builds/{}/status", game_id),
            Self::Logs { build_id } => write!(f, "builds/{}/logs", build_id),
        }
    }
}

/// Process-wide registry of topics and their live subscribers.
///
/// Created once at server start and torn down with [`Broadcaster::shutdown`],
/// which ends every open subscription.
pub struct Broadcaster {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
    closed: AtomicBool,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Subscribe to a topic. Returns `None` once the registry has shut down.
    pub fn subscribe(&self, topic: &str) -> Option<broadcast::Receiver<String>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut topics = self.topics.lock().ok()?;
        let sender = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Some(sender.subscribe())
    }

    /// Deliver a message to current subscribers of `topic`.
    ///
    /// Returns how many subscribers received it. Topics left without
    /// subscribers are dropped from the registry.
    pub fn publish(&self, topic: &str, message: String) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let Ok(mut topics) = self.topics.lock() else {
            tracing::warn!(topic, "broadcaster lock poisoned, dropping message");
            return 0;
        };
        let Some(sender) = topics.get(topic) else {
            return 0;
        };
        match sender.send(message) {
            Ok(delivered) => delivered,
            Err(_) => {
                topics.remove(topic);
                0
            }
        }
    }

    /// Serialize and publish a payload. Serialization failures are logged and dropped.
    pub fn publish_json<T: Serialize>(&self, topic: &Topic, payload: &T) -> usize {
        match serde_json::to_string(payload) {
            Ok(json) => self.publish(&topic.to_string(), json),
            Err(e) => {
                tracing::error!(%topic, error = %e, "failed to serialize broadcast payload");
                0
            }
        }
    }

    /// Drop `topic` from the registry if it has no subscribers left.
    ///
    /// Callers drop their receiver first. Returns whether the topic was removed.
    pub fn release(&self, topic: &str) -> bool {
        let Ok(mut topics) = self.topics.lock() else {
            return false;
        };
        if topics.get(topic).is_some_and(|s| s.receiver_count() == 0) {
            topics.remove(topic);
            return true;
        }
        false
    }

    /// Number of topics currently registered.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|topics| topics.len()).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .ok()
            .and_then(|topics| topics.get(topic).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every topic. Subscribers observe end-of-stream; later publishes are dropped.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut topics) = self.topics.lock() {
            let count = topics.len();
            topics.clear();
            tracing::debug!(topics = count, "broadcaster shut down");
        }
    }
}
