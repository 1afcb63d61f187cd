use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::api::{ApiError, SharedState};
use super::auth::bearer_token;
use super::broadcast::{Broadcaster, Topic};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

type Subscriptions = StreamMap<String, BroadcastStream<String>>;

// ── Frames ───────────────────────────────────────────────────────────

/// Frames a client sends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        topic: String,
        payload: serde_json::Value,
    },
    Subscribed {
        topic: String,
    },
    Unsubscribed {
        topic: String,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    fn into_message(self) -> Option<Message> {
        match serde_json::to_string(&self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize websocket frame");
                None
            }
        }
    }
}

// ── Handler ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub access_token: Option<String>,
}

/// `GET /ws`. The token is checked before the upgrade is accepted.
pub async fn ws_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = bearer_token(&headers)
        .map(str::to_string)
        .or(query.access_token);
    let authorized = token.as_deref().is_some_and(|t| state.tokens.validate(t));
    if !authorized {
        tracing::warn!(
            token_present = token.is_some(),
            "rejected realtime connection"
        );
        return ApiError::Unauthorized("Invalid or missing access token".into()).into_response();
    }

    match ws {
        Ok(ws) => {
            let hub = state.hub.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, hub))
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, hub: Arc<Broadcaster>) {
    let (sender, receiver) = socket.split();
    tracing::debug!("realtime connection opened");
    let subscriptions = run_socket_loop(sender, receiver, &hub).await;
    release_subscriptions(subscriptions, &hub);
    tracing::debug!(topics = hub.topic_count(), "realtime connection closed");
}

/// Drop a closed connection's receivers and prune the topics they leave empty.
fn release_subscriptions(subscriptions: Subscriptions, hub: &Broadcaster) {
    let topics: Vec<String> = subscriptions.keys().cloned().collect();
    drop(subscriptions);
    for topic in topics {
        hub.release(&topic);
    }
}

/// Apply one client text frame to the connection's subscriptions and
/// return the acknowledgement to send back.
fn apply_client_frame(text: &str, subscriptions: &mut Subscriptions, hub: &Broadcaster) -> ServerFrame {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            return ServerFrame::Error {
                message: format!("Invalid frame: {}", e),
            };
        }
    };

    match frame {
        ClientFrame::Subscribe { topic } => {
            let Some(parsed) = Topic::parse(&topic) else {
                return ServerFrame::Error {
                    message: format!("Unknown topic '{}'", topic),
                };
            };
            let key = parsed.to_string();
            if !subscriptions.contains_key(&key) {
                let Some(rx) = hub.subscribe(&key) else {
                    return ServerFrame::Error {
                        message: "Server is shutting down".into(),
                    };
                };
                subscriptions.insert(key.clone(), BroadcastStream::new(rx));
            }
            ServerFrame::Subscribed { topic: key }
        }
        ClientFrame::Unsubscribe { topic } => {
            let key = Topic::parse(&topic).map(|t| t.to_string()).unwrap_or(topic);
            if subscriptions.remove(&key).is_some() {
                hub.release(&key);
            }
            ServerFrame::Unsubscribed { topic: key }
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines subscription forwarding, client frame handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits. Returns the subscriptions still
/// open at that point.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    hub: &Broadcaster,
) -> Subscriptions {
    let mut subscriptions = Subscriptions::new();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if hub.is_closed() {
                    break;
                }
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Subscription forwarding ─────────────────────────────
            Some((topic, item)) = subscriptions.next(), if !subscriptions.is_empty() => {
                let payload = match item {
                    Ok(payload) => payload,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::debug!(%topic, skipped, "realtime subscriber lagged");
                        continue;
                    }
                };
                let payload = serde_json::from_str(&payload)
                    .unwrap_or(serde_json::Value::String(payload));
                let Some(msg) = (ServerFrame::Message { topic, payload }).into_message() else {
                    continue;
                };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = apply_client_frame(text.as_str(), &mut subscriptions, hub);
                        if let Some(reply) = reply.into_message()
                            && sender.send(reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    subscriptions
}
