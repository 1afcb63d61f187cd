//! Game builds: webhook ingress, build orchestration, realtime progress.
//!
//! ## Overview
//!
//! A signed `push` webhook (or a manual API request) for a linked game queues
//! a build. The orchestrator clones the game's repository, exports it with the
//! headless toolchain into a per-build directory, and records the outcome.
//! Status changes and log lines stream to WebSocket subscribers as they happen.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  GitHub  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  Client  │ <─────── │    ├─ api.rs      (REST handlers, AppState)      │
//! └──────────┘ WebSocket│    ├─ webhook.rs  (signature check, classify)    │
//!                       │    └─ ws.rs       (topic subscriptions)          │
//!                       │         │                                        │
//!                       │         │ BuildQueue::enqueue()                  │
//!                       │         v                                        │
//!                       │  queue.rs  (channel + consumer task)             │
//!                       │         │                                        │
//!                       │         │ BuildOrchestrator::run()               │
//!                       │         v                                        │
//!                       │  orchestrator.rs                                 │
//!                       │    ├─ fetcher.rs  (SourceFetcher, GitFetcher)    │
//!                       │    ├─ export.rs   (toolchain process, merged IO) │
//!                       │    ├─ db.rs       (SQLite, DbHandle)             │
//!                       │    └─ broadcast.rs (topic pub/sub)               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Types
//!
//! - [`db::DbHandle`]: async-safe wrapper around `BuildDb`
//! - [`orchestrator::BuildOrchestrator`]: one run per request, never errors out
//! - [`broadcast::Broadcaster`]: topic-keyed best-effort fan-out
//! - [`webhook::classify`]: push payload to build/skip/ignore decision

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod db;
pub mod export;
pub mod fetcher;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod server;
pub mod signature;
pub mod webhook;
pub mod ws;
