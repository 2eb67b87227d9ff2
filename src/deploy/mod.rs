//! Push-to-deploy engine.
//!
//! ## Overview
//!
//! A `git push` to a watched repository arrives as a signed webhook. The
//! engine clones the pushed branch, works out how to build it, builds an
//! image, and replaces whatever container was serving that repo+branch with
//! a new one that the reverse proxy picks up from its labels.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  GitHub  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! └──────────┘          │    └─ api.rs  (route handlers, AppState)         │
//!                       │         │ webhook::authenticate()                │
//!                       │         v                                        │
//!                       │  webhook.rs  (verify_signature, WebhookRouter)   │
//!                       │         │ PipelineExecutor::submit()             │
//!                       │         v                                        │
//!                       │  pipeline.rs  (PipelineExecutor, RouteLockMap)   │
//!                       │    │        │                 │                  │
//!                       │    v        v                 v                  │
//!                       │  vcs.rs  planner.rs      lifecycle.rs            │
//!                       │  (clone) (type, policy)  (replace, labels)       │
//!                       │                               │                  │
//!                       │                               v                  │
//!                       │                          runtime.rs (Docker)     │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                              |
//! |-----------|-------------------------------------------------------------|
//! | `models`  | `Deployment`, `DeploymentStatus`, payloads, label keys      |
//! | `store`   | `DeploymentStore` trait; SQLite `DbHandle` (`spawn_blocking`) |
//!
//! ## Deployment States
//!
//! `received → cloned → type_resolved → dockerfile_ready → image_built →
//! container_running`, or `failed` from any of them. Every transition is
//! written to the store as it happens.

pub mod api;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod runtime;
pub mod server;
pub mod store;
pub mod vcs;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
