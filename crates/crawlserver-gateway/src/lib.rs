//! HTTP gateway for crawlserver.
//!
//! This crate is the parent-process half of the system:
//! - [`coordinator`]: the per-request pipeline (cache → dispatch → response)
//! - [`cache`]: per-URL render cache with TTL, ETag, and conditional logic
//! - [`dispatch`]: bounded FIFO queue matching requests to idle workers
//! - [`pool`]: worker lifecycle, crash classification, back-off respawn
//! - [`reporter`]: deduplicated stream of lifecycle state events
//! - [`server`]: axum server wiring and graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! HTTP GET ──▶ coordinator ──▶ cache hit? ──▶ 200 / 304
//!                   │ miss
//!                   ▼
//!             dispatch queue ──▶ worker pool ──▶ worker process
//!                   ▲                 │  (Wasm + virtual DOM)
//!                   │                 ▼
//!               cache fill ◀──── rendered HTML
//! ```

pub mod cache;
pub mod coordinator;
pub mod dispatch;
pub mod pool;
pub mod reporter;
pub mod router;
pub mod server;
pub mod state;
pub mod worker;

pub use cache::RenderCache;
pub use pool::WorkerPool;
pub use reporter::{ServerState, Situation, StateEvent, StateReporter};
pub use router::build_router;
pub use server::{GatewayServer, TestHandle};
pub use state::GatewayState;
