//! Common types, errors, and the worker wire protocol for crawlserver.
//!
//! This crate provides shared functionality used across the crawlserver
//! workspace:
//! - Error types using `thiserror` for both the gateway and the workers
//! - Gateway configuration, loadable from the `CS_*` environment variables
//! - The JSON wire protocol spoken between the gateway and its workers

pub mod config;
pub mod error;
pub mod protocol;

pub use config::GatewayConfig;
pub use error::{GatewayError, HostError};
pub use protocol::{wasm_mtime_millis, RenderJob, WorkerCommand, WorkerReply, WORKER_MODE_ARG};
