//! Error types for crawlserver.
//!
//! This module defines two error hierarchies using `thiserror`:
//! - [`GatewayError`]: errors raised in the accepting process (the gateway)
//! - [`HostError`]: errors raised inside a render worker child process

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised in the gateway process.
///
/// Everything recoverable is recovered inside the request coordinator; only
/// fatal startup errors terminate the process, using the exit code from
/// [`GatewayError::exit_code`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The pending-request queue reached its configured bound.
    ///
    /// Callers are expected to retry; the coordinator answers 503.
    #[error("render queue is full")]
    QueueFull,

    /// The worker pool was torn down while a request was waiting on it.
    #[error("worker pool is closed")]
    PoolClosed,

    /// No Wasm application path was supplied via CLI or environment.
    #[error("no wasm application path was provided")]
    MissingWasmPath,

    /// The configured Wasm application file does not exist.
    #[error("wasm application not found at {path}")]
    WasmMissing {
        /// The path that was checked.
        path: PathBuf,
    },

    /// A render worker did not reply within the per-request deadline.
    #[error("render timed out after {duration_ms}ms")]
    RenderTimeout {
        /// The deadline in milliseconds.
        duration_ms: u64,
    },

    /// A render worker died or closed its reply stream mid-job.
    #[error("render worker crashed: {reason}")]
    WorkerCrashed {
        /// Description of the crash as observed by the gateway.
        reason: String,
    },

    /// The HTTP listener could not be bound.
    #[error("failed to bind http listener: {reason}")]
    ListenFailed {
        /// Description of the bind failure.
        reason: String,
    },

    /// Invalid configuration was provided.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A worker IPC message could not be encoded or decoded.
    #[error("worker protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a new `WorkerCrashed` error.
    pub fn worker_crashed(reason: impl Into<String>) -> Self {
        Self::WorkerCrashed {
            reason: reason.into(),
        }
    }

    /// Create a new `ListenFailed` error.
    pub fn listen_failed(reason: impl Into<String>) -> Self {
        Self::ListenFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the pending-request queue rejected the request.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull)
    }

    /// Returns `true` if a worker missed the per-request deadline.
    pub fn is_render_timeout(&self) -> bool {
        matches!(self, Self::RenderTimeout { .. })
    }

    /// Process exit code for fatal startup errors.
    ///
    /// 10 = Wasm path missing, 20 = Wasm file not found, 30 = HTTP listener
    /// failed, 1 = anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingWasmPath => 10,
            Self::WasmMissing { .. } => 20,
            Self::ListenFailed { .. } => 30,
            _ => 1,
        }
    }
}

/// Errors raised inside a render worker child process.
#[derive(Error, Debug)]
pub enum HostError {
    /// The job named no Wasm file, or the file is absent.
    #[error("wasm application not found at {path}")]
    WasmMissing {
        /// The path that was checked.
        path: PathBuf,
    },

    /// Compiling or instantiating the Wasm module failed.
    #[error("wasm instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The application's start sequence trapped or misbehaved.
    #[error("application start failed: {reason}")]
    StartFailed {
        /// Description of the start failure.
        reason: String,
    },

    /// The application did not signal start within the deadline.
    #[error("application start deadline elapsed")]
    StartDeadline,

    /// The application registered no route-change callback.
    #[error("application registered no route-change callback")]
    MissingChangeRoute,

    /// Dispatching a route change to the application failed.
    #[error("route change failed: {reason}")]
    RouteFailed {
        /// Description of the route-change failure.
        reason: String,
    },

    /// Reading from or writing to guest memory failed.
    #[error("guest memory access failed: {reason}")]
    GuestMemory {
        /// Description of the memory-access failure.
        reason: String,
    },

    /// I/O operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `StartFailed` error.
    pub fn start_failed(reason: impl Into<String>) -> Self {
        Self::StartFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `RouteFailed` error.
    pub fn route_failed(reason: impl Into<String>) -> Self {
        Self::RouteFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `GuestMemory` error.
    pub fn guest_memory(reason: impl Into<String>) -> Self {
        Self::GuestMemory {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the failure should surface as `not-rendered`
    /// rather than a worker crash: the host is intact, the application
    /// simply failed to cooperate.
    pub fn is_not_rendered(&self) -> bool {
        matches!(
            self,
            Self::StartDeadline
                | Self::StartFailed { .. }
                | Self::MissingChangeRoute
                | Self::RouteFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(GatewayError::MissingWasmPath.exit_code(), 10);
        assert_eq!(
            GatewayError::WasmMissing {
                path: "/tmp/app.wasm".into()
            }
            .exit_code(),
            20
        );
        assert_eq!(GatewayError::listen_failed("in use").exit_code(), 30);
        assert_eq!(GatewayError::QueueFull.exit_code(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::RenderTimeout { duration_ms: 10_000 };
        assert_eq!(err.to_string(), "render timed out after 10000ms");

        let err = GatewayError::QueueFull;
        assert_eq!(err.to_string(), "render queue is full");
    }

    #[test]
    fn test_predicates() {
        assert!(GatewayError::QueueFull.is_queue_full());
        assert!(!GatewayError::PoolClosed.is_queue_full());
        assert!(GatewayError::RenderTimeout { duration_ms: 1 }.is_render_timeout());
    }

    #[test]
    fn test_host_error_classification() {
        assert!(HostError::StartDeadline.is_not_rendered());
        assert!(HostError::MissingChangeRoute.is_not_rendered());
        assert!(HostError::route_failed("trap").is_not_rendered());
        assert!(!HostError::instantiation("bad magic").is_not_rendered());
        assert!(!HostError::WasmMissing {
            path: "/tmp/app.wasm".into()
        }
        .is_not_rendered());
    }
}
