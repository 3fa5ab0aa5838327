//! Configuration for the crawlserver gateway.
//!
//! [`GatewayConfig`] carries everything the gateway needs: the Wasm
//! application path, the HTTP listener settings, the worker pool shape, and
//! the cache bound. It can be built programmatically, deserialized, or read
//! from the `CS_*` environment variables.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Environment variable naming the Wasm application file (required).
pub const ENV_PATH_TO_WASM: &str = "CS_PATH_TO_WASM";
/// Environment variable naming the HTTP port (required).
pub const ENV_SERVER_PORT: &str = "CS_SERVER_PORT";
/// Environment variable overriding the worker pool size.
pub const ENV_CHILD_PROCESSES: &str = "CS_CHILD_PROCESSES";
/// Environment variable enabling verbose logs (presence is enough).
pub const ENV_DEBUG: &str = "CS_DEBUG";
/// Environment variable switching the bind address to 0.0.0.0.
pub const ENV_GLOBAL_BIND: &str = "CS_GLOBAL_BIND";

/// Gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Absolute or relative path to the Wasm application file.
    pub path_to_wasm: PathBuf,

    /// Port the HTTP listener binds to. Also reported to workers so the
    /// in-Wasm `location` mock carries the right host.
    pub server_port: u16,

    /// Number of render worker processes.
    #[serde(default = "defaults::child_processes")]
    pub child_processes: usize,

    /// Verbose logging, including guest stdout/stderr from the workers.
    #[serde(default)]
    pub debug_logs: bool,

    /// Bind 0.0.0.0 instead of loopback.
    #[serde(default)]
    pub global_bind: bool,

    /// Maximum number of requests allowed to wait for an idle worker.
    /// Requests beyond this bound are rejected with a queue-full condition.
    #[serde(default = "defaults::max_pending")]
    pub max_pending: usize,

    /// Parent-side deadline for a single render, in milliseconds. A worker
    /// that misses it is treated as unresponsive and killed.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Maximum number of cached pages before LRU eviction kicks in.
    #[serde(default = "defaults::cache_capacity")]
    pub cache_capacity: usize,

    /// Window after spawn within which an unexpected worker exit counts as
    /// a disaster crash, in milliseconds.
    #[serde(default = "defaults::disaster_window_ms")]
    pub disaster_window_ms: u64,

    /// Respawn delay after a disaster crash, in milliseconds.
    #[serde(default = "defaults::disaster_backoff_ms")]
    pub disaster_backoff_ms: u64,

    /// Respawn delay after an ordinary unexpected exit, in milliseconds.
    #[serde(default = "defaults::respawn_delay_ms")]
    pub respawn_delay_ms: u64,

    /// Command used to start a worker process. Defaults to re-executing the
    /// current binary in worker mode; tests substitute stub commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_command: Option<Vec<String>>,
}

impl GatewayConfig {
    /// Create a configuration with defaults for everything but the two
    /// required settings.
    pub fn new(path_to_wasm: impl Into<PathBuf>, server_port: u16) -> Self {
        Self {
            path_to_wasm: path_to_wasm.into(),
            server_port,
            child_processes: defaults::child_processes(),
            debug_logs: false,
            global_bind: false,
            max_pending: defaults::max_pending(),
            request_timeout_ms: defaults::request_timeout_ms(),
            cache_capacity: defaults::cache_capacity(),
            disaster_window_ms: defaults::disaster_window_ms(),
            disaster_backoff_ms: defaults::disaster_backoff_ms(),
            respawn_delay_ms: defaults::respawn_delay_ms(),
            worker_command: None,
        }
    }

    /// Load configuration from the `CS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `CS_PATH_TO_WASM` or `CS_SERVER_PORT` is missing
    /// or unparseable. The optional variables fall back to their defaults
    /// when absent or malformed.
    pub fn from_env() -> Result<Self, GatewayError> {
        let path = env::var(ENV_PATH_TO_WASM)
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or(GatewayError::MissingWasmPath)?;

        let port = env::var(ENV_SERVER_PORT)
            .map_err(|_| GatewayError::invalid_config(format!("{ENV_SERVER_PORT} is not set")))?
            .parse::<u16>()
            .map_err(|err| {
                GatewayError::invalid_config(format!("{ENV_SERVER_PORT} is not a port: {err}"))
            })?;

        let mut config = Self::new(path, port);
        config.child_processes = env::var(ENV_CHILD_PROCESSES)
            .ok()
            .and_then(|value| value.parse().ok())
            .filter(|&count| count > 0)
            .unwrap_or_else(defaults::child_processes);
        config.debug_logs = env::var_os(ENV_DEBUG).is_some();
        config.global_bind = env::var_os(ENV_GLOBAL_BIND).is_some();

        Ok(config)
    }

    /// Address the HTTP listener binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.global_bind {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, self.server_port)
    }

    /// Parent-side render deadline as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Disaster-crash classification window as a `Duration`.
    pub fn disaster_window(&self) -> Duration {
        Duration::from_millis(self.disaster_window_ms)
    }

    /// Disaster-crash respawn back-off as a `Duration`.
    pub fn disaster_backoff(&self) -> Duration {
        Duration::from_millis(self.disaster_backoff_ms)
    }

    /// Ordinary respawn delay as a `Duration`.
    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn child_processes() -> usize {
        4
    }

    pub const fn max_pending() -> usize {
        1_000
    }

    pub const fn request_timeout_ms() -> u64 {
        10_000
    }

    pub const fn cache_capacity() -> usize {
        10_000
    }

    pub const fn disaster_window_ms() -> u64 {
        5_000
    }

    pub const fn disaster_backoff_ms() -> u64 {
        10_000
    }

    pub const fn respawn_delay_ms() -> u64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::new("/srv/app.wasm", 8080);

        assert_eq!(config.child_processes, 4);
        assert_eq!(config.max_pending, 1_000);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.cache_capacity, 10_000);
        assert_eq!(config.disaster_window_ms, 5_000);
        assert_eq!(config.disaster_backoff_ms, 10_000);
        assert_eq!(config.respawn_delay_ms, 1);
        assert!(!config.debug_logs);
        assert!(!config.global_bind);
        assert!(config.worker_command.is_none());
    }

    #[test]
    fn test_bind_addr() {
        let mut config = GatewayConfig::new("/srv/app.wasm", 4100);
        assert_eq!(config.bind_addr().to_string(), "127.0.0.1:4100");

        config.global_bind = true;
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:4100");
    }

    #[test]
    fn test_durations() {
        let config = GatewayConfig::new("/srv/app.wasm", 8080);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.disaster_window(), Duration::from_secs(5));
        assert_eq!(config.disaster_backoff(), Duration::from_secs(10));
        assert_eq!(config.respawn_delay(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"path_to_wasm": "/srv/app.wasm", "server_port": 4100, "child_processes": 2}"#;
        let config: GatewayConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.server_port, 4100);
        assert_eq!(config.child_processes, 2);
        // Default values for unspecified fields
        assert_eq!(config.max_pending, 1_000);
        assert_eq!(config.cache_capacity, 10_000);
    }

    // Environment access is process-global, so every variable is exercised
    // in a single test to avoid interleaving.
    #[test]
    fn test_from_env() {
        env::remove_var(ENV_PATH_TO_WASM);
        env::remove_var(ENV_SERVER_PORT);
        env::remove_var(ENV_CHILD_PROCESSES);
        env::remove_var(ENV_DEBUG);
        env::remove_var(ENV_GLOBAL_BIND);

        assert!(matches!(
            GatewayConfig::from_env(),
            Err(GatewayError::MissingWasmPath)
        ));

        env::set_var(ENV_PATH_TO_WASM, "/srv/app.wasm");
        assert!(matches!(
            GatewayConfig::from_env(),
            Err(GatewayError::InvalidConfig { .. })
        ));

        env::set_var(ENV_SERVER_PORT, "4100");
        env::set_var(ENV_CHILD_PROCESSES, "8");
        env::set_var(ENV_DEBUG, "1");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.path_to_wasm, PathBuf::from("/srv/app.wasm"));
        assert_eq!(config.server_port, 4100);
        assert_eq!(config.child_processes, 8);
        assert!(config.debug_logs);
        assert!(!config.global_bind);

        // Malformed optional values fall back to the default
        env::set_var(ENV_CHILD_PROCESSES, "zero");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.child_processes, 4);

        env::remove_var(ENV_PATH_TO_WASM);
        env::remove_var(ENV_SERVER_PORT);
        env::remove_var(ENV_CHILD_PROCESSES);
        env::remove_var(ENV_DEBUG);
    }
}
