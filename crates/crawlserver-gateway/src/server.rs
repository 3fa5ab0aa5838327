//! HTTP server implementation.
//!
//! [`GatewayServer`] binds the listener, runs the router until shutdown,
//! and tears the worker pool down afterwards. [`TestHandle`] runs the same
//! stack on an ephemeral port for tests.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use crawlserver_common::{GatewayConfig, GatewayError};

use crate::reporter::Situation;
use crate::router::build_router;
use crate::state::GatewayState;

/// The crawlserver HTTP server.
pub struct GatewayServer {
    state: GatewayState,
}

impl GatewayServer {
    /// Create a server, spawning the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the workers cannot be spawned.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            state: GatewayState::new(config)?,
        })
    }

    /// Shared gateway state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Run until a shutdown signal (SIGTERM/ctrl-c) arrives. The workers
    /// are terminated the moment the signal fires, concurrently with the
    /// listener closing, so in-flight renders are cut off and pending
    /// requests observe the connection close instead of draining.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self) -> Result<(), GatewayError> {
        let addr = self.state.config().bind_addr();
        let router = build_router(self.state.clone());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| GatewayError::listen_failed(format!("{addr}: {err}")))?;

        self.state
            .reporter()
            .report(Situation::ServerStarted, format!("listening on {addr}"));
        info!(%addr, "http listener bound");

        let state = self.state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                state.pool().shutdown();
            })
            .await?;

        self.state
            .reporter()
            .report(Situation::FulfilledStopCall, "stop call fulfilled");
        Ok(())
    }

    /// Start the server on an ephemeral loopback port and return a handle
    /// for tests.
    pub async fn start_test(mut config: GatewayConfig) -> Result<TestHandle, GatewayError> {
        config.global_bind = false;
        config.server_port = 0;
        let state = GatewayState::new(config)?;
        let router = build_router(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|err| GatewayError::listen_failed(err.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|err| GatewayError::listen_failed(err.to_string()))?;

        state
            .reporter()
            .report(Situation::ServerStarted, format!("listening on {addr}"));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let serve_state = state.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    // Workers die with the listener; in-flight renders
                    // are cut off rather than drained
                    serve_state.pool().shutdown();
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
pub struct TestHandle {
    addr: SocketAddr,
    state: GatewayState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// The address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shared gateway state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Shut the server down, terminating the workers as the listener
    /// closes. An in-flight render fails rather than completing.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        let _ = self.handle.await;
        // Covers the path where the serve task died before the signal
        self.state.pool().shutdown();
    }
}

/// Wait for SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> GatewayConfig {
        let mut config = GatewayConfig::new("/nonexistent/app.wasm", 0);
        config.child_processes = 1;
        config.worker_command = Some(vec![
            "/bin/sh".into(),
            "-c".into(),
            "while read line; do :; done".into(),
        ]);
        config
    }

    #[tokio::test]
    async fn test_start_test_binds_ephemeral_port() {
        let handle = GatewayServer::start_test(stub_config()).await.unwrap();
        assert_ne!(handle.addr().port(), 0);
        assert!(handle.url().starts_with("http://127.0.0.1:"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_started_event() {
        let config = stub_config();
        let handle = GatewayServer::start_test(config).await.unwrap();

        // The reporter saw server_started before the handle was returned;
        // prove it by observing the dedup state: another operating-state
        // event is suppressed.
        assert!(!handle
            .state()
            .reporter()
            .report(Situation::HtmlRendered, "still operating"));

        handle.shutdown().await;
    }
}
