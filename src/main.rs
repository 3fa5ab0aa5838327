//! crawlserver CLI entry point.
//!
//! The same binary serves two roles: the gateway (default) and a render
//! worker (when re-executed by the pool with the reserved first argument).
//! Worker processes keep stdout for the IPC protocol and log to stderr.

use std::env;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlserver_common::config::{
    ENV_CHILD_PROCESSES, ENV_DEBUG, ENV_GLOBAL_BIND, ENV_PATH_TO_WASM, ENV_SERVER_PORT,
};
use crawlserver_common::{GatewayConfig, GatewayError, WORKER_MODE_ARG};
use crawlserver_gateway::GatewayServer;

#[derive(Parser, Debug)]
#[command(
    name = "crawlserver",
    version,
    about = "Server-side rendering gateway for a Wasm single-page application"
)]
struct Cli {
    /// Path to the Wasm application (falls back to CS_PATH_TO_WASM)
    path: Option<PathBuf>,

    /// Port to listen on (falls back to CS_SERVER_PORT)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Number of render worker processes (falls back to CS_CHILD_PROCESSES)
    #[arg(short = 'c', long = "child-processes")]
    child_processes: Option<usize>,

    /// Verbose logging, including guest output from the workers
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Bind 0.0.0.0 instead of loopback
    #[arg(short = 'g', long = "global")]
    global: bool,
}

fn main() {
    if env::args().nth(1).as_deref() == Some(WORKER_MODE_ARG) {
        init_tracing(false, true);
        std::process::exit(crawlserver_host::run_worker());
    }

    let cli = Cli::parse();
    init_tracing(cli.debug || env::var_os(ENV_DEBUG).is_some(), false);

    if let Err(err) = serve(cli) {
        error!(error = %err, "crawlserver failed to start");
        std::process::exit(err.exit_code());
    }
}

#[tokio::main]
async fn serve(cli: Cli) -> Result<(), GatewayError> {
    let config = resolve_config(cli)?;

    if !config.path_to_wasm.exists() {
        return Err(GatewayError::WasmMissing {
            path: config.path_to_wasm,
        });
    }

    info!(
        path = %config.path_to_wasm.display(),
        port = config.server_port,
        workers = config.child_processes,
        "starting crawlserver"
    );

    GatewayServer::new(config)?.run().await
}

/// Merge CLI flags over the `CS_*` environment variables.
fn resolve_config(cli: Cli) -> Result<GatewayConfig, GatewayError> {
    let path = cli
        .path
        .or_else(|| {
            env::var(ENV_PATH_TO_WASM)
                .ok()
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .ok_or(GatewayError::MissingWasmPath)?;

    let port = match cli.port {
        Some(port) => port,
        None => env::var(ENV_SERVER_PORT)
            .ok()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| {
                GatewayError::invalid_config(format!(
                    "no server port: pass -p or set {ENV_SERVER_PORT}"
                ))
            })?,
    };

    let mut config = GatewayConfig::new(path, port);
    config.child_processes = cli
        .child_processes
        .or_else(|| {
            env::var(ENV_CHILD_PROCESSES)
                .ok()
                .and_then(|value| value.parse().ok())
        })
        .filter(|&count| count > 0)
        .unwrap_or(config.child_processes);
    config.debug_logs = cli.debug || env::var_os(ENV_DEBUG).is_some();
    config.global_bind = cli.global || env::var_os(ENV_GLOBAL_BIND).is_some();

    Ok(config)
}

fn init_tracing(debug: bool, worker: bool) {
    let default_filter = if debug {
        "debug,wasmtime=info"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if worker {
        // stdout belongs to the IPC protocol
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
