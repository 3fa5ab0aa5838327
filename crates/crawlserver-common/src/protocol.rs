//! Wire protocol between the gateway and its render workers.
//!
//! Messages travel as newline-delimited JSON over the child's stdin/stdout.
//! The parent sends one [`WorkerCommand`] at a time and the worker answers
//! with exactly one [`WorkerReply`] before the next command is sent.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Reserved first argument that switches the crawlserver binary into worker
/// mode when the pool re-executes it.
pub const WORKER_MODE_ARG: &str = "__crawlserver-worker";

/// A render request dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    /// Request path, without the query string.
    pub path: String,
    /// Query string, without the leading `?`. Empty when absent.
    pub search: String,
    /// Port of the HTTP listener, used for the in-Wasm `location` mock.
    pub server_port: u16,
    /// Path to the Wasm application file.
    pub path_to_wasm: PathBuf,
    /// Modification time of the Wasm file as observed by the gateway,
    /// in milliseconds since the Unix epoch.
    pub wasm_mtime: u64,
    /// Forward guest stdout/stderr to the worker's logs.
    pub debug_logs: bool,
}

/// Parent-to-worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Render the given route.
    Render(RenderJob),
}

/// Worker-to-parent replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerReply {
    /// The route was rendered.
    #[serde(rename_all = "camelCase")]
    Render {
        /// Serialized HTML document.
        html: String,
        /// Application-declared freshness window in seconds. Zero means
        /// the gateway default applies.
        expires_in: u64,
        /// Application-declared last-modified time in Unix seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_modified_at: Option<u64>,
    },
    /// The application did not produce a render for this route.
    NotRendered,
    /// The worker's loaded Wasm is stale; replace the worker and retry.
    Restart,
    /// The worker cannot serve at all and is about to exit.
    Crash {
        /// Description of the failure.
        reason: String,
    },
}

/// Modification time of a file in milliseconds since the Unix epoch.
///
/// This is the staleness signal carried in [`RenderJob::wasm_mtime`]; a
/// worker whose loaded mtime differs from the job's restarts itself.
pub fn wasm_mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_job_wire_shape() {
        let job = RenderJob {
            path: "/hello".into(),
            search: "x=1".into(),
            server_port: 4100,
            path_to_wasm: "/srv/app.wasm".into(),
            wasm_mtime: 1_700_000_000_000,
            debug_logs: false,
        };

        let wire = serde_json::to_value(WorkerCommand::Render(job)).unwrap();
        assert_eq!(wire["type"], "render");
        assert_eq!(wire["path"], "/hello");
        assert_eq!(wire["search"], "x=1");
        assert_eq!(wire["serverPort"], 4100);
        assert_eq!(wire["pathToWasm"], "/srv/app.wasm");
        assert_eq!(wire["wasmMtime"], 1_700_000_000_000u64);
        assert_eq!(wire["debugLogs"], false);
    }

    #[test]
    fn test_reply_wire_tags() {
        let rendered: WorkerReply = serde_json::from_str(
            r#"{"type":"render","html":"<html></html>","expiresIn":60,"lastModifiedAt":1700000000}"#,
        )
        .unwrap();
        assert_eq!(
            rendered,
            WorkerReply::Render {
                html: "<html></html>".into(),
                expires_in: 60,
                last_modified_at: Some(1_700_000_000),
            }
        );

        let not_rendered: WorkerReply = serde_json::from_str(r#"{"type":"not-rendered"}"#).unwrap();
        assert_eq!(not_rendered, WorkerReply::NotRendered);

        let restart: WorkerReply = serde_json::from_str(r#"{"type":"restart"}"#).unwrap();
        assert_eq!(restart, WorkerReply::Restart);

        let crash: WorkerReply =
            serde_json::from_str(r#"{"type":"crash","reason":"no wasm"}"#).unwrap();
        assert_eq!(
            crash,
            WorkerReply::Crash {
                reason: "no wasm".into()
            }
        );
    }

    #[test]
    fn test_last_modified_is_optional() {
        let reply: WorkerReply =
            serde_json::from_str(r#"{"type":"render","html":"<html></html>","expiresIn":0}"#)
                .unwrap();
        assert_eq!(
            reply,
            WorkerReply::Render {
                html: "<html></html>".into(),
                expires_in: 0,
                last_modified_at: None,
            }
        );

        let wire = serde_json::to_value(&reply).unwrap();
        assert!(wire.get("lastModifiedAt").is_none());
    }
}
