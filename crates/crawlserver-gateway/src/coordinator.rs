//! Per-request render pipeline.
//!
//! Every GET that reaches the gateway flows through [`render_page`]:
//! blocked-extension rejection, precondition parsing, cache lookup, Wasm
//! staleness stat, dispatch to a worker, and response assembly. Stale-Wasm
//! restarts are retried on an inline replacement; everything else
//! recoverable turns into a status code without leaving the handler.

use std::time::SystemTime;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::Response;
use tracing::{info, warn};
use uuid::Uuid;

use crawlserver_common::{wasm_mtime_millis, RenderJob, WorkerReply};

use crate::cache::{precondition_matches, CacheEntry};
use crate::reporter::Situation;
use crate::state::GatewayState;

/// Extensions that belong to the fronting static handler; seeing one here
/// is a misconfiguration.
pub const BLOCKED_EXTENSIONS: [&str; 5] = ["ico", "css", "js", "html", "json"];

/// Cap on inline retries when workers keep reporting stale Wasm. More than
/// a couple of rounds means the mtime signal itself is broken.
const MAX_STALE_RESTARTS: u32 = 3;

/// Catch-all GET handler: serve from cache or render via the worker pool.
pub async fn render_page(
    State(state): State<GatewayState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request_id = Uuid::new_v4();
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| uri.path().to_owned());
    let (path, search) = split_target(&target);

    if has_blocked_extension(path) {
        return status_response(
            StatusCode::NOT_FOUND,
            "static asset routed to the render gateway",
        );
    }

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    // A malformed date parses to absent
    let if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok());

    if let Some(entry) = state.cache().lookup(&target) {
        info!(%request_id, %target, "serving from cache");
        return entry_response(&entry, if_none_match.as_deref(), if_modified_since);
    }

    let config = state.config();
    let metadata = match tokio::fs::metadata(&config.path_to_wasm).await {
        Ok(metadata) => metadata,
        Err(_) => {
            state.reporter().report(
                Situation::WasmMissing,
                format!("wasm file missing at {}", config.path_to_wasm.display()),
            );
            return status_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "wasm application is missing",
            );
        }
    };

    let job = RenderJob {
        path: path.to_owned(),
        search: search.to_owned(),
        server_port: config.server_port,
        path_to_wasm: config.path_to_wasm.clone(),
        wasm_mtime: wasm_mtime_millis(&metadata),
        debug_logs: config.debug_logs,
    };

    let mut worker = match state.pool().acquire().await {
        Ok(worker) => worker,
        Err(err) if err.is_queue_full() => {
            warn!(%request_id, %target, "render queue is full");
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "render queue is full");
        }
        Err(err) => {
            state
                .reporter()
                .report(Situation::RequestFailed, format!("dispatch failed: {err}"));
            return status_response(StatusCode::SERVICE_UNAVAILABLE, "dispatch failed");
        }
    };

    let timeout = config.request_timeout();
    let mut restarts = 0;
    loop {
        match worker.render(&job, timeout).await {
            Ok(WorkerReply::Render {
                html,
                expires_in,
                last_modified_at,
            }) => {
                state.pool().release(worker);
                if html.is_empty() {
                    state.reporter().report(
                        Situation::RequestFailed,
                        format!("empty render body for {target}"),
                    );
                    return status_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "render produced an empty document",
                    );
                }
                let entry = state
                    .cache()
                    .fill(&target, &html, expires_in, last_modified_at);
                state
                    .reporter()
                    .report(Situation::HtmlRendered, format!("rendered {target}"));
                info!(%request_id, %target, etag = %entry.etag, "rendered");
                // Preconditions are evaluated against the fresh render
                return entry_response(&entry, if_none_match.as_deref(), if_modified_since);
            }
            Ok(WorkerReply::NotRendered) => {
                state.pool().release(worker);
                state.reporter().report(
                    Situation::HtmlNotRendered,
                    format!("application did not render {target}"),
                );
                return status_response(
                    StatusCode::NOT_IMPLEMENTED,
                    "application did not render this route",
                );
            }
            Ok(WorkerReply::Restart) => {
                restarts += 1;
                if restarts > MAX_STALE_RESTARTS {
                    state.pool().discard(worker);
                    state.reporter().report(
                        Situation::RequestFailed,
                        format!("worker restart loop while rendering {target}"),
                    );
                    return status_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "render workers keep restarting",
                    );
                }
                info!(%request_id, %target, restarts, "wasm stale; retrying on a fresh worker");
                worker = match state.pool().replace_stale(worker) {
                    Ok(replacement) => replacement,
                    Err(err) => {
                        state.reporter().report(
                            Situation::RequestFailed,
                            format!("worker replacement failed: {err}"),
                        );
                        return status_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "worker replacement failed",
                        );
                    }
                };
            }
            Ok(WorkerReply::Crash { reason }) => {
                // The child is exiting; the pool supervisor replaces it.
                drop(worker);
                state
                    .reporter()
                    .report(Situation::RequestFailed, format!("worker crashed: {reason}"));
                return status_response(StatusCode::SERVICE_UNAVAILABLE, "render worker crashed");
            }
            Err(err) if err.is_render_timeout() => {
                state.pool().discard(worker);
                state.reporter().report(
                    Situation::RequestFailed,
                    format!("render timed out for {target}"),
                );
                return status_response(StatusCode::SERVICE_UNAVAILABLE, "render timed out");
            }
            Err(err) => {
                drop(worker);
                state.reporter().report(
                    Situation::RequestFailed,
                    format!("render failed for {target}: {err}"),
                );
                return status_response(StatusCode::SERVICE_UNAVAILABLE, "render failed");
            }
        }
    }
}

/// Split a request target into path and query at the first `?`.
pub fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, search)) => (path, search),
        None => (target, ""),
    }
}

/// Returns `true` when the path names a file type the static front door
/// should have served.
pub fn has_blocked_extension(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rsplit_once('.') {
        Some((_, extension)) => {
            BLOCKED_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
        }
        None => false,
    }
}

fn entry_response(
    entry: &CacheEntry,
    if_none_match: Option<&str>,
    if_modified_since: Option<SystemTime>,
) -> Response {
    if precondition_matches(entry, if_none_match, if_modified_since) {
        not_modified(entry)
    } else {
        rendered_page(entry)
    }
}

fn rendered_page(entry: &CacheEntry) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::ETAG, entry.etag.as_str());
    if let Some(last_modified) = entry.last_modified {
        response = response.header(header::LAST_MODIFIED, httpdate::fmt_http_date(last_modified));
    }
    response
        .body(Body::from(entry.body.clone()))
        .unwrap_or_else(|_| fallback_error())
}

fn not_modified(entry: &CacheEntry) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, entry.etag.as_str());
    if let Some(last_modified) = entry.last_modified {
        response = response.header(header::LAST_MODIFIED, httpdate::fmt_http_date(last_modified));
    }
    response
        .body(Body::empty())
        .unwrap_or_else(|_| fallback_error())
}

fn status_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_owned()))
        .unwrap_or_else(|_| fallback_error())
}

fn fallback_error() -> Response {
    let mut response = Response::new(Body::from("internal server error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("/hello?x=1"), ("/hello", "x=1"));
        assert_eq!(split_target("/hello"), ("/hello", ""));
        assert_eq!(split_target("/a?b=1?c=2"), ("/a", "b=1?c=2"));
        assert_eq!(split_target("/"), ("/", ""));
    }

    #[test]
    fn test_blocked_extensions() {
        assert!(has_blocked_extension("/favicon.ico"));
        assert!(has_blocked_extension("/assets/app.css"));
        assert!(has_blocked_extension("/bundle.js"));
        assert!(has_blocked_extension("/index.html"));
        assert!(has_blocked_extension("/data.JSON"));

        assert!(!has_blocked_extension("/hello"));
        assert!(!has_blocked_extension("/a.b/route"));
        assert!(!has_blocked_extension("/image.png"));
        assert!(!has_blocked_extension("/"));
    }
}
