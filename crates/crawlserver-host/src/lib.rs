//! Render worker host for crawlserver.
//!
//! This crate is the body of a worker child process. It owns exactly one
//! live Wasm instance plus its virtual DOM, and speaks the line-oriented
//! JSON protocol from `crawlserver-common` over stdin/stdout:
//!
//! 1. Read one render job from stdin
//! 2. Render it (cold-starting the Wasm application if needed)
//! 3. Write exactly one reply to stdout
//!
//! The process's own stdout is reserved for that protocol; guest output and
//! host logs go to in-memory pipes and stderr respectively.

use std::io::{BufRead, Write};

use tracing::error;

use crawlserver_common::{WorkerCommand, WorkerReply};

pub mod bindings;
pub mod dom;
pub mod runner;

pub use runner::{JobResult, WorkerHost};

/// Run the worker loop over the process's stdin/stdout until the parent
/// closes the pipe or a job demands termination. Returns the exit code.
pub fn run_worker() -> i32 {
    let host = match WorkerHost::new() {
        Ok(host) => host,
        Err(err) => {
            error!(error = %err, "failed to initialize worker host");
            return 1;
        }
    };
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_worker_loop(host, stdin.lock(), stdout.lock())
}

fn run_worker_loop<R: BufRead, W: Write>(mut host: WorkerHost, input: R, mut output: W) -> i32 {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to read job from parent");
                return 1;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let WorkerCommand::Render(job) = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(err) => {
                error!(error = %err, "malformed job from parent");
                return 1;
            }
        };

        let result = host.handle(&job);
        if let Err(err) = write_reply(&mut output, &result.reply) {
            error!(error = %err, "failed to write reply to parent");
            return 1;
        }
        if let Some(code) = result.exit {
            return code;
        }
    }

    // stdin closed: the parent went away or terminated us
    0
}

fn write_reply<W: Write>(output: &mut W, reply: &WorkerReply) -> std::io::Result<()> {
    let line = serde_json::to_string(reply)?;
    writeln!(output, "{line}")?;
    output.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlserver_common::RenderJob;

    #[test]
    fn test_missing_wasm_replies_crash_and_exits_nonzero() {
        let host = WorkerHost::new().unwrap();
        let job = RenderJob {
            path: "/".into(),
            search: String::new(),
            server_port: 4100,
            path_to_wasm: "/nonexistent/app.wasm".into(),
            wasm_mtime: 0,
            debug_logs: false,
        };
        let input = format!(
            "{}\n",
            serde_json::to_string(&WorkerCommand::Render(job)).unwrap()
        );

        let mut output = Vec::new();
        let code = run_worker_loop(host, input.as_bytes(), &mut output);

        assert_eq!(code, 1);
        let text = String::from_utf8(output).unwrap();
        let reply: WorkerReply = serde_json::from_str(text.trim()).unwrap();
        assert!(matches!(reply, WorkerReply::Crash { .. }));
    }

    #[test]
    fn test_empty_input_exits_cleanly() {
        let host = WorkerHost::new().unwrap();
        let mut output = Vec::new();
        let code = run_worker_loop(host, &b""[..], &mut output);
        assert_eq!(code, 0);
        assert!(output.is_empty());
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let host = WorkerHost::new().unwrap();
        let mut output = Vec::new();
        let code = run_worker_loop(host, &b"\n\n"[..], &mut output);
        assert_eq!(code, 0);
        assert!(output.is_empty());
    }
}
