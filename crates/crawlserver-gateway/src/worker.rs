//! Handle to one render worker child process.
//!
//! A [`Worker`] owns the child's stdin and buffered stdout; the `Child`
//! itself lives in a monitor task that waits for the process to exit and
//! notifies the pool. Termination requests travel to the monitor over a
//! oneshot, so kill and wait never race over ownership of the handle. The
//! monitor also listens on the pool-wide terminate broadcast, which kills
//! the child even while its handle is away on a job.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crawlserver_common::{GatewayError, RenderJob, WorkerCommand, WorkerReply};

const SIGTERM: i32 = 15;

#[derive(Debug, Default)]
struct WorkerFlags {
    intentional: AtomicBool,
    restarting: AtomicBool,
}

/// Notification sent by a worker's monitor task when its process exits.
#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub(crate) id: u32,
    pub(crate) spawned_at: Instant,
    pub(crate) at: Instant,
    pub(crate) status: Option<ExitStatus>,
    pub(crate) intentional: bool,
    pub(crate) restarting: bool,
}

/// An isolated render worker.
pub struct Worker {
    id: u32,
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    flags: Arc<WorkerFlags>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl Worker {
    /// Spawn a worker process and its monitor task. A message on
    /// `terminate_rx` kills the child as a deliberate termination, whether
    /// it is idle or mid-job.
    pub(crate) fn spawn(
        id: u32,
        command: &[String],
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
        terminate_rx: broadcast::Receiver<()>,
    ) -> Result<Self, GatewayError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GatewayError::invalid_config("worker command is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::invalid_config("worker stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::invalid_config("worker stdout was not piped"))?;

        let flags = Arc::new(WorkerFlags::default());
        let (kill_tx, kill_rx) = oneshot::channel();
        let spawned_at = Instant::now();

        tokio::spawn(monitor(
            id,
            child,
            kill_rx,
            terminate_rx,
            Arc::clone(&flags),
            spawned_at,
            exit_tx,
        ));

        Ok(Self {
            id,
            stdin,
            replies: BufReader::new(stdout).lines(),
            flags,
            kill_tx: Some(kill_tx),
        })
    }

    /// Send one render job and await its reply.
    ///
    /// Jobs are never pipelined: one job is in flight per worker, and the
    /// parent waits for the reply before sending another. A worker that
    /// stays silent past `timeout` is unresponsive and must be discarded
    /// by the caller.
    pub(crate) async fn render(
        &mut self,
        job: &RenderJob,
        timeout: Duration,
    ) -> Result<WorkerReply, GatewayError> {
        let mut line = serde_json::to_string(&WorkerCommand::Render(job.clone()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        match tokio::time::timeout(timeout, self.replies.next_line()).await {
            Err(_) => Err(GatewayError::RenderTimeout {
                duration_ms: timeout.as_millis() as u64,
            }),
            Ok(Ok(Some(reply))) => Ok(serde_json::from_str(&reply)?),
            Ok(Ok(None)) => Err(GatewayError::worker_crashed(
                "worker closed its reply stream",
            )),
            Ok(Err(err)) => Err(GatewayError::Io(err)),
        }
    }

    /// Ask the monitor to kill the child.
    pub(crate) fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }

    /// Kill the child as a deliberate termination; the pool will not
    /// respawn it.
    pub(crate) fn terminate(&mut self) {
        self.flags.intentional.store(true, Ordering::SeqCst);
        self.kill();
    }

    /// Flag the child as being replaced because its loaded Wasm went stale.
    /// Its exit is then fully handled inline by the dispatch path.
    pub(crate) fn mark_restarting(&self) {
        self.flags.restarting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

async fn monitor(
    id: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    mut terminate_rx: broadcast::Receiver<()>,
    flags: Arc<WorkerFlags>,
    spawned_at: Instant,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
        // Fires on pool shutdown, and when the pool itself is gone
        _ = terminate_rx.recv() => {
            flags.intentional.store(true, Ordering::SeqCst);
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let status = status.ok();

    let exit = WorkerExit {
        id,
        spawned_at,
        at: Instant::now(),
        intentional: flags.intentional.load(Ordering::SeqCst) || term_signalled(status.as_ref()),
        restarting: flags.restarting.load(Ordering::SeqCst),
        status,
    };
    debug!(worker_id = id, status = ?exit.status, "worker exited");
    let _ = exit_tx.send(exit);
}

/// A SIGTERM delivered from outside counts as a deliberate kill.
fn term_signalled(status: Option<&ExitStatus>) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.and_then(|status| status.signal()) == Some(SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn spawn_stub(
        script: &str,
        exit_tx: mpsc::UnboundedSender<WorkerExit>,
    ) -> (Worker, broadcast::Sender<()>) {
        let (terminate_tx, _) = broadcast::channel(1);
        let worker = Worker::spawn(0, &stub(script), exit_tx, terminate_tx.subscribe()).unwrap();
        (worker, terminate_tx)
    }

    fn job() -> RenderJob {
        RenderJob {
            path: "/hello".into(),
            search: String::new(),
            server_port: 4100,
            path_to_wasm: "/tmp/app.wasm".into(),
            wasm_mtime: 0,
            debug_logs: false,
        }
    }

    #[tokio::test]
    async fn test_render_round_trip() {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let (mut worker, _terminate) = spawn_stub(
            r#"while read line; do printf '%s\n' '{"type":"not-rendered"}'; done"#,
            exit_tx,
        );

        let reply = worker.render(&job(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply, WorkerReply::NotRendered);

        worker.terminate();
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let (mut worker, _terminate) = spawn_stub("while read line; do sleep 30; done", exit_tx);

        let err = worker
            .render(&job(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_render_timeout());

        worker.kill();
    }

    #[tokio::test]
    async fn test_exiting_worker_reports_crash() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (mut worker, _terminate) = spawn_stub("read line; exit 7", exit_tx);

        let err = worker.render(&job(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, GatewayError::WorkerCrashed { .. }));

        let exit = exit_rx.recv().await.unwrap();
        assert!(!exit.intentional);
        assert!(!exit.restarting);
    }

    #[tokio::test]
    async fn test_terminate_is_intentional() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (mut worker, _terminate) = spawn_stub("while read line; do :; done", exit_tx);

        worker.terminate();
        let exit = exit_rx.recv().await.unwrap();
        assert!(exit.intentional);
    }

    #[tokio::test]
    async fn test_terminate_broadcast_is_intentional() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (_worker, terminate) = spawn_stub("while read line; do :; done", exit_tx);

        // The worker handle never asked for the kill; the pool-wide
        // signal alone must bring the child down as deliberate.
        terminate.send(()).unwrap();
        let exit = exit_rx.recv().await.unwrap();
        assert!(exit.intentional);
        assert!(!exit.restarting);
    }

    #[tokio::test]
    async fn test_terminate_broadcast_cuts_off_a_running_render() {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let (mut worker, terminate) = spawn_stub("while read line; do sleep 30; done", exit_tx);

        let render = tokio::spawn(async move {
            let job = job();
            worker.render(&job, Duration::from_secs(30)).await
        });

        // Let the job reach the worker before pulling the plug
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminate.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), render)
            .await
            .expect("render survived the terminate signal")
            .unwrap();
        assert!(matches!(result, Err(GatewayError::WorkerCrashed { .. })));
    }

    #[tokio::test]
    async fn test_mark_restarting_reaches_monitor() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (mut worker, _terminate) = spawn_stub("while read line; do :; done", exit_tx);

        worker.mark_restarting();
        worker.kill();
        let exit = exit_rx.recv().await.unwrap();
        assert!(exit.restarting);
    }
}
