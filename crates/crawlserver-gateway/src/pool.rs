//! Fixed-size pool of render workers.
//!
//! The pool spawns `N` workers at construction and keeps the population at
//! `N` through the supervisor task: unexpected exits respawn after a short
//! delay, exits within the disaster window respawn only after a back-off.
//! Deliberate terminations are final; stale-Wasm replacements are arranged
//! inline by the dispatch path and skipped by the supervisor.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crawlserver_common::{GatewayConfig, GatewayError, WORKER_MODE_ARG};

use crate::dispatch::DispatchQueue;
use crate::reporter::{Situation, StateReporter};
use crate::worker::{Worker, WorkerExit};

/// Fixed-size set of render workers with lifecycle supervision.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    command: Vec<String>,
    size: usize,
    dispatch: DispatchQueue<Worker>,
    reporter: Arc<StateReporter>,
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    terminate_tx: broadcast::Sender<()>,
    next_id: AtomicU32,
    live: AtomicUsize,
    shutting_down: AtomicBool,
    disaster_window: Duration,
    disaster_backoff: Duration,
    respawn_delay: Duration,
}

impl WorkerPool {
    /// Spawn the configured number of workers and start the supervisor.
    pub fn new(
        config: &GatewayConfig,
        reporter: Arc<StateReporter>,
    ) -> Result<Self, GatewayError> {
        let command = match &config.worker_command {
            Some(command) => command.clone(),
            None => default_worker_command()?,
        };

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (terminate_tx, _) = broadcast::channel(1);
        let inner = Arc::new(PoolInner {
            command,
            size: config.child_processes,
            dispatch: DispatchQueue::new(config.max_pending),
            reporter,
            exit_tx,
            terminate_tx,
            next_id: AtomicU32::new(0),
            live: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            disaster_window: config.disaster_window(),
            disaster_backoff: config.disaster_backoff(),
            respawn_delay: config.respawn_delay(),
        });

        for _ in 0..inner.size {
            let worker = inner.spawn_worker()?;
            inner.dispatch.release(worker);
        }
        tokio::spawn(supervise(Arc::clone(&inner), exit_rx));

        Ok(Self { inner })
    }

    /// Take an idle worker, suspending until one frees up. Fails fast with
    /// a queue-full condition when too many requests are already waiting.
    pub async fn acquire(&self) -> Result<Worker, GatewayError> {
        self.inner.dispatch.acquire().await
    }

    /// Return a worker after a completed job.
    pub fn release(&self, mut worker: Worker) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            worker.terminate();
            return;
        }
        self.inner.dispatch.release(worker);
    }

    /// Replace a worker whose loaded Wasm went stale. The replacement is
    /// handed straight back to the caller for inline re-dispatch; it is
    /// never parked idle, so the pending queue cannot steal it.
    pub fn replace_stale(&self, mut stale: Worker) -> Result<Worker, GatewayError> {
        debug!(worker_id = stale.id(), "replacing worker after wasm update");
        stale.mark_restarting();
        stale.kill();
        drop(stale);
        self.inner.spawn_worker()
    }

    /// Drop a worker that crashed or stopped responding mid-job. The
    /// supervisor respawns a replacement when the process exit surfaces.
    pub fn discard(&self, mut worker: Worker) {
        debug!(worker_id = worker.id(), "discarding unresponsive worker");
        worker.kill();
    }

    /// Number of live worker processes.
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of idle workers.
    pub fn idle_workers(&self) -> usize {
        self.inner.dispatch.idle_len()
    }

    /// Terminate every worker, idle or mid-job, and stop respawning.
    /// In-flight renders are cut off; their requests fail instead of
    /// draining.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for mut worker in self.inner.dispatch.drain_idle() {
            worker.terminate();
        }
        // Busy workers are away on jobs; the broadcast reaches their
        // monitor tasks directly.
        let _ = self.inner.terminate_tx.send(());
    }
}

impl PoolInner {
    fn spawn_worker(&self) -> Result<Worker, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(
            id,
            &self.command,
            self.exit_tx.clone(),
            self.terminate_tx.subscribe(),
        )?;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(worker_id = id, "spawned render worker");
        Ok(worker)
    }
}

/// The command used to start workers: this binary, re-executed in worker
/// mode.
fn default_worker_command() -> Result<Vec<String>, GatewayError> {
    let exe = std::env::current_exe()?;
    Ok(vec![
        exe.to_string_lossy().into_owned(),
        WORKER_MODE_ARG.to_owned(),
    ])
}

async fn supervise(inner: Arc<PoolInner>, mut exit_rx: mpsc::UnboundedReceiver<WorkerExit>) {
    while let Some(exit) = exit_rx.recv().await {
        inner.live.fetch_sub(1, Ordering::SeqCst);

        if exit.restarting {
            // The dispatch path already spawned the replacement inline.
            debug!(worker_id = exit.id, "worker replaced after wasm update");
            continue;
        }
        if exit.intentional || inner.shutting_down.load(Ordering::SeqCst) {
            inner.reporter.report(
                Situation::StoppedChildProcess,
                format!("worker {} stopped", exit.id),
            );
            continue;
        }

        let age = exit.at.duration_since(exit.spawned_at);
        let disaster = age < inner.disaster_window;
        if disaster {
            inner.reporter.report(
                Situation::DisasterlyCrashed,
                format!("worker {} crashed {}ms after spawn", exit.id, age.as_millis()),
            );
            tokio::time::sleep(inner.disaster_backoff).await;
        } else {
            tokio::time::sleep(inner.respawn_delay).await;
        }

        if inner.shutting_down.load(Ordering::SeqCst) {
            continue;
        }
        match inner.spawn_worker() {
            Ok(worker) => {
                let id = worker.id();
                inner.dispatch.release(worker);
                if disaster {
                    inner.reporter.report(
                        Situation::RespawnedAfterDisaster,
                        format!("worker {} replaced worker {}", id, exit.id),
                    );
                } else {
                    debug!(worker_id = id, replaced = exit.id, "respawned render worker");
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to respawn render worker");
            }
        }
    }
}
