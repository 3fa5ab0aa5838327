//! Worker host lifecycle: cold start, warm reuse, stale detection.
//!
//! A [`WorkerHost`] owns at most one live Wasm instance. The first job
//! loads the module, wires up WASI and the interop bridge, runs the
//! application's start sequence, and renders. Subsequent jobs reuse the
//! live instance, unless the Wasm file on disk has changed since it was
//! loaded, in which case the host asks to be replaced.

use std::time::Duration;

use tracing::{debug, error, info, warn};
use wasmtime::{Config, Engine, Instance, Linker, Module, OptLevel, Ref, Store, Trap};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1;
use wasmtime_wasi::WasiCtxBuilder;

use crawlserver_common::{wasm_mtime_millis, HostError, RenderJob, WorkerReply};

use crate::bindings::{self, HostState};
use crate::dom::VirtualDom;

/// How long the application gets to signal start.
pub const START_DEADLINE: Duration = Duration::from_secs(5);

const EPOCH_TICK: Duration = Duration::from_millis(100);
const START_DEADLINE_TICKS: u64 = 50;
// Generous; the parent's per-request timer is the real backstop.
const ROUTE_DEADLINE_TICKS: u64 = 150;

const GUEST_LOG_CAPACITY: usize = 1 << 20;

/// Outcome of handling one job: the reply to send, and whether the process
/// should terminate afterwards (with which exit code).
#[derive(Debug)]
pub struct JobResult {
    /// Reply to write back to the parent.
    pub reply: WorkerReply,
    /// Exit code when the worker cannot continue serving.
    pub exit: Option<i32>,
}

struct LiveInstance {
    store: Store<HostState>,
    instance: Instance,
    loaded_mtime: u64,
    debug_logs: bool,
    stdout: Option<MemoryOutputPipe>,
    stderr: Option<MemoryOutputPipe>,
    stdout_seen: usize,
    stderr_seen: usize,
}

/// The render worker host.
pub struct WorkerHost {
    engine: Engine,
    live: Option<LiveInstance>,
}

impl WorkerHost {
    /// Create a host with an epoch-interrupted engine. A background ticker
    /// advances the epoch so deadlines fire even while guest code spins.
    pub fn new() -> Result<Self, HostError> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.cranelift_opt_level(OptLevel::Speed);

        let engine = Engine::new(&config)
            .map_err(|err| HostError::instantiation(format!("engine creation failed: {err}")))?;

        let ticker = engine.weak();
        std::thread::spawn(move || loop {
            std::thread::sleep(EPOCH_TICK);
            match ticker.upgrade() {
                Some(engine) => engine.increment_epoch(),
                None => break,
            }
        });

        Ok(Self { engine, live: None })
    }

    /// Handle one render job, returning exactly one reply.
    pub fn handle(&mut self, job: &RenderJob) -> JobResult {
        if let Some(live) = self.live.as_mut() {
            if job.wasm_mtime != live.loaded_mtime {
                info!(
                    job_mtime = job.wasm_mtime,
                    loaded_mtime = live.loaded_mtime,
                    "wasm file changed on disk; requesting replacement"
                );
                // The parent terminates us once it has read this reply.
                return JobResult {
                    reply: WorkerReply::Restart,
                    exit: None,
                };
            }
            let state = live.store.data_mut();
            state.dom.navigate(&job.path, &job.search);
            state.route_completion = None;
        } else if let Err(err) = self.instantiate(job) {
            return startup_failure(err);
        }

        let outcome = self.dispatch_route();
        self.flush_guest_logs();
        match outcome {
            Ok(reply) => JobResult { reply, exit: None },
            Err(err) => {
                warn!(error = %err, path = %job.path, "route render failed");
                JobResult {
                    reply: WorkerReply::NotRendered,
                    exit: Some(1),
                }
            }
        }
    }

    /// Cold path: load, instantiate, and start the application.
    fn instantiate(&mut self, job: &RenderJob) -> Result<(), HostError> {
        let path = &job.path_to_wasm;
        if path.as_os_str().is_empty() || !path.exists() {
            return Err(HostError::WasmMissing { path: path.clone() });
        }

        let metadata = std::fs::metadata(path)?;
        let loaded_mtime = wasm_mtime_millis(&metadata);
        let bytes = std::fs::read(path)?;

        let module = Module::new(&self.engine, &bytes)
            .map_err(|err| HostError::instantiation(format!("module compilation failed: {err}")))?;

        let mut builder = WasiCtxBuilder::new();
        let (stdout, stderr) = if job.debug_logs {
            let stdout = MemoryOutputPipe::new(GUEST_LOG_CAPACITY);
            let stderr = MemoryOutputPipe::new(GUEST_LOG_CAPACITY);
            builder.stdout(stdout.clone());
            builder.stderr(stderr.clone());
            (Some(stdout), Some(stderr))
        } else {
            // Default context discards guest output
            (None, None)
        };

        let state = HostState {
            wasi: builder.build_p1(),
            dom: VirtualDom::new(job.server_port, &job.path, &job.search),
            callbacks: Default::default(),
            route_completion: None,
            started: false,
        };

        let mut store = Store::new(&self.engine, state);
        store.set_epoch_deadline(START_DEADLINE_TICKS);

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|err| HostError::instantiation(format!("wasi linking failed: {err}")))?;
        bindings::register_interop(&mut linker)?;
        bindings::register_stack_sanitizer(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|err| HostError::instantiation(format!("instantiation failed: {err}")))?;

        invoke_start(&mut store, instance)?;

        if !store.data().started {
            return Err(HostError::start_failed(
                "application never signalled start",
            ));
        }
        if let Some(index) = store.data().callbacks.disable_location_listener {
            invoke_table_nullary(&mut store, instance, index).map_err(|err| {
                HostError::start_failed(format!("route-listener disable failed: {err}"))
            })?;
        }
        if store.data().callbacks.change_route.is_none() {
            return Err(HostError::MissingChangeRoute);
        }

        debug!(
            path = %path.display(),
            mtime = loaded_mtime,
            "wasm application instantiated"
        );

        self.live = Some(LiveInstance {
            store,
            instance,
            loaded_mtime,
            debug_logs: job.debug_logs,
            stdout,
            stderr,
            stdout_seen: 0,
            stderr_seen: 0,
        });
        Ok(())
    }

    /// Invoke the registered route-change callback and serialize the DOM
    /// once its completion callback has fired.
    fn dispatch_route(&mut self) -> Result<WorkerReply, HostError> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| HostError::route_failed("no live wasm instance"))?;
        let instance = live.instance;
        let store = &mut live.store;

        let handler = store
            .data()
            .callbacks
            .change_route
            .ok_or(HostError::MissingChangeRoute)?;
        let (path, search) = {
            let location = &store.data().dom.location;
            (location.path.clone(), location.search.clone())
        };

        store.set_epoch_deadline(ROUTE_DEADLINE_TICKS);

        let (path_ptr, path_len) = write_guest_string(store, instance, &path)?;
        let (search_ptr, search_len) = write_guest_string(store, instance, &search)?;

        let func = table_function(store, instance, handler)?;
        let typed = func
            .typed::<(u32, u32, u32, u32), ()>(&mut *store)
            .map_err(|_| HostError::route_failed("route-change callback has the wrong signature"))?;
        typed
            .call(&mut *store, (path_ptr, path_len, search_ptr, search_len))
            .map_err(|err| {
                if is_deadline_trap(&err) {
                    HostError::route_failed("route change deadline elapsed")
                } else {
                    HostError::route_failed(err.to_string())
                }
            })?;

        match store.data().route_completion {
            Some(completion) => Ok(WorkerReply::Render {
                html: store.data().dom.to_html(),
                expires_in: completion.expires_in,
                last_modified_at: completion.last_modified_at,
            }),
            None => Err(HostError::route_failed(
                "route completion callback never fired",
            )),
        }
    }

    fn flush_guest_logs(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if !live.debug_logs {
            return;
        }
        if let Some(stdout) = &live.stdout {
            let contents = stdout.contents();
            if contents.len() > live.stdout_seen {
                let chunk = String::from_utf8_lossy(&contents[live.stdout_seen..]);
                for line in chunk.lines().filter(|line| !line.is_empty()) {
                    debug!(stream = "stdout", "guest: {line}");
                }
                live.stdout_seen = contents.len();
            }
        }
        if let Some(stderr) = &live.stderr {
            let contents = stderr.contents();
            if contents.len() > live.stderr_seen {
                let chunk = String::from_utf8_lossy(&contents[live.stderr_seen..]);
                for line in chunk.lines().filter(|line| !line.is_empty()) {
                    debug!(stream = "stderr", "guest: {line}");
                }
                live.stderr_seen = contents.len();
            }
        }
    }
}

fn startup_failure(err: HostError) -> JobResult {
    if err.is_not_rendered() {
        warn!(error = %err, "application failed to start");
        JobResult {
            reply: WorkerReply::NotRendered,
            exit: Some(1),
        }
    } else {
        error!(error = %err, "worker cannot serve");
        JobResult {
            reply: WorkerReply::Crash {
                reason: err.to_string(),
            },
            exit: Some(1),
        }
    }
}

/// Run the application's start sequence. Modules built as reactors export
/// `_initialize` and dispatch to `main` (or `__main_argc_argv`); command
/// modules export `_start`.
fn invoke_start(store: &mut Store<HostState>, instance: Instance) -> Result<(), HostError> {
    let result = if let Ok(initialize) = instance.get_typed_func::<(), ()>(&mut *store, "_initialize")
    {
        initialize
            .call(&mut *store, ())
            .and_then(|()| invoke_main(store, instance))
    } else if let Ok(start) = instance.get_typed_func::<(), ()>(&mut *store, "_start") {
        start.call(&mut *store, ())
    } else {
        return Err(HostError::start_failed("module exports no entry point"));
    };

    result.map_err(|err| {
        if is_deadline_trap(&err) {
            HostError::StartDeadline
        } else if is_clean_exit(&err) {
            HostError::start_failed("application exited during start")
        } else {
            HostError::start_failed(err.to_string())
        }
    })
}

fn invoke_main(store: &mut Store<HostState>, instance: Instance) -> Result<(), wasmtime::Error> {
    if let Ok(main) = instance.get_typed_func::<(), ()>(&mut *store, "main") {
        main.call(&mut *store, ())
    } else if let Ok(main) = instance.get_typed_func::<(i32, i32), i32>(&mut *store, "__main_argc_argv")
    {
        main.call(&mut *store, (0, 0)).map(|_| ())
    } else {
        Ok(())
    }
}

/// Copy a string into guest memory through the exported allocator.
fn write_guest_string(
    store: &mut Store<HostState>,
    instance: Instance,
    value: &str,
) -> Result<(u32, u32), HostError> {
    let len = value.len() as u32;
    if len == 0 {
        return Ok((0, 0));
    }
    let alloc = instance
        .get_typed_func::<u32, u32>(&mut *store, "alloc")
        .map_err(|_| HostError::guest_memory("guest does not export an `alloc` function"))?;
    let ptr = alloc
        .call(&mut *store, len)
        .map_err(|err| HostError::guest_memory(format!("guest alloc failed: {err}")))?;
    let memory = instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| HostError::guest_memory("guest does not export its memory"))?;
    memory
        .write(&mut *store, ptr as usize, value.as_bytes())
        .map_err(|err| HostError::guest_memory(format!("guest memory write failed: {err}")))?;
    Ok((ptr, len))
}

/// Resolve a callback index through the guest's exported function table.
fn table_function(
    store: &mut Store<HostState>,
    instance: Instance,
    index: u32,
) -> Result<wasmtime::Func, HostError> {
    let table = instance
        .get_table(&mut *store, "__indirect_function_table")
        .ok_or_else(|| HostError::guest_memory("guest does not export its function table"))?;
    match table.get(&mut *store, index) {
        Some(Ref::Func(Some(func))) => Ok(func),
        _ => Err(HostError::route_failed(format!(
            "callback index {index} is not a function"
        ))),
    }
}

fn invoke_table_nullary(
    store: &mut Store<HostState>,
    instance: Instance,
    index: u32,
) -> Result<(), wasmtime::Error> {
    let func = table_function(store, instance, index)
        .map_err(|err| wasmtime::Error::msg(err.to_string()))?;
    let typed = func.typed::<(), ()>(&mut *store)?;
    typed.call(&mut *store, ())
}

fn is_deadline_trap(err: &wasmtime::Error) -> bool {
    err.downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::Interrupt)
}

fn is_clean_exit(err: &wasmtime::Error) -> bool {
    err.downcast_ref::<wasmtime_wasi::I32Exit>()
        .is_some_and(|exit| exit.0 == 0)
}
