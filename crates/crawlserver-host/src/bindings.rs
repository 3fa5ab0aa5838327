//! Host function registration for the application interop bridge.
//!
//! The embedded application talks to the host through a small import
//! surface: callback registration (the cooperative rendering protocol),
//! DOM mutation, and the `location`/`history`/`alert`/`matchMedia` mocks.
//! All registrations live under the [`INTEROP_MODULE`] import module.

use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker, Memory};
use wasmtime_wasi::preview1::WasiP1Ctx;

use crawlserver_common::HostError;

use crate::dom::VirtualDom;

/// Import module carrying the application interop bridge.
pub const INTEROP_MODULE: &str = "crawlserver";

/// Import module for the stack sanitizer hook some toolchains emit.
pub const STACK_SANITIZER_MODULE: &str = "__stack_sanitizer";

/// Per-instance host state, owned by the store.
pub struct HostState {
    /// WASI preview-1 context.
    pub wasi: WasiP1Ctx,
    /// The document the application renders into.
    pub dom: VirtualDom,
    /// Callbacks the application registered during start.
    pub callbacks: CallbackRegistry,
    /// Set when the application's route-done callback fires.
    pub route_completion: Option<RouteCompletion>,
    /// Set when the application signals that initialization finished.
    pub started: bool,
}

/// Late-bound callbacks installed by the guest, held as indices into its
/// exported function table. Missing required entries are explicit errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackRegistry {
    /// Required: invoked per render with `(path_ptr, path_len, search_ptr,
    /// search_len)`.
    pub change_route: Option<u32>,
    /// Optional: quiesces the application's own router.
    pub disable_location_listener: Option<u32>,
}

/// Freshness metadata delivered by the application's route-done callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCompletion {
    /// Freshness window in seconds; zero means the gateway default.
    pub expires_in: u64,
    /// Last-modified time in Unix seconds, when the application knows one.
    pub last_modified_at: Option<u64>,
}

/// Register the full interop bridge on a linker.
pub fn register_interop(linker: &mut Linker<HostState>) -> Result<(), HostError> {
    register_callbacks(linker)?;
    register_dom(linker)?;
    register_window(linker)?;
    Ok(())
}

/// Register `__stack_sanitizer.report_stack_overflow`, which fails the
/// running instantiation instead of corrupting memory silently.
pub fn register_stack_sanitizer(linker: &mut Linker<HostState>) -> Result<(), HostError> {
    linker
        .func_wrap(
            STACK_SANITIZER_MODULE,
            "report_stack_overflow",
            || -> Result<(), wasmtime::Error> {
                Err(wasmtime::Error::msg("guest reported a stack overflow"))
            },
        )
        .map_err(link_err)?;
    Ok(())
}

fn register_callbacks(linker: &mut Linker<HostState>) -> Result<(), HostError> {
    linker
        .func_wrap(
            INTEROP_MODULE,
            "app_on_start",
            |mut caller: Caller<'_, HostState>| {
                debug!("application signalled start");
                caller.data_mut().started = true;
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "register_change_route",
            |mut caller: Caller<'_, HostState>, index: u32| {
                caller.data_mut().callbacks.change_route = Some(index);
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "register_disable_location_listener",
            |mut caller: Caller<'_, HostState>, index: u32| {
                caller.data_mut().callbacks.disable_location_listener = Some(index);
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "route_done",
            |mut caller: Caller<'_, HostState>, expires_in: f64, last_modified_at: f64| {
                caller.data_mut().route_completion = Some(RouteCompletion {
                    expires_in: expires_in.max(0.0) as u64,
                    last_modified_at: if last_modified_at > 0.0 {
                        Some(last_modified_at as u64)
                    } else {
                        None
                    },
                });
            },
        )
        .map_err(link_err)?;

    Ok(())
}

fn register_dom(linker: &mut Linker<HostState>) -> Result<(), HostError> {
    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_create_element",
            |mut caller: Caller<'_, HostState>,
             tag_ptr: u32,
             tag_len: u32|
             -> Result<u32, wasmtime::Error> {
                let tag = read_guest_str(&mut caller, tag_ptr, tag_len)?;
                Ok(caller.data_mut().dom.create_element(&tag))
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_create_text",
            |mut caller: Caller<'_, HostState>,
             text_ptr: u32,
             text_len: u32|
             -> Result<u32, wasmtime::Error> {
                let text = read_guest_str(&mut caller, text_ptr, text_len)?;
                Ok(caller.data_mut().dom.create_text(&text))
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_set_attribute",
            |mut caller: Caller<'_, HostState>,
             node: u32,
             name_ptr: u32,
             name_len: u32,
             value_ptr: u32,
             value_len: u32|
             -> Result<(), wasmtime::Error> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                let value = read_guest_str(&mut caller, value_ptr, value_len)?;
                caller.data_mut().dom.set_attribute(node, &name, &value);
                Ok(())
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_remove_attribute",
            |mut caller: Caller<'_, HostState>,
             node: u32,
             name_ptr: u32,
             name_len: u32|
             -> Result<(), wasmtime::Error> {
                let name = read_guest_str(&mut caller, name_ptr, name_len)?;
                caller.data_mut().dom.remove_attribute(node, &name);
                Ok(())
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_append_child",
            |mut caller: Caller<'_, HostState>, parent: u32, child: u32| {
                caller.data_mut().dom.append_child(parent, child);
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_remove_child",
            |mut caller: Caller<'_, HostState>, parent: u32, child: u32| {
                caller.data_mut().dom.remove_child(parent, child);
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_set_text",
            |mut caller: Caller<'_, HostState>,
             node: u32,
             text_ptr: u32,
             text_len: u32|
             -> Result<(), wasmtime::Error> {
                let text = read_guest_str(&mut caller, text_ptr, text_len)?;
                caller.data_mut().dom.set_text(node, &text);
                Ok(())
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "dom_body",
            |caller: Caller<'_, HostState>| -> u32 { caller.data().dom.body() },
        )
        .map_err(link_err)?;

    Ok(())
}

fn register_window(linker: &mut Linker<HostState>) -> Result<(), HostError> {
    linker
        .func_wrap(
            INTEROP_MODULE,
            "location_host",
            |mut caller: Caller<'_, HostState>,
             buf: u32,
             cap: u32|
             -> Result<u32, wasmtime::Error> {
                let value = caller.data().dom.location.host.clone();
                write_guest_bytes(&mut caller, value.as_bytes(), buf, cap)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "location_path",
            |mut caller: Caller<'_, HostState>,
             buf: u32,
             cap: u32|
             -> Result<u32, wasmtime::Error> {
                let value = caller.data().dom.location.path.clone();
                write_guest_bytes(&mut caller, value.as_bytes(), buf, cap)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "location_search",
            |mut caller: Caller<'_, HostState>,
             buf: u32,
             cap: u32|
             -> Result<u32, wasmtime::Error> {
                let value = caller.data().dom.location.search.clone();
                write_guest_bytes(&mut caller, value.as_bytes(), buf, cap)
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "history_push_state",
            |mut caller: Caller<'_, HostState>,
             path_ptr: u32,
             path_len: u32,
             search_ptr: u32,
             search_len: u32|
             -> Result<(), wasmtime::Error> {
                let path = read_guest_str(&mut caller, path_ptr, path_len)?;
                let search = read_guest_str(&mut caller, search_ptr, search_len)?;
                caller.data_mut().dom.navigate(&path, &search);
                Ok(())
            },
        )
        .map_err(link_err)?;

    linker
        .func_wrap(
            INTEROP_MODULE,
            "alert",
            |mut caller: Caller<'_, HostState>,
             msg_ptr: u32,
             msg_len: u32|
             -> Result<(), wasmtime::Error> {
                let message = read_guest_str(&mut caller, msg_ptr, msg_len)?;
                warn!(guest_alert = %message, "application raised an alert");
                Ok(())
            },
        )
        .map_err(link_err)?;

    // No media queries apply to a crawler render; every query mismatches.
    linker
        .func_wrap(
            INTEROP_MODULE,
            "match_media",
            |_caller: Caller<'_, HostState>, _query_ptr: u32, _query_len: u32| -> i32 { 0 },
        )
        .map_err(link_err)?;

    Ok(())
}

fn link_err(err: wasmtime::Error) -> HostError {
    HostError::instantiation(format!("failed to register host function: {err}"))
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, wasmtime::Error> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("guest memory export not found"))
}

/// Read a guest string, bounds-checked. Invalid UTF-8 is replaced rather
/// than trapping; the DOM downstream copes with replacement characters.
fn read_guest_str(
    caller: &mut Caller<'_, HostState>,
    ptr: u32,
    len: u32,
) -> Result<String, wasmtime::Error> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| wasmtime::Error::msg("guest pointer overflow"))?;
    if end > data.len() {
        return Err(wasmtime::Error::msg("guest memory access out of bounds"));
    }
    Ok(String::from_utf8_lossy(&data[start..end]).into_owned())
}

/// Copy up to `cap` bytes into the guest buffer; returns the full length so
/// the guest can retry with a larger buffer.
fn write_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    bytes: &[u8],
    buf: u32,
    cap: u32,
) -> Result<u32, wasmtime::Error> {
    let memory = guest_memory(caller)?;
    let len = bytes.len().min(cap as usize);
    memory.write(&mut *caller, buf as usize, &bytes[..len])?;
    Ok(bytes.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Config, Engine};

    fn test_engine() -> Engine {
        let mut config = Config::new();
        config.epoch_interruption(true);
        Engine::new(&config).unwrap()
    }

    #[test]
    fn test_register_interop() {
        let engine = test_engine();
        let mut linker: Linker<HostState> = Linker::new(&engine);
        assert!(register_interop(&mut linker).is_ok());
    }

    #[test]
    fn test_register_stack_sanitizer() {
        let engine = test_engine();
        let mut linker: Linker<HostState> = Linker::new(&engine);
        assert!(register_stack_sanitizer(&mut linker).is_ok());
    }

    #[test]
    fn test_double_registration_fails() {
        let engine = test_engine();
        let mut linker: Linker<HostState> = Linker::new(&engine);
        register_interop(&mut linker).unwrap();
        assert!(register_interop(&mut linker).is_err());
    }
}
