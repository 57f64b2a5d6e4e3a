//! Guest instantiation and invocation.
//!
//! An [`InstanceFactory`] turns a compiled guest into ready
//! [`GuestInstance`]s: it wires WASI preview1 and the `http_handler`
//! imports into a linker, instantiates, resolves the required exports,
//! and runs the guest's one-shot initialization. A [`GuestInstance`]
//! then drives the two handler entry points for one request at a time,
//! installing the scoped [`RequestState`] around each call.
//!
//! Instances are single-threaded and not re-entrant; any trap, timeout,
//! or protocol violation poisons the instance so the pool ejects it.

use std::sync::Arc;

use tracing::{debug, warn};
use wasmtime::{Instance, Linker, Store, StoreLimitsBuilder, Trap, TypedFunc};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use weft_core::{ProtocolViolation, Result, WeftError};

use crate::host::register_host_functions;
use crate::runtime::{CompiledGuest, GuestRuntime};
use crate::state::{HostState, RequestState, SharedState};

/// WASI wiring passed through to the guest; stdio inheritance is the
/// primary use.
#[derive(Debug, Clone)]
pub struct WasiOptions {
    /// Forward guest stdout to the host's stdout.
    pub inherit_stdout: bool,
    /// Forward guest stderr to the host's stderr.
    pub inherit_stderr: bool,
    /// Environment variables visible to the guest.
    pub envs: Vec<(String, String)>,
    /// Arguments visible to the guest.
    pub args: Vec<String>,
}

impl Default for WasiOptions {
    fn default() -> Self {
        Self {
            inherit_stdout: true,
            inherit_stderr: true,
            envs: Vec::new(),
            args: Vec::new(),
        }
    }
}

impl WasiOptions {
    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Silence guest stdio instead of inheriting it.
    pub fn silent(mut self) -> Self {
        self.inherit_stdout = false;
        self.inherit_stderr = false;
        self
    }

    fn build(&self) -> WasiP1Ctx {
        let mut builder = WasiCtxBuilder::new();
        if self.inherit_stdout {
            builder.inherit_stdout();
        }
        if self.inherit_stderr {
            builder.inherit_stderr();
        }
        builder.envs(&self.envs);
        builder.args(&self.args);
        builder.build_p1()
    }
}

/// Creates identically-configured guest instances for one middleware.
pub struct InstanceFactory {
    runtime: Arc<GuestRuntime>,
    guest: Arc<CompiledGuest>,
    shared: Arc<SharedState>,
    wasi: WasiOptions,
}

impl InstanceFactory {
    /// Create a factory.
    pub fn new(
        runtime: Arc<GuestRuntime>,
        guest: Arc<CompiledGuest>,
        shared: Arc<SharedState>,
        wasi: WasiOptions,
    ) -> Self {
        Self {
            runtime,
            guest,
            shared,
            wasi,
        }
    }

    /// The guest name, for diagnostics.
    pub fn guest_name(&self) -> &str {
        self.shared.name()
    }

    /// Instantiate the guest and run its initialization entry point.
    ///
    /// Synchronous: guest init code runs on the calling thread. Callers
    /// on an async runtime should wrap this in a blocking task.
    pub fn create_instance(&self) -> Result<GuestInstance> {
        let name = self.shared.name().to_owned();
        let engine = self.runtime.engine();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.runtime.config().max_memory_bytes())
            .instances(1)
            .build();

        let mut store = Store::new(
            engine,
            HostState::new(self.wasi.build(), limits, Arc::clone(&self.shared)),
        );
        store.limiter(|state| &mut state.limits);

        let deadline_ticks = self.runtime.deadline_ticks();
        if let Some(ticks) = deadline_ticks {
            store.epoch_deadline_trap();
            store.set_epoch_deadline(ticks);
        }

        let mut linker: Linker<HostState> = Linker::new(engine);
        preview1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi).map_err(
            |e| WeftError::Instantiate {
                name: name.clone(),
                cause: e.to_string(),
            },
        )?;
        register_host_functions(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, self.guest.module())
            .map_err(|e| WeftError::Instantiate {
                name: name.clone(),
                cause: e.to_string(),
            })?;

        // The ABI requires an exported linear memory; its absence is fatal.
        if instance.get_memory(&mut store, "memory").is_none() {
            return Err(WeftError::MissingExport {
                name,
                export: "memory",
            });
        }

        let handle_request = instance
            .get_typed_func::<(), u64>(&mut store, "handle_request")
            .map_err(|_| WeftError::MissingExport {
                name: name.clone(),
                export: "handle_request",
            })?;
        let handle_response = instance
            .get_typed_func::<(u32, u32), ()>(&mut store, "handle_response")
            .map_err(|_| WeftError::MissingExport {
                name: name.clone(),
                export: "handle_response",
            })?;

        run_init(&mut store, &instance, &name)?;

        debug!(guest = %name, features = %self.shared.features(), "guest instance created");

        Ok(GuestInstance {
            store,
            handle_request,
            handle_response,
            deadline_ticks,
            poisoned: false,
        })
    }
}

/// Run the guest's one-shot init: `_start` as a WASI start if present,
/// else `_initialize` if present, else nothing.
fn run_init(store: &mut Store<HostState>, instance: &Instance, name: &str) -> Result<()> {
    let entry = if let Ok(start) = instance.get_typed_func::<(), ()>(&mut *store, "_start") {
        Some(("_start", start))
    } else if let Ok(init) = instance.get_typed_func::<(), ()>(&mut *store, "_initialize") {
        Some(("_initialize", init))
    } else {
        None
    };

    let Some((entry_name, func)) = entry else {
        return Ok(());
    };

    match func.call(&mut *store, ()) {
        Ok(()) => Ok(()),
        // A WASI guest that exits 0 from _start has initialized cleanly.
        Err(err)
            if err
                .downcast_ref::<wasmtime_wasi::I32Exit>()
                .is_some_and(|exit| exit.0 == 0) =>
        {
            Ok(())
        }
        Err(err) => Err(WeftError::GuestInit {
            name: name.to_owned(),
            cause: format!("{entry_name}: {err}"),
        }),
    }
}

/// One instantiated guest, serving one request at a time.
pub struct GuestInstance {
    store: Store<HostState>,
    handle_request: TypedFunc<(), u64>,
    handle_response: TypedFunc<(u32, u32), ()>,
    deadline_ticks: Option<u64>,
    poisoned: bool,
}

impl GuestInstance {
    /// Whether this instance trapped and must not be reused.
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    fn arm_deadline(&mut self) {
        if let Some(ticks) = self.deadline_ticks {
            self.store.set_epoch_deadline(ticks);
        }
    }

    /// Invoke `handle_request` with `state` in scope.
    ///
    /// Returns the state (with any guest mutations applied) and the raw
    /// `ctx_next` value.
    pub(crate) fn call_handle_request(
        &mut self,
        state: RequestState,
    ) -> Result<(RequestState, u64)> {
        self.arm_deadline();
        self.store.data_mut().request = Some(state);
        let result = self.handle_request.call(&mut self.store, ());
        let state = self.take_request_state("handle_request")?;
        match result {
            Ok(ctx_next) => Ok((state, ctx_next)),
            Err(err) => {
                self.poisoned = true;
                Err(map_guest_error("handle_request", err))
            }
        }
    }

    /// Invoke `handle_response(ctx, is_error)` with `state` in scope.
    pub(crate) fn call_handle_response(
        &mut self,
        state: RequestState,
        ctx: u32,
        is_error: bool,
    ) -> Result<RequestState> {
        self.arm_deadline();
        self.store.data_mut().request = Some(state);
        let result = self
            .handle_response
            .call(&mut self.store, (ctx, u32::from(is_error)));
        let state = self.take_request_state("handle_response")?;
        match result {
            Ok(()) => Ok(state),
            Err(err) => {
                self.poisoned = true;
                Err(map_guest_error("handle_response", err))
            }
        }
    }

    fn take_request_state(&mut self, entry: &'static str) -> Result<RequestState> {
        match self.store.data_mut().request.take() {
            Some(state) => Ok(state),
            None => {
                self.poisoned = true;
                Err(WeftError::GuestTrap {
                    entry,
                    cause: "request state missing after invocation".to_string(),
                })
            }
        }
    }
}

/// Classify an invocation failure: protocol violations raised by host
/// functions, watchdog interrupts, and plain guest traps.
fn map_guest_error(entry: &'static str, err: wasmtime::Error) -> WeftError {
    match err.downcast::<ProtocolViolation>() {
        Ok(violation) => {
            warn!(entry, %violation, "guest trapped on protocol violation");
            WeftError::Protocol { entry, violation }
        }
        Err(err) => {
            if let Some(trap) = err.downcast_ref::<Trap>() {
                if matches!(trap, Trap::Interrupt) {
                    warn!(entry, "guest invocation interrupted by watchdog");
                    return WeftError::GuestTimeout { entry };
                }
                warn!(entry, %trap, "guest trapped");
                return WeftError::GuestTrap {
                    entry,
                    cause: trap.to_string(),
                };
            }
            WeftError::GuestTrap {
                entry,
                cause: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::GuestRuntimeConfig;
    use weft_core::Features;

    fn factory_for(wat: &str) -> Result<InstanceFactory> {
        let runtime = Arc::new(GuestRuntime::new(GuestRuntimeConfig::testing())?);
        let bytes = wat::parse_str(wat).expect("valid wat");
        let guest = runtime.compile("test-guest", &bytes)?;
        let shared = Arc::new(SharedState::new("test-guest", b"cfg".to_vec()));
        Ok(InstanceFactory::new(
            runtime,
            guest,
            shared,
            WasiOptions::default().silent(),
        ))
    }

    fn request_state(features: Features) -> RequestState {
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("/ping")
            .body(())
            .unwrap()
            .into_parts();
        RequestState::new(&parts, features, None)
    }

    const MINIMAL_GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "handle_request") (result i64) (i64.const 1))
            (func (export "handle_response") (param i32 i32)))
    "#;

    #[test]
    fn creates_instance_from_minimal_guest() {
        let factory = factory_for(MINIMAL_GUEST).expect("factory");
        let mut instance = factory.create_instance().expect("instance");
        assert!(!instance.poisoned());

        let (state, ctx_next) = instance
            .call_handle_request(request_state(Features::NONE))
            .expect("handle_request");
        assert_eq!(ctx_next, 1);
        assert!(!state.next_called());
    }

    #[test]
    fn missing_memory_is_fatal() {
        let factory = factory_for(
            r#"
            (module
                (func (export "handle_request") (result i64) (i64.const 0))
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");
        let err = factory.create_instance().unwrap_err();
        assert!(matches!(
            err,
            WeftError::MissingExport { export: "memory", .. }
        ));
    }

    #[test]
    fn missing_handler_is_fatal() {
        let factory = factory_for(
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "handle_request") (result i64) (i64.const 0)))
        "#,
        )
        .expect("factory");
        let err = factory.create_instance().unwrap_err();
        assert!(matches!(
            err,
            WeftError::MissingExport {
                export: "handle_response",
                ..
            }
        ));
    }

    #[test]
    fn initialize_may_raise_middleware_features() {
        let factory = factory_for(
            r#"
            (module
                (import "http_handler" "enable_features"
                    (func $enable_features (param i32) (result i32)))
                (memory (export "memory") 1)
                (func (export "_initialize")
                    (drop (call $enable_features (i32.const 3))))
                (func (export "handle_request") (result i64) (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");

        let _instance = factory.create_instance().expect("instance");
        assert_eq!(
            factory.shared.features(),
            Features::BUFFER_REQUEST | Features::BUFFER_RESPONSE
        );
    }

    #[test]
    fn start_exit_zero_is_clean_init() {
        let factory = factory_for(
            r#"
            (module
                (import "wasi_snapshot_preview1" "proc_exit"
                    (func $proc_exit (param i32)))
                (memory (export "memory") 1)
                (func (export "_start") (call $proc_exit (i32.const 0)))
                (func (export "handle_request") (result i64) (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");
        assert!(factory.create_instance().is_ok());
    }

    #[test]
    fn init_trap_is_setup_error() {
        let factory = factory_for(
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "_initialize") unreachable)
                (func (export "handle_request") (result i64) (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");
        let err = factory.create_instance().unwrap_err();
        assert!(matches!(err, WeftError::GuestInit { .. }));
    }

    #[test]
    fn trap_poisons_instance() {
        let factory = factory_for(
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "handle_request") (result i64) unreachable)
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");
        let mut instance = factory.create_instance().expect("instance");

        let err = instance
            .call_handle_request(request_state(Features::NONE))
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::GuestTrap {
                entry: "handle_request",
                ..
            }
        ));
        assert!(instance.poisoned());
    }

    #[test]
    fn protocol_violation_is_classified() {
        // get_header_values with name_len == 0 must trap the guest.
        let factory = factory_for(
            r#"
            (module
                (import "http_handler" "get_header_values"
                    (func $get_header_values (param i32 i32 i32 i32 i32) (result i64)))
                (memory (export "memory") 1)
                (func (export "handle_request") (result i64)
                    (drop (call $get_header_values
                        (i32.const 0) (i32.const 0) (i32.const 0)
                        (i32.const 256) (i32.const 64)))
                    (i64.const 1))
                (func (export "handle_response") (param i32 i32)))
        "#,
        )
        .expect("factory");
        let mut instance = factory.create_instance().expect("instance");

        let err = instance
            .call_handle_request(request_state(Features::NONE))
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::Protocol {
                entry: "handle_request",
                violation: ProtocolViolation::EmptyHeaderName,
            }
        ));
        assert!(instance.poisoned());
    }
}
