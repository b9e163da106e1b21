//! Bridge Runtime
//!
//! Loads a module, binds the host call surface into a linker, instantiates,
//! resolves the bridge exports and drives the start routine, closures, DOM
//! events and the event loop from the embedder's side.

pub mod exports;
pub mod host;

pub use exports::{resolve_exports, start_func, ExpectedSignature, ExportError};
pub use host::{HostFunctionProvider, HostLinkerBuilder, InterfaceBuilder, LinkerError};

use crate::codec;
use crate::config::{BridgeConfig, ConfigError};
use crate::error::{BridgeError, BridgeResult};
use crate::event_loop::{self, EventLoop};
use crate::guest::{Guest, GuestExports};
use crate::heap::Handle;
use crate::host::HostCallSurface;
use crate::memory::GuestMemory;
use crate::state::{Backends, BridgeState};
use crate::value::HostValue;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use wasmtime::{Engine, Extern, Instance, Linker, Module, Store, WasmParams, WasmResults};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to load module: {0}")]
    ModuleLoad(String),

    #[error("Failed to instantiate module: {0}")]
    Instantiate(String),

    #[error(transparent)]
    MissingExport(#[from] ExportError),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Module has not been started")]
    NotStarted,

    #[error("Bridge refused the call: poisoned by {0}")]
    Poisoned(BridgeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Linker(#[from] LinkerError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Failed to build fetch backend: {0}")]
    Backend(#[from] reqwest::Error),
}

/// The bridge runtime
pub struct Runtime {
    engine: Engine,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            engine: Engine::default(),
        }
    }

    /// Compile a module from bytes (binary or text format)
    pub fn load_module(&self, wasm_bytes: &[u8]) -> Result<CompiledModule<'_>, RuntimeError> {
        let module =
            Module::new(&self.engine, wasm_bytes).map_err(|e| RuntimeError::ModuleLoad(format!("{e:#}")))?;
        Ok(CompiledModule {
            module,
            engine: &self.engine,
        })
    }

    /// Compile a module straight from a file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<CompiledModule<'_>, RuntimeError> {
        let path = path.as_ref();
        let module = Module::from_file(&self.engine, path)
            .map_err(|e| RuntimeError::ModuleLoad(format!("{}: {e:#}", path.display())))?;
        tracing::debug!(path = %path.display(), "compiled module");
        Ok(CompiledModule {
            module,
            engine: &self.engine,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// A compiled module, ready to be bound to a bridge
pub struct CompiledModule<'a> {
    module: Module,
    engine: &'a Engine,
}

impl<'a> CompiledModule<'a> {
    /// Instantiate with the backends selected by `config`.
    pub fn instantiate(&self, config: BridgeConfig) -> Result<Bridge, RuntimeError> {
        let backends = Backends::from_config(&config)?;
        self.instantiate_with(config, backends)
    }

    /// Instantiate against explicit backends.
    pub fn instantiate_with(&self, config: BridgeConfig, backends: Backends) -> Result<Bridge, RuntimeError> {
        config.validate()?;
        let surface = HostCallSurface::new(config.import_module.clone());
        let export_names = config.exports.clone();

        let mut linker = Linker::<BridgeState>::new(self.engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);
        builder.register_provider(&surface)?;

        let mut store = Store::new(self.engine, BridgeState::new(config, backends));
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| RuntimeError::Instantiate(format!("{e:#}")))?;
        let exports = resolve_exports(&mut store, &instance, &export_names)?;
        store.data_mut().exports = Some(exports);
        tracing::info!(import_module = surface.module(), "module instantiated");

        Ok(Bridge { store, instance })
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn engine(&self) -> &Engine {
        self.engine
    }
}

/// A module instance bound to its bridge state.
///
/// Nothing but [`start`](Self::start) may be called before the start routine
/// has run, and nothing at all once a fatal error has poisoned the bridge.
pub struct Bridge {
    store: Store<BridgeState>,
    instance: Instance,
}

impl Bridge {
    /// Run the module's start routine. Later calls do nothing.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if let Some(err) = self.store.data().poisoned() {
            return Err(RuntimeError::Poisoned(err.clone()));
        }
        if self.store.data().is_started() {
            tracing::debug!("start routine already ran");
            return Ok(());
        }
        let name = self.store.data().config.exports.start.clone();
        let start = start_func(&mut self.store, &self.instance, &name)?;
        self.store.data_mut().started = true;
        let _span = tracing::info_span!("start", export = %name).entered();
        start
            .call(&mut self.store, ())
            .map_err(|e| self.poison_trap(&name, e))
    }

    fn ensure_ready(&self) -> Result<(), RuntimeError> {
        let state = self.store.data();
        if let Some(err) = state.poisoned() {
            return Err(RuntimeError::Poisoned(err.clone()));
        }
        if !state.is_started() {
            return Err(RuntimeError::NotStarted);
        }
        Ok(())
    }

    fn exports(&self) -> Result<GuestExports, RuntimeError> {
        self.store
            .data()
            .exports
            .clone()
            .ok_or_else(|| BridgeError::protocol("module exports have not been resolved").into())
    }

    fn poison_trap(&mut self, op: &str, err: wasmtime::Error) -> RuntimeError {
        let err = crate::guest::trap(err);
        self.store.data_mut().poison(op, &err);
        RuntimeError::Bridge(err)
    }

    /// Run `body` against the guest, poisoning on fatal errors.
    fn guarded<R>(
        &mut self,
        op: &str,
        body: impl FnOnce(&mut Guest<&mut Store<BridgeState>>) -> BridgeResult<R>,
    ) -> Result<R, RuntimeError> {
        self.ensure_ready()?;
        let exports = self.exports()?;
        let mut guest = Guest::new(&mut self.store, exports);
        match body(&mut guest) {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_fatal() {
                    guest.state_mut().poison(op, &err);
                }
                Err(err.into())
            }
        }
    }

    pub fn state(&self) -> &BridgeState {
        self.store.data()
    }

    pub fn state_mut(&mut self) -> &mut BridgeState {
        self.store.data_mut()
    }

    pub fn store(&mut self) -> &mut Store<BridgeState> {
        &mut self.store
    }

    /// Call an exported module function.
    pub fn call<P, R>(&mut self, name: &str, params: P) -> Result<R, RuntimeError>
    where
        P: WasmParams,
        R: WasmResults,
    {
        self.ensure_ready()?;
        let func = self
            .instance
            .get_typed_func::<P, R>(&mut self.store, name)
            .map_err(|e| RuntimeError::FunctionNotFound(format!("{name}: {e}")))?;
        func.call(&mut self.store, params)
            .map_err(|e| self.poison_trap(name, e))
    }

    /// Invoke the closure behind `closure` with `arg`.
    pub fn invoke_closure(&mut self, closure: Handle, arg: Handle) -> Result<(), RuntimeError> {
        self.guarded("invoke_closure", |guest| {
            let id = guest.state().value(closure)?.expect_closure()?;
            crate::closure::invoke(guest, id, arg)
        })
    }

    /// Dispatch an event of `event_type` at the node behind `target`.
    ///
    /// Returns false when a listener prevented the default action.
    pub fn dispatch_event(&mut self, target: Handle, event_type: &str) -> Result<bool, RuntimeError> {
        self.guarded("dispatch_event", |guest| {
            let node = guest.state().node(target)?;
            event_loop::dispatch_dom_event(guest, node, event_type)
        })
    }

    /// Deliver queued timers, socket events and fetch completions.
    pub fn run_until_idle(&mut self, max_turns: usize) -> Result<usize, RuntimeError> {
        self.run_event_loop(EventLoop::new(max_turns))
    }

    pub fn run_event_loop(&mut self, event_loop: EventLoop) -> Result<usize, RuntimeError> {
        self.guarded("event_loop", |guest| event_loop.run_until_idle(guest))
    }

    pub fn read_memory(&mut self, ptr: u32, len: u32) -> Result<Vec<u8>, RuntimeError> {
        self.guarded("read_memory", |guest| guest.read_bytes(ptr, len))
    }

    pub fn write_memory(&mut self, ptr: u32, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.guarded("write_memory", |guest| guest.write_bytes(ptr, bytes))
    }

    /// Copy `text` into module memory, returning `(ptr, len)`.
    pub fn encode_string(&mut self, text: &str) -> Result<(u32, u32), RuntimeError> {
        self.guarded("encode_string", |guest| codec::encode(guest, text))
    }

    pub fn decode_string(&mut self, ptr: u32, len: u32) -> Result<String, RuntimeError> {
        self.guarded("decode_string", |guest| codec::decode(guest, ptr, len))
    }

    /// Hand a host value to the module.
    pub fn alloc_value(&mut self, value: HostValue) -> Handle {
        self.store.data_mut().alloc(value)
    }

    pub fn value(&self, handle: Handle) -> Result<&HostValue, RuntimeError> {
        Ok(self.store.data().value(handle)?)
    }

    /// How many times the memory view has been recreated.
    pub fn memory_generation(&self) -> u64 {
        self.store.data().view.generation()
    }
}

/// One import the host call surface provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportEntry {
    pub module: String,
    pub name: String,
    pub params: Vec<String>,
    pub results: Vec<String>,
}

/// Every import registered for `config`, sorted by name.
pub fn import_catalogue(config: &BridgeConfig) -> Result<Vec<ImportEntry>, RuntimeError> {
    config.validate()?;
    let engine = Engine::default();
    let mut linker = Linker::<BridgeState>::new(&engine);
    let mut builder = HostLinkerBuilder::new(&mut linker);
    builder.register_provider(&HostCallSurface::new(config.import_module.clone()))?;

    let mut store = Store::new(&engine, BridgeState::new(config.clone(), Backends::default()));
    let defined: Vec<(String, String, Extern)> = linker
        .iter(&mut store)
        .map(|(module, name, item)| (module.to_string(), name.to_string(), item))
        .collect();

    let mut entries: Vec<ImportEntry> = defined
        .into_iter()
        .filter_map(|(module, name, item)| match item {
            Extern::Func(func) => {
                let (params, results) = exports::signature(&func.ty(&store));
                Some(ImportEntry {
                    module,
                    name,
                    params,
                    results,
                })
            }
            _ => None,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
