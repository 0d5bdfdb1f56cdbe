//! In-process virtual machine backend.
//!
//! [`VmRunner`] owns one wasmtime [`Store`] and one guest instance for its
//! whole life.  Every function import is bound to a no-op stub, the
//! module's init export runs exactly once during [`VmRunner::load`], and
//! each request then goes through [`abi::call_guest`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use wasmtime::{
    Engine, ExternType, Instance, Linker, Memory, ResourceLimiter, Store, StoreLimits,
    StoreLimitsBuilder, Trap, TypedFunc, Val, ValType,
};

use crate::abi::{self, GuestAbi, GuestAddr, guest_slice, guest_slice_mut};
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::module::{self, GuestModule, ModuleInfo};
use crate::runner::{MacroRunner, RunnerKind};

/// Interval between epoch increments when a wall-clock limit is set.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Per-store state.
struct HostState {
    limits: StoreLimits,
    max_memory: usize,
}

/// Raised from inside the guest when `memory.grow` would pass the limit.
#[derive(Debug, thiserror::Error)]
#[error("linear memory limit of {limit} bytes exceeded (requested {desired} bytes)")]
struct MemoryLimitExceeded {
    desired: usize,
    limit: usize,
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        self.limits
            .memory_growing(current, desired, maximum)
            .map_err(|_| {
                wasmtime::Error::new(MemoryLimitExceeded {
                    desired,
                    limit: self.max_memory,
                })
            })
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }

    fn instances(&self) -> usize {
        self.limits.instances()
    }

    fn tables(&self) -> usize {
        self.limits.tables()
    }

    fn memories(&self) -> usize {
        self.limits.memories()
    }
}

/// Build an engine with metering enabled only for the limits in `config`.
pub(crate) fn build_engine(config: &SandboxConfig) -> Result<Engine> {
    let mut wasm_config = wasmtime::Config::new();
    wasm_config.consume_fuel(config.max_fuel.is_some());
    wasm_config.epoch_interruption(config.max_execution_ms.is_some());
    wasm_config.wasm_memory64(false);

    Engine::new(&wasm_config)
        .map_err(|e| SandboxError::Compilation(format!("failed to create wasm engine: {e}")))
}

// ---------------------------------------------------------------------------
// Epoch ticker
// ---------------------------------------------------------------------------

/// Background thread advancing the engine epoch.  Stops on drop.
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("wacro-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deadline_ticks(limit_ms: u64) -> u64 {
    limit_ms.div_ceil(EPOCH_TICK.as_millis() as u64).max(1)
}

// ---------------------------------------------------------------------------
// VmRunner
// ---------------------------------------------------------------------------

/// A guest module running inside this process.
pub struct VmRunner {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    allocate: TypedFunc<u32, u32>,
    release: TypedFunc<u32, ()>,
    process: TypedFunc<(u32, u32), u32>,
    config: SandboxConfig,
    info: ModuleInfo,
    _ticker: Option<EpochTicker>,
}

impl VmRunner {
    /// Compile, instantiate and initialise a guest.
    pub fn load(name: &str, wasm: &[u8], config: SandboxConfig) -> Result<Self> {
        let engine = build_engine(&config)?;
        let guest = module::compile(&engine, name, wasm, &config.abi)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .instances(1)
            .trap_on_grow_failure(true)
            .build();
        let state = HostState {
            limits,
            max_memory: config.max_memory,
        };
        let mut store = Store::new(&engine, state);
        store.limiter(|state| state as &mut dyn ResourceLimiter);

        let ticker = match config.max_execution_ms {
            Some(_) => Some(EpochTicker::start(engine.clone())?),
            None => None,
        };

        let linker = stub_linker(&engine, &guest)?;
        arm(&mut store, &config)?;
        let instance = linker
            .instantiate(&mut store, &guest.module)
            .map_err(|e| SandboxError::Instantiation(format!("{e:#}")))?;

        let names = &config.abi;
        let memory = instance
            .get_memory(&mut store, &names.memory)
            .ok_or_else(|| SandboxError::MissingExport {
                name: names.memory.clone(),
            })?;
        let allocate = typed_export(&instance, &mut store, &names.allocate)?;
        let release = typed_export(&instance, &mut store, &names.release)?;
        let process = typed_export(&instance, &mut store, &names.process)?;

        if let Some(init) = &guest.info.init_export {
            let func: TypedFunc<(), ()> = typed_export(&instance, &mut store, init)?;
            arm(&mut store, &config)?;
            func.call(&mut store, ()).map_err(|e| {
                SandboxError::Instantiation(format!(
                    "`{init}` failed: {}",
                    classify(&config, e)
                ))
            })?;
            tracing::debug!(module = name, export = %init, "guest initialised");
        }

        tracing::info!(
            module = name,
            memory_bytes = memory.data_size(&store),
            fuel = ?config.max_fuel,
            timeout_ms = ?config.max_execution_ms,
            "vm runner ready"
        );

        Ok(Self {
            store,
            instance,
            memory,
            allocate,
            release,
            process,
            config,
            info: guest.info,
            _ticker: ticker,
        })
    }

    /// Read a module from disk and load it under its file stem.
    pub fn from_file(path: &Path, config: SandboxConfig) -> Result<Self> {
        let wasm = std::fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "guest".to_owned());
        Self::load(&name, &wasm, config)
    }

    /// Metadata gathered while compiling the module.
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    /// The configuration this runner was loaded with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Current linear memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// Run one request through the guest and return the raw response.
    pub fn call_bytes(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let started = Instant::now();
        arm(&mut self.store, &self.config)?;
        let response = abi::call_guest(self, request)?;
        tracing::debug!(
            module = %self.info.name,
            request_len = request.len(),
            response_len = response.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "guest call complete"
        );
        Ok(response)
    }

    /// Run one text request and decode the response as UTF-8.
    pub fn call_text(&mut self, request: &str) -> Result<String> {
        let response = self.call_bytes(request.as_bytes())?;
        Ok(String::from_utf8(response)?)
    }

    /// Call an arbitrary export taking and returning only `i32` values.
    ///
    /// Limits apply exactly as for [`call_bytes`](Self::call_bytes).
    pub fn invoke(&mut self, export: &str, args: &[u32]) -> Result<Vec<u32>> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| SandboxError::MissingExport {
                name: export.to_owned(),
            })?;
        let ty = func.ty(&self.store);
        let all_i32 = ty
            .params()
            .chain(ty.results())
            .all(|v| matches!(v, ValType::I32));
        if ty.params().len() != args.len() || !all_i32 {
            return Err(SandboxError::ExportSignature {
                name: export.to_owned(),
                reason: format!("cannot call with {} i32 argument(s)", args.len()),
            });
        }

        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a as i32)).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];
        arm(&mut self.store, &self.config)?;
        func.call(&mut self.store, &params, &mut results)
            .map_err(|e| classify(&self.config, e))?;

        Ok(results
            .iter()
            .filter_map(|v| v.i32())
            .map(|v| v as u32)
            .collect())
    }
}

impl std::fmt::Debug for VmRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRunner")
            .field("info", &self.info)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GuestAbi for VmRunner {
    fn allocate(&mut self, size: u32) -> Result<GuestAddr> {
        self.allocate
            .call(&mut self.store, size)
            .map(GuestAddr::new)
            .map_err(|e| classify(&self.config, e))
    }

    fn release(&mut self, addr: GuestAddr) -> Result<()> {
        self.release
            .call(&mut self.store, addr.get())
            .map_err(|e| classify(&self.config, e))
    }

    fn process(&mut self, addr: GuestAddr, size: u32) -> Result<GuestAddr> {
        self.process
            .call(&mut self.store, (addr.get(), size))
            .map(GuestAddr::new)
            .map_err(|e| classify(&self.config, e))
    }

    fn read_bytes(&self, addr: GuestAddr, len: u32) -> Result<Vec<u8>> {
        guest_slice(self.memory.data(&self.store), addr, len as usize).map(<[u8]>::to_vec)
    }

    fn write_bytes(&mut self, addr: GuestAddr, bytes: &[u8]) -> Result<()> {
        guest_slice_mut(self.memory.data_mut(&mut self.store), addr, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }
}

#[async_trait]
impl MacroRunner for VmRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Vm
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    async fn handle(&mut self, request: &str) -> Result<String> {
        self.call_text(request)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Refill fuel and reset the epoch deadline before entering the guest.
fn arm(store: &mut Store<HostState>, config: &SandboxConfig) -> Result<()> {
    if let Some(fuel) = config.max_fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
    }
    if let Some(ms) = config.max_execution_ms {
        store.set_epoch_deadline(deadline_ticks(ms));
    }
    Ok(())
}

/// Map a wasmtime call error onto the sandbox taxonomy.
fn classify(config: &SandboxConfig, err: wasmtime::Error) -> SandboxError {
    if let Some(limit) = err.downcast_ref::<MemoryLimitExceeded>() {
        return SandboxError::Trap(limit.to_string());
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => SandboxError::FuelExhausted {
            budget: config.max_fuel.unwrap_or_default(),
        },
        Some(Trap::Interrupt) => SandboxError::Timeout {
            limit_ms: config.max_execution_ms.unwrap_or_default(),
        },
        Some(_) => SandboxError::Trap(format!("{err:#}")),
        None => SandboxError::Execution(format!("{err:#}")),
    }
}

fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| SandboxError::ExportSignature {
            name: name.to_owned(),
            reason: format!("{e:#}"),
        })
}

/// Bind every function import to a stub returning zeroes.
fn stub_linker(engine: &Engine, guest: &GuestModule) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    linker.allow_shadowing(true);

    for import in guest.module.imports() {
        let ExternType::Func(ty) = import.ty() else {
            return Err(SandboxError::UnsupportedImport {
                module: import.module().to_owned(),
                name: import.name().to_owned(),
            });
        };
        let zeros = ty
            .results()
            .map(|t| zero_value(&t))
            .collect::<Option<Vec<Val>>>()
            .ok_or_else(|| SandboxError::UnsupportedImport {
                module: import.module().to_owned(),
                name: import.name().to_owned(),
            })?;
        let label = format!("{}::{}", import.module(), import.name());

        linker
            .func_new(import.module(), import.name(), ty, move |_caller, _params, results| {
                tracing::trace!(import = %label, "stubbed import called");
                for (slot, zero) in results.iter_mut().zip(&zeros) {
                    *slot = zero.clone();
                }
                Ok(())
            })
            .map_err(|e| SandboxError::Instantiation(e.to_string()))?;
    }
    Ok(linker)
}

fn zero_value(ty: &ValType) -> Option<Val> {
    match ty {
        ValType::I32 => Some(Val::I32(0)),
        ValType::I64 => Some(Val::I64(0)),
        ValType::F32 => Some(Val::F32(0)),
        ValType::F64 => Some(Val::F64(0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
        (module
          (import "wasi_snapshot_preview1" "clock_time_get"
            (func $clock (param i32 i64 i32) (result i32)))
          (memory (export "memory") 1)
          (global $calls (mut i32) (i32.const 0))
          (func (export "wacro_malloc") (param i32) (result i32) i32.const 1024)
          (func (export "wacro_free") (param i32))
          (func (export "wacro_parse") (param i32 i32) (result i32)
            (global.set $calls (i32.add (global.get $calls) (i32.const 1)))
            (i32.store (i32.const 2048) (i32.const 0))
            (i32.const 2048))
          (func (export "calls") (result i32) (global.get $calls))
          (func (export "clock") (result i32)
            (call $clock (i32.const 0) (i64.const 0) (i32.const 0))))
    "#;

    #[test]
    fn deadline_ticks_round_up() {
        assert_eq!(deadline_ticks(1), 1);
        assert_eq!(deadline_ticks(10), 1);
        assert_eq!(deadline_ticks(11), 2);
        assert_eq!(deadline_ticks(0), 1);
    }

    #[test]
    fn instance_state_persists_across_calls() {
        let mut vm = VmRunner::load("counter", COUNTER.as_bytes(), SandboxConfig::default()).unwrap();
        assert_eq!(vm.call_text("{}").unwrap(), "");
        assert_eq!(vm.call_text("{}").unwrap(), "");
        assert_eq!(vm.invoke("calls", &[]).unwrap(), vec![2]);
    }

    #[test]
    fn stubbed_imports_return_zero() {
        let mut vm = VmRunner::load("counter", COUNTER.as_bytes(), SandboxConfig::default()).unwrap();
        assert_eq!(vm.info().stubbed_imports, vec!["wasi_snapshot_preview1::clock_time_get"]);
        assert_eq!(vm.invoke("clock", &[]).unwrap(), vec![0]);
    }

    #[test]
    fn invoke_checks_arity() {
        let mut vm = VmRunner::load("counter", COUNTER.as_bytes(), SandboxConfig::default()).unwrap();
        assert!(matches!(
            vm.invoke("calls", &[1]),
            Err(SandboxError::ExportSignature { .. })
        ));
        assert!(matches!(
            vm.invoke("nope", &[]),
            Err(SandboxError::MissingExport { .. })
        ));
    }

    #[test]
    fn memory_limit_is_enforced_at_instantiation() {
        let wat = r#"
            (module
              (memory (export "memory") 4)
              (func (export "wacro_malloc") (param i32) (result i32) i32.const 8)
              (func (export "wacro_free") (param i32))
              (func (export "wacro_parse") (param i32 i32) (result i32) i32.const 0))
        "#;
        let config = SandboxConfig::new().with_max_memory(2 * 65536);
        let err = VmRunner::load("big", wat.as_bytes(), config).unwrap_err();
        assert!(matches!(err, SandboxError::Instantiation(_)), "{err}");
    }

    /// `process` grows memory by the page count stored at 1024, then
    /// answers with an empty response.
    const GROWER: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "wacro_malloc") (param i32) (result i32) i32.const 1024)
          (func (export "wacro_free") (param i32))
          (func (export "wacro_parse") (param i32 i32) (result i32)
            (drop (memory.grow (i32.load8_u (i32.const 1024))))
            (i32.store (i32.const 2048) (i32.const 0))
            (i32.const 2048)))
    "#;

    #[test]
    fn growing_past_the_memory_limit_traps() {
        let config = SandboxConfig::new().with_max_memory(2 * 65536);
        let mut vm = VmRunner::load("grower", GROWER.as_bytes(), config).unwrap();
        let err = vm.call_bytes(&[100, 0]).unwrap_err();
        match err {
            SandboxError::Trap(message) => assert!(message.contains("131072"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(vm.memory_size(), 65536);
    }

    #[test]
    fn growing_within_the_memory_limit_succeeds() {
        let config = SandboxConfig::new().with_max_memory(2 * 65536);
        let mut vm = VmRunner::load("grower", GROWER.as_bytes(), config).unwrap();
        assert_eq!(vm.call_bytes(&[1, 0]).unwrap(), b"");
        assert_eq!(vm.memory_size(), 2 * 65536);
    }
}
