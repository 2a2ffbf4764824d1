use std::collections::HashSet;

use modweave_api::abi;
use modweave_api::{ModFlag, ModStorage, StorageScope};
use serde_json::Value;
use tracing::debug;
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, Store};

use crate::error::{Error, Result, map_wasm_error};
use crate::resources::{ResourceLedger, ResourceSnapshot, TeardownReport};

/// Upper bound for any single guest region the host will read or write.
const MAX_REGION: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Capability flags not yet known; network denies unconditionally.
    Setup,
    /// Flags granted; the capability table decides.
    Granted,
}

/// Per-realm host state: the capability table, the resource ledger, and
/// the bound storage.
pub(crate) struct RealmState {
    phase: Phase,
    caps: HashSet<ModFlag>,
    pub(crate) ledger: ResourceLedger,
    storage: ModStorage,
    storage_context: String,
    label: String,
}

impl RealmState {
    /// State for the disposable validation realm: deny network, record
    /// everything, scratch storage.
    pub fn validation() -> Self {
        Self {
            phase: Phase::Setup,
            caps: HashSet::new(),
            ledger: ResourceLedger::default(),
            storage: ModStorage::default(),
            storage_context: "validation".to_string(),
            label: "candidate".to_string(),
        }
    }

    /// State for a trusted realm: capabilities are the validated flags,
    /// storage is the mod's real two-tier storage.
    pub fn trusted(
        flags: &[ModFlag],
        storage: ModStorage,
        storage_context: &str,
        label: &str,
    ) -> Self {
        Self {
            phase: Phase::Granted,
            caps: flags.iter().copied().collect(),
            ledger: ResourceLedger::default(),
            storage,
            storage_context: storage_context.to_string(),
            label: label.to_string(),
        }
    }

    fn allows_network(&self) -> bool {
        self.phase == Phase::Granted && self.caps.contains(&ModFlag::Requests)
    }
}

/// A disposable execution realm holding one instantiated mod bundle.
///
/// Everything the guest registered through the host surface lives in the
/// realm's ledger; [`Realm::destroy`] reclaims all of it exactly once and
/// is safe to call again.
pub struct Realm {
    store: Option<Store<RealmState>>,
    instance: Option<Instance>,
    report: TeardownReport,
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("live", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Compiles and instantiates `source` (wasm binary or WAT text) with
    /// the capability-gated host surface. The module's start section runs
    /// here, so capability denials can already trip.
    pub(crate) fn run(engine: &Engine, source: &[u8], state: RealmState) -> Result<Self> {
        let module = Module::new(engine, source)
            .map_err(|error| Error::invalid_mod(format!("module does not compile: {error}")))?;
        let mut linker: Linker<RealmState> = Linker::new(engine);
        link_host_surface(&mut linker)?;
        let mut store = Store::new(engine, state);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|error| match error.downcast::<Error>() {
                Ok(ours) => ours,
                Err(other) => Error::invalid_mod(format!("instantiation failed: {other}")),
            })?;
        Ok(Self {
            store: Some(store),
            instance: Some(instance),
            report: TeardownReport::default(),
        })
    }

    fn parts(&mut self) -> Result<(&mut Store<RealmState>, Instance)> {
        match (self.store.as_mut(), self.instance) {
            (Some(store), Some(instance)) => Ok((store, instance)),
            _ => Err(Error::Destroyed),
        }
    }

    /// Reads the guest-declared metadata JSON. Missing exports mean the
    /// bundle is not a mod at all.
    pub fn metadata_json(&mut self) -> Result<String> {
        let (store, instance) = self.parts()?;
        let ptr_fn = instance
            .get_typed_func::<(), i32>(&mut *store, abi::EXPORT_METADATA_PTR)
            .map_err(|_| Error::invalid_mod("missing mod metadata exports"))?;
        let len_fn = instance
            .get_typed_func::<(), i32>(&mut *store, abi::EXPORT_METADATA_LEN)
            .map_err(|_| Error::invalid_mod("missing mod metadata exports"))?;
        let ptr = ptr_fn.call(&mut *store, ()).map_err(map_wasm_error)?;
        let len = len_fn.call(&mut *store, ()).map_err(map_wasm_error)?;
        let memory = exported_memory(store, instance)?;
        let bytes = read_region(store, memory, ptr, len)?;
        String::from_utf8(bytes).map_err(|_| Error::validation("metadata is not valid UTF-8"))
    }

    /// Methods this mod offers to dependents, when it exports any.
    pub fn export_methods(&mut self) -> Result<Option<Value>> {
        let (store, instance) = self.parts()?;
        let Ok(ptr_fn) = instance.get_typed_func::<(), i32>(&mut *store, abi::EXPORT_METHODS_PTR)
        else {
            return Ok(None);
        };
        let len_fn = instance
            .get_typed_func::<(), i32>(&mut *store, abi::EXPORT_METHODS_LEN)
            .map_err(|_| Error::invalid_mod("export_methods_ptr without export_methods_len"))?;
        let ptr = ptr_fn.call(&mut *store, ()).map_err(map_wasm_error)?;
        let len = len_fn.call(&mut *store, ()).map_err(map_wasm_error)?;
        let memory = exported_memory(store, instance)?;
        let bytes = read_region(store, memory, ptr, len)?;
        let parsed = serde_json::from_slice(&bytes)
            .map_err(|error| Error::validation(format!("exported methods do not parse: {error}")))?;
        Ok(Some(parsed))
    }

    pub fn has_background(&mut self) -> bool {
        match self.parts() {
            Ok((store, instance)) => instance.get_func(&mut *store, abi::EXPORT_BACKGROUND).is_some(),
            Err(_) => false,
        }
    }

    /// Calls the optional `on_load` hook.
    pub fn call_on_load(&mut self) -> Result<()> {
        self.call_simple(abi::EXPORT_ON_LOAD)
    }

    /// Calls the optional `on_unload` hook.
    pub fn call_on_unload(&mut self) -> Result<()> {
        self.call_simple(abi::EXPORT_ON_UNLOAD)
    }

    fn call_simple(&mut self, name: &str) -> Result<()> {
        let (store, instance) = self.parts()?;
        let Ok(func) = instance.get_typed_func::<(), ()>(&mut *store, name) else {
            return Ok(());
        };
        func.call(&mut *store, ()).map_err(map_wasm_error)
    }

    /// Delivers a background event JSON to the guest. Returns the guest's
    /// response JSON, if it produced one.
    pub fn call_background(&mut self, event_json: &str) -> Result<Option<String>> {
        let (store, instance) = self.parts()?;
        let Ok(background) =
            instance.get_typed_func::<(i32, i32), i64>(&mut *store, abi::EXPORT_BACKGROUND)
        else {
            return Ok(None);
        };
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut *store, abi::EXPORT_ALLOC)
            .map_err(|_| Error::invalid_mod("background requires an alloc export"))?;

        let bytes = event_json.as_bytes();
        if bytes.len() > MAX_REGION {
            return Err(Error::invalid_mod("background event too large"));
        }
        let ptr = alloc
            .call(&mut *store, bytes.len() as i32)
            .map_err(map_wasm_error)?;
        let memory = exported_memory(store, instance)?;
        memory
            .write(&mut *store, ptr.max(0) as usize, bytes)
            .map_err(|_| Error::invalid_mod("alloc returned an out-of-bounds region"))?;
        let packed = background
            .call(&mut *store, (ptr, bytes.len() as i32))
            .map_err(map_wasm_error)?;
        match abi::unpack_region(packed) {
            None => Ok(None),
            Some((rptr, rlen)) => {
                let bytes = read_region(store, memory, rptr as i32, rlen as i32)?;
                let text = String::from_utf8(bytes)
                    .map_err(|_| Error::invalid_mod("background response is not UTF-8"))?;
                Ok(Some(text))
            }
        }
    }

    /// Grants the declared capability flags once validation has read
    /// them. Until then the realm denies network unconditionally.
    pub fn grant_capabilities(&mut self, flags: &[ModFlag]) {
        if let Some(store) = self.store.as_mut() {
            let state = store.data_mut();
            state.caps = flags.iter().copied().collect();
            state.phase = Phase::Granted;
        }
    }

    /// Live resource counts; all zero once destroyed.
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        self.store
            .as_ref()
            .map(|store| store.data().ledger.snapshot())
            .unwrap_or_default()
    }

    /// Tears the realm down: cancels every tracked timer/interval/frame,
    /// removes every listener, rejects pending fetches, and discards the
    /// store. Idempotent — later calls return the same report without
    /// cancelling anything twice.
    pub fn destroy(&mut self) -> TeardownReport {
        if let Some(mut store) = self.store.take() {
            self.instance = None;
            self.report = store.data_mut().ledger.drain();
            debug!(
                target: "modweave_sandbox::realm",
                cancelled_timeouts = self.report.cancelled_timeouts,
                cancelled_intervals = self.report.cancelled_intervals,
                cancelled_frames = self.report.cancelled_frames,
                removed_listeners = self.report.removed_listeners,
                rejected_fetches = self.report.rejected_fetches,
                "realm destroyed"
            );
        }
        self.report
    }

    pub fn is_destroyed(&self) -> bool {
        self.store.is_none()
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn exported_memory(store: &mut Store<RealmState>, instance: Instance) -> Result<Memory> {
    instance
        .get_memory(&mut *store, abi::EXPORT_MEMORY)
        .ok_or_else(|| Error::invalid_mod("missing exported memory"))
}

fn read_region(
    store: &mut Store<RealmState>,
    memory: Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>> {
    if ptr < 0 || len < 0 || len as usize > MAX_REGION {
        return Err(Error::invalid_mod("guest region out of bounds"));
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *store, ptr as usize, &mut buf)
        .map_err(|_| Error::invalid_mod("guest region out of bounds"))?;
    Ok(buf)
}

fn read_caller_string(
    caller: &mut Caller<'_, RealmState>,
    ptr: i32,
    len: i32,
) -> std::result::Result<String, wasmtime::Error> {
    if ptr < 0 || len < 0 || len as usize > MAX_REGION {
        return Err(Error::invalid_mod("guest region out of bounds").into());
    }
    let memory = caller
        .get_export(abi::EXPORT_MEMORY)
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::from(Error::invalid_mod("missing exported memory")))?;
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut *caller, ptr as usize, &mut buf)
        .map_err(|_| wasmtime::Error::from(Error::invalid_mod("guest region out of bounds")))?;
    String::from_utf8(buf).map_err(|_| Error::invalid_mod("guest string is not UTF-8").into())
}

/// Wires the whole host surface: resource-recording wrappers, the
/// capability-gated network entry, storage accessors, guest logging, and
/// the always-denying privileged module.
fn link_host_surface(
    linker: &mut Linker<RealmState>,
) -> std::result::Result<(), wasmtime::Error> {
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_TIMEOUT_START,
        |mut caller: Caller<'_, RealmState>, ms: i64| -> i64 {
            caller.data_mut().ledger.register_timeout(ms.max(0) as u64)
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_TIMEOUT_CANCEL,
        |mut caller: Caller<'_, RealmState>, id: i64| {
            caller.data_mut().ledger.cancel_timeout(id);
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_INTERVAL_START,
        |mut caller: Caller<'_, RealmState>, ms: i64| -> i64 {
            caller.data_mut().ledger.register_interval(ms.max(0) as u64)
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_INTERVAL_CANCEL,
        |mut caller: Caller<'_, RealmState>, id: i64| {
            caller.data_mut().ledger.cancel_interval(id);
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_FRAME_REQUEST,
        |mut caller: Caller<'_, RealmState>| -> i64 { caller.data_mut().ledger.register_frame() },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_FRAME_CANCEL,
        |mut caller: Caller<'_, RealmState>, id: i64| {
            caller.data_mut().ledger.cancel_frame(id);
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_LISTENER_ADD,
        |mut caller: Caller<'_, RealmState>,
         ptr: i32,
         len: i32|
         -> std::result::Result<i64, wasmtime::Error> {
            let topic = read_caller_string(&mut caller, ptr, len)?;
            Ok(caller.data_mut().ledger.register_listener(topic))
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_LISTENER_REMOVE,
        |mut caller: Caller<'_, RealmState>, id: i64| {
            caller.data_mut().ledger.remove_listener(id);
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_HTTP_FETCH,
        |mut caller: Caller<'_, RealmState>,
         ptr: i32,
         len: i32|
         -> std::result::Result<i64, wasmtime::Error> {
            if !caller.data().allows_network() {
                return Err(Error::permission("requests").into());
            }
            let url = read_caller_string(&mut caller, ptr, len)?;
            Ok(caller.data_mut().ledger.register_fetch(url))
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_LOG,
        |mut caller: Caller<'_, RealmState>,
         level: i32,
         ptr: i32,
         len: i32|
         -> std::result::Result<(), wasmtime::Error> {
            let text = read_caller_string(&mut caller, ptr, len)?;
            let label = caller.data().label.clone();
            match level {
                0 => tracing::error!(target: "modweave_sandbox::guest", mod_label = %label, "{text}"),
                1 => tracing::warn!(target: "modweave_sandbox::guest", mod_label = %label, "{text}"),
                2 => tracing::info!(target: "modweave_sandbox::guest", mod_label = %label, "{text}"),
                3 => tracing::debug!(target: "modweave_sandbox::guest", mod_label = %label, "{text}"),
                _ => tracing::trace!(target: "modweave_sandbox::guest", mod_label = %label, "{text}"),
            }
            Ok(())
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_STORAGE_GET,
        |mut caller: Caller<'_, RealmState>,
         scope: i32,
         kptr: i32,
         klen: i32,
         optr: i32,
         ocap: i32|
         -> std::result::Result<i32, wasmtime::Error> {
            let Some(scope) = StorageScope::from_abi(scope) else {
                return Err(Error::invalid_mod("unknown storage scope").into());
            };
            let key = read_caller_string(&mut caller, kptr, klen)?;
            let (storage, context) = {
                let state = caller.data();
                (state.storage.clone(), state.storage_context.clone())
            };
            let Some(value) = storage.get(scope, &context, &key) else {
                return Ok(-1);
            };
            let text = value.to_string();
            let bytes = text.as_bytes();
            // A value longer than the guest's buffer is reported by
            // length only; the guest re-allocates and retries.
            if bytes.len() > ocap.max(0) as usize {
                return Ok(bytes.len() as i32);
            }
            let memory = caller
                .get_export(abi::EXPORT_MEMORY)
                .and_then(Extern::into_memory)
                .ok_or_else(|| wasmtime::Error::from(Error::invalid_mod("missing exported memory")))?;
            memory
                .write(&mut caller, optr.max(0) as usize, bytes)
                .map_err(|_| wasmtime::Error::from(Error::invalid_mod("guest region out of bounds")))?;
            Ok(bytes.len() as i32)
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_STORAGE_SET,
        |mut caller: Caller<'_, RealmState>,
         scope: i32,
         kptr: i32,
         klen: i32,
         vptr: i32,
         vlen: i32|
         -> std::result::Result<(), wasmtime::Error> {
            let Some(scope) = StorageScope::from_abi(scope) else {
                return Err(Error::invalid_mod("unknown storage scope").into());
            };
            let key = read_caller_string(&mut caller, kptr, klen)?;
            let raw = read_caller_string(&mut caller, vptr, vlen)?;
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            let state = caller.data();
            let (storage, context) = (state.storage.clone(), state.storage_context.clone());
            storage.set(scope, &context, &key, value);
            Ok(())
        },
    )?;
    linker.func_wrap(
        abi::HOST_MODULE,
        abi::HOST_STORAGE_DELETE,
        |mut caller: Caller<'_, RealmState>,
         scope: i32,
         kptr: i32,
         klen: i32|
         -> std::result::Result<(), wasmtime::Error> {
            let Some(scope) = StorageScope::from_abi(scope) else {
                return Err(Error::invalid_mod("unknown storage scope").into());
            };
            let key = read_caller_string(&mut caller, kptr, klen)?;
            let state = caller.data();
            let (storage, context) = (state.storage.clone(), state.storage_context.clone());
            storage.delete(scope, &context, &key);
            Ok(())
        },
    )?;

    for name in abi::PRIVILEGED_SURFACE {
        linker.func_wrap(
            abi::PRIVILEGED_MODULE,
            name,
            move |_caller: Caller<'_, RealmState>| -> std::result::Result<i64, wasmtime::Error> {
                Err(Error::permission(*name).into())
            },
        )?;
    }
    Ok(())
}
