//! The wasmtime side of the guest traits.
//!
//! [`GuestExports`] holds the bridge exports of one instance. [`WasmGuest`]
//! pairs them with a store context (a `Store` from the embedder, or the
//! `Caller` inside a host function) and implements the core guest traits, so
//! the bridge can allocate, read memory and enter trampolines re-entrantly.

use tether_core::{
    BridgeError, BridgeResult, GuestAllocator, GuestMemory, GuestTrampolines, GuestVal,
};
use wasmtime::{
    AsContext, AsContextMut, Caller, Extern, Func, Instance, Memory, Ref, Table, TypedFunc, Val,
    WasmParams, WasmResults,
};

use crate::error::{ModuleError, ModuleResult};
use crate::module::{FREE_EXPORT, MALLOC_EXPORT, MEMORY_EXPORT, REALLOC_EXPORT, TABLE_EXPORT};

const EXPORT_NAMES: [&str; 5] = [
    MEMORY_EXPORT,
    MALLOC_EXPORT,
    REALLOC_EXPORT,
    FREE_EXPORT,
    TABLE_EXPORT,
];

/// The bridge exports of an instance.
#[derive(Clone)]
pub struct GuestExports {
    memory: Memory,
    malloc: TypedFunc<(i32, i32), i32>,
    realloc: Option<TypedFunc<(i32, i32, i32, i32), i32>>,
    free: Option<TypedFunc<(i32, i32, i32), ()>>,
    table: Option<Table>,
}

impl GuestExports {
    /// Resolve the exports of an instance.
    pub fn resolve(mut store: impl AsContextMut, instance: &Instance) -> ModuleResult<Self> {
        let mut store = store.as_context_mut();
        let externs = EXPORT_NAMES.map(|name| instance.get_export(&mut store, name));
        Self::from_externs(externs, &store)
    }

    /// Resolve the exports of the instance calling a host function.
    pub fn from_caller<T>(caller: &mut Caller<'_, T>) -> ModuleResult<Self> {
        let externs = EXPORT_NAMES.map(|name| caller.get_export(name));
        Self::from_externs(externs, &*caller)
    }

    fn from_externs(externs: [Option<Extern>; 5], store: impl AsContext) -> ModuleResult<Self> {
        let [memory, malloc, realloc, free, table] = externs;

        let memory = memory
            .ok_or(ModuleError::MissingExport(MEMORY_EXPORT))?
            .into_memory()
            .ok_or(ModuleError::AbiMismatch {
                name: MEMORY_EXPORT,
                expected: "memory",
            })?;
        let malloc = typed_export(malloc, MALLOC_EXPORT, "(i32, i32) -> i32", &store)?
            .ok_or(ModuleError::MissingExport(MALLOC_EXPORT))?;
        let realloc = typed_export(
            realloc,
            REALLOC_EXPORT,
            "(i32, i32, i32, i32) -> i32",
            &store,
        )?;
        let free = typed_export(free, FREE_EXPORT, "(i32, i32, i32)", &store)?;
        let table = match table {
            Some(ext) => Some(ext.into_table().ok_or(ModuleError::AbiMismatch {
                name: TABLE_EXPORT,
                expected: "funcref table",
            })?),
            None => None,
        };

        Ok(Self {
            memory,
            malloc,
            realloc,
            free,
            table,
        })
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Whether the guest exports `realloc`.
    pub fn has_realloc(&self) -> bool {
        self.realloc.is_some()
    }

    /// Whether the guest exports a trampoline table.
    pub fn has_table(&self) -> bool {
        self.table.is_some()
    }
}

impl std::fmt::Debug for GuestExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestExports")
            .field("realloc", &self.realloc.is_some())
            .field("free", &self.free.is_some())
            .field("table", &self.table.is_some())
            .finish()
    }
}

fn typed_export<P, R>(
    ext: Option<Extern>,
    name: &'static str,
    expected: &'static str,
    store: impl AsContext,
) -> ModuleResult<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    let Some(ext) = ext else {
        return Ok(None);
    };
    let mismatch = ModuleError::AbiMismatch { name, expected };
    let func = ext.into_func().ok_or(ModuleError::AbiMismatch { name, expected })?;
    func.typed::<P, R>(store).map(Some).map_err(|_| mismatch)
}

/// Recover a bridge error raised by a nested host call, or describe the
/// failure of the guest call itself.
pub(crate) fn guest_error(call: &'static str, err: wasmtime::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(err) => BridgeError::guest(call, format!("{err:#}")),
    }
}

/// Convert a bridge scalar to a wasmtime value.
pub fn to_val(value: &GuestVal) -> Val {
    match *value {
        GuestVal::I32(v) => Val::I32(v),
        GuestVal::I64(v) => Val::I64(v),
        GuestVal::F32(v) => Val::F32(v.to_bits()),
        GuestVal::F64(v) => Val::F64(v.to_bits()),
    }
}

/// Convert a wasmtime value to a bridge scalar.
pub fn from_val(call: &'static str, value: &Val) -> BridgeResult<GuestVal> {
    match value {
        Val::I32(v) => Ok(GuestVal::I32(*v)),
        Val::I64(v) => Ok(GuestVal::I64(*v)),
        Val::F32(bits) => Ok(GuestVal::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(GuestVal::F64(f64::from_bits(*bits))),
        other => Err(BridgeError::guest(
            call,
            format!("unsupported value crossing the bridge: {other:?}"),
        )),
    }
}

/// A guest reachable through a wasmtime store context.
pub struct WasmGuest<C> {
    ctx: C,
    exports: GuestExports,
}

impl<C: AsContextMut> WasmGuest<C> {
    /// Pair a store context with the instance's exports.
    pub fn new(ctx: C, exports: GuestExports) -> Self {
        Self { ctx, exports }
    }

    /// The underlying store context.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    fn table_func(&mut self, index: u32, call: &'static str) -> BridgeResult<Func> {
        let table = self
            .exports
            .table
            .ok_or_else(|| BridgeError::guest(call, "module exports no function table"))?;
        match table.get(&mut self.ctx, index.into()) {
            Some(Ref::Func(Some(func))) => Ok(func),
            _ => Err(BridgeError::guest(
                call,
                format!("no function at table index {index}"),
            )),
        }
    }

    fn call_table(&mut self, index: u32, call: &'static str, params: &[Val]) -> BridgeResult<Vec<Val>> {
        let func = self.table_func(index, call)?;
        let arity = func.ty(&self.ctx).results().len();
        let mut results = vec![Val::I32(0); arity];
        func.call(&mut self.ctx, params, &mut results)
            .map_err(|err| guest_error(call, err))?;
        Ok(results)
    }
}

impl<C: AsContextMut> GuestMemory for WasmGuest<C> {
    fn data(&self) -> &[u8] {
        self.exports.memory.data(&self.ctx)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.exports.memory.data_mut(&mut self.ctx)
    }
}

impl<C: AsContextMut> GuestAllocator for WasmGuest<C> {
    fn malloc(&mut self, size: u32, align: u32) -> BridgeResult<u32> {
        self.exports
            .malloc
            .call(&mut self.ctx, (size as i32, align as i32))
            .map(|ptr| ptr as u32)
            .map_err(|err| guest_error(MALLOC_EXPORT, err))
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> BridgeResult<u32> {
        let realloc = self
            .exports
            .realloc
            .as_ref()
            .ok_or_else(|| BridgeError::guest(REALLOC_EXPORT, "not exported"))?;
        realloc
            .call(
                &mut self.ctx,
                (ptr as i32, old_size as i32, new_size as i32, align as i32),
            )
            .map(|ptr| ptr as u32)
            .map_err(|err| guest_error(REALLOC_EXPORT, err))
    }

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> BridgeResult<()> {
        // Guests without a free simply leak.
        let Some(free) = self.exports.free.as_ref() else {
            return Ok(());
        };
        free.call(&mut self.ctx, (ptr as i32, size as i32, align as i32))
            .map_err(|err| guest_error(FREE_EXPORT, err))
    }

    fn supports_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }
}

impl<C: AsContextMut> GuestTrampolines for WasmGuest<C> {
    fn invoke_closure(
        &mut self,
        invoke: u32,
        data: u32,
        dispatch: u32,
        args: &[GuestVal],
    ) -> BridgeResult<Vec<GuestVal>> {
        let mut params = Vec::with_capacity(args.len() + 2);
        params.push(Val::I32(data as i32));
        params.push(Val::I32(dispatch as i32));
        params.extend(args.iter().map(to_val));

        self.call_table(invoke, "invoke_closure", &params)?
            .iter()
            .map(|val| from_val("invoke_closure", val))
            .collect()
    }

    fn destroy_closure(&mut self, destroy: u32, data: u32, dispatch: u32) -> BridgeResult<()> {
        let params = [Val::I32(data as i32), Val::I32(dispatch as i32)];
        self.call_table(destroy, "destroy_closure", &params)?;
        Ok(())
    }
}
