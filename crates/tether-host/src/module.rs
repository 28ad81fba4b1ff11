//! WASM module loading and bridge ABI inspection.
//!
//! A module speaks the bridge ABI when it exports its linear memory and an
//! allocator. Everything else (`realloc`, `free`, the trampoline table and
//! the start hook) is optional and changes how the bridge behaves when
//! missing.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use wasmtime::{ExternType, Module};

use crate::engine::BridgeEngine;
use crate::error::{ModuleError, ModuleResult};

/// Export holding the guest's linear memory.
pub const MEMORY_EXPORT: &str = "memory";
/// `(size: i32, align: i32) -> i32`
pub const MALLOC_EXPORT: &str = "__tether_malloc";
/// `(ptr: i32, old_size: i32, new_size: i32, align: i32) -> i32`
pub const REALLOC_EXPORT: &str = "__tether_realloc";
/// `(ptr: i32, size: i32, align: i32)`
pub const FREE_EXPORT: &str = "__tether_free";
/// Funcref table holding closure trampolines.
pub const TABLE_EXPORT: &str = "__indirect_function_table";
/// `()`, run once after instantiation.
pub const START_EXPORT: &str = "__tether_start";

/// A validated WebAssembly module ready for instantiation.
#[derive(Clone)]
pub struct ValidatedModule {
    /// The underlying Wasmtime module.
    inner: Module,
    /// Metadata extracted from the module.
    metadata: ModuleMetadata,
}

impl ValidatedModule {
    /// Get a reference to the underlying Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Get the module metadata.
    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Get the module name, if set.
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    /// Get the list of exports.
    pub fn exports(&self) -> &[ExportInfo] {
        &self.metadata.exports
    }

    /// Get the list of imports.
    pub fn imports(&self) -> &[ImportInfo] {
        &self.metadata.imports
    }

    /// The module's bridge ABI summary.
    pub fn abi(&self) -> &BridgeAbi {
        &self.metadata.abi
    }

    /// Check if the module has a specific export.
    pub fn has_export(&self, name: &str) -> bool {
        self.export(name).is_some()
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<&ExportInfo> {
        self.metadata.exports.iter().find(|e| e.name == name)
    }

    /// Check if the module requires a specific import.
    pub fn requires_import(&self, module: &str, name: &str) -> bool {
        self.metadata
            .imports
            .iter()
            .any(|i| i.module == module && i.name == name)
    }
}

impl std::fmt::Debug for ValidatedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedModule")
            .field("name", &self.metadata.name)
            .field("exports", &self.metadata.exports.len())
            .field("imports", &self.metadata.imports.len())
            .field("abi", &self.metadata.abi)
            .finish()
    }
}

/// Metadata extracted from a WASM module.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    /// Module name, if specified.
    pub name: Option<String>,
    /// List of exported items.
    pub exports: Vec<ExportInfo>,
    /// List of required imports.
    pub imports: Vec<ImportInfo>,
    /// Exported memories.
    pub memories: Vec<MemoryInfo>,
    /// Which parts of the bridge ABI the module provides.
    pub abi: BridgeAbi,
}

/// Information about an exported item.
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Export name.
    pub name: String,
    /// Type of the export.
    pub kind: ExternKind,
}

/// Information about a required import.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    /// Import module name.
    pub module: String,
    /// Import name.
    pub name: String,
    /// Type of the import.
    pub kind: ExternKind,
}

/// The kind of an import or export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternKind {
    /// A function.
    Function {
        /// Number of parameters.
        params: usize,
        /// Number of results.
        results: usize,
    },
    /// A memory.
    Memory,
    /// A global.
    Global,
    /// A table.
    Table,
}

impl ExternKind {
    /// Short lowercase name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Function { .. } => "function",
            Self::Memory => "memory",
            Self::Global => "global",
            Self::Table => "table",
        }
    }

    fn is_function(&self, params: usize, results: usize) -> bool {
        *self == Self::Function { params, results }
    }
}

/// Information about a memory definition.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Minimum memory size in pages (64KB each).
    pub min_pages: u64,
    /// Maximum memory size in pages, if specified.
    pub max_pages: Option<u64>,
    /// Whether this is a 64-bit memory.
    pub memory64: bool,
}

/// Which bridge exports and intrinsics a module uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BridgeAbi {
    /// `memory` is exported.
    pub memory: bool,
    /// `__tether_malloc` is exported.
    pub malloc: bool,
    /// `__tether_realloc` is exported.
    pub realloc: bool,
    /// `__tether_free` is exported.
    pub free: bool,
    /// `__indirect_function_table` is exported.
    pub function_table: bool,
    /// `__tether_start` is exported.
    pub start: bool,
    /// Bridge intrinsics the module imports.
    pub intrinsics: Vec<String>,
}

impl BridgeAbi {
    fn from_parts(exports: &[ExportInfo], imports: &[ImportInfo]) -> Self {
        let has = |name: &str| exports.iter().any(|e| e.name == name);
        Self {
            memory: has(MEMORY_EXPORT),
            malloc: has(MALLOC_EXPORT),
            realloc: has(REALLOC_EXPORT),
            free: has(FREE_EXPORT),
            function_table: has(TABLE_EXPORT),
            start: has(START_EXPORT),
            intrinsics: imports
                .iter()
                .filter(|i| i.module == crate::linker::INTRINSICS_MODULE)
                .map(|i| i.name.clone())
                .collect(),
        }
    }

    /// Whether the required exports are present.
    pub fn is_complete(&self) -> bool {
        self.memory && self.malloc
    }
}

/// Check that a module satisfies the bridge ABI.
///
/// `memory` and `__tether_malloc` are required; every bridge export that is
/// present must have the expected type.
pub fn validate_abi(module: &ValidatedModule) -> ModuleResult<()> {
    let expect = |name: &'static str, expected: &'static str, ok: fn(&ExternKind) -> bool| {
        match module.export(name) {
            Some(export) if !ok(&export.kind) => Err(ModuleError::AbiMismatch { name, expected }),
            _ => Ok(()),
        }
    };

    if !module.has_export(MEMORY_EXPORT) {
        return Err(ModuleError::MissingExport(MEMORY_EXPORT));
    }
    if !module.has_export(MALLOC_EXPORT) {
        return Err(ModuleError::MissingExport(MALLOC_EXPORT));
    }

    expect(MEMORY_EXPORT, "memory", |k| *k == ExternKind::Memory)?;
    expect(MALLOC_EXPORT, "(i32, i32) -> i32", |k| k.is_function(2, 1))?;
    expect(REALLOC_EXPORT, "(i32, i32, i32, i32) -> i32", |k| {
        k.is_function(4, 1)
    })?;
    expect(FREE_EXPORT, "(i32, i32, i32)", |k| k.is_function(3, 0))?;
    expect(TABLE_EXPORT, "funcref table", |k| *k == ExternKind::Table)?;
    expect(START_EXPORT, "()", |k| k.is_function(0, 0))?;

    if module.metadata.memories.iter().any(|m| m.memory64) {
        return Err(ModuleError::AbiMismatch {
            name: MEMORY_EXPORT,
            expected: "32-bit memory",
        });
    }

    Ok(())
}

/// Loader for WASM modules.
pub struct ModuleLoader {
    /// Reference to the engine used for compilation.
    engine: Arc<BridgeEngine>,
}

impl ModuleLoader {
    /// Create a new module loader with the given engine.
    pub fn new(engine: Arc<BridgeEngine>) -> Self {
        Self { engine }
    }

    /// Load and validate a module from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid WASM module.
    pub fn load_bytes(&self, bytes: &[u8]) -> ModuleResult<ValidatedModule> {
        debug!(size = bytes.len(), "Loading WASM module from bytes");

        let module = Module::new(self.engine.inner(), bytes)?;
        let metadata = extract_metadata(&module);

        info!(
            name = ?metadata.name,
            exports = metadata.exports.len(),
            imports = metadata.imports.len(),
            bridge_abi = metadata.abi.is_complete(),
            "Loaded WASM module"
        );

        Ok(ValidatedModule {
            inner: module,
            metadata,
        })
    }

    /// Load and validate a module from a file.
    ///
    /// Both binary and text format files are accepted.
    pub fn load_file(&self, path: &Path) -> ModuleResult<ValidatedModule> {
        debug!(path = %path.display(), "Loading WASM module from file");

        let bytes = std::fs::read(path)?;
        let wasm = wat::parse_bytes(&bytes).map_err(|e| ModuleError::Invalid(e.to_string()))?;
        self.load_bytes(&wasm)
    }

    /// Load and validate a module from WAT (WebAssembly Text) format.
    pub fn load_wat(&self, wat: &str) -> ModuleResult<ValidatedModule> {
        debug!(size = wat.len(), "Loading WASM module from WAT");

        let wasm = wat::parse_str(wat).map_err(|e| ModuleError::Invalid(e.to_string()))?;
        self.load_bytes(&wasm)
    }
}

fn extract_metadata(module: &Module) -> ModuleMetadata {
    let name = module.name().map(String::from);

    let exports: Vec<ExportInfo> = module
        .exports()
        .map(|export| ExportInfo {
            name: export.name().to_string(),
            kind: extern_kind(export.ty()),
        })
        .collect();

    let imports: Vec<ImportInfo> = module
        .imports()
        .map(|import| ImportInfo {
            module: import.module().to_string(),
            name: import.name().to_string(),
            kind: extern_kind(import.ty()),
        })
        .collect();

    let memories = module
        .exports()
        .filter_map(|export| match export.ty() {
            ExternType::Memory(mem) => Some(MemoryInfo {
                min_pages: mem.minimum(),
                max_pages: mem.maximum(),
                memory64: mem.is_64(),
            }),
            _ => None,
        })
        .collect();

    let abi = BridgeAbi::from_parts(&exports, &imports);

    ModuleMetadata {
        name,
        exports,
        imports,
        memories,
        abi,
    }
}

fn extern_kind(ty: ExternType) -> ExternKind {
    match ty {
        ExternType::Func(func) => ExternKind::Function {
            params: func.params().len(),
            results: func.results().len(),
        },
        ExternType::Memory(_) => ExternKind::Memory,
        ExternType::Global(_) => ExternKind::Global,
        ExternType::Table(_) => ExternKind::Table,
    }
}
