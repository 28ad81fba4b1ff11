//! Inspect command - Show a module's exports, imports and bridge ABI.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use tether::prelude::*;
use tether_host::{BridgeAbi, ExportInfo, ExternKind, ImportInfo};

use crate::OutputFormat;

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// Path to the WebAssembly module (binary or text format)
    #[arg(required = true)]
    pub module: PathBuf,

    /// Show exports
    #[arg(long)]
    pub exports: bool,

    /// Show imports
    #[arg(long)]
    pub imports: bool,

    /// Show memory information
    #[arg(long)]
    pub memory: bool,

    /// Show the bridge ABI summary
    #[arg(long)]
    pub abi: bool,

    /// Show all information
    #[arg(long, short)]
    pub all: bool,
}

/// Inspection result.
#[derive(Debug, Serialize)]
struct InspectionResult {
    path: String,
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exports: Option<Vec<ExportDisplay>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    imports: Option<Vec<ImportDisplay>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memories: Option<Vec<MemoryDisplay>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abi: Option<AbiDisplay>,
}

#[derive(Debug, Serialize)]
struct ExportDisplay {
    name: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImportDisplay {
    module: String,
    name: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    intrinsic: bool,
}

#[derive(Debug, Serialize)]
struct MemoryDisplay {
    min_pages: u64,
    max_pages: Option<u64>,
    memory64: bool,
}

#[derive(Debug, Serialize)]
struct AbiDisplay {
    complete: bool,
    #[serde(flatten)]
    abi: BridgeAbi,
}

fn signature(kind: &ExternKind) -> Option<String> {
    match kind {
        ExternKind::Function { params, results } => {
            Some(format!("({params} params) -> ({results} results)"))
        }
        _ => None,
    }
}

impl From<&ExportInfo> for ExportDisplay {
    fn from(info: &ExportInfo) -> Self {
        Self {
            name: info.name.clone(),
            kind: info.kind.name(),
            signature: signature(&info.kind),
        }
    }
}

impl From<&ImportInfo> for ImportDisplay {
    fn from(info: &ImportInfo) -> Self {
        Self {
            module: info.module.clone(),
            name: info.name.clone(),
            kind: info.kind.name(),
            signature: signature(&info.kind),
            intrinsic: info.module == tether_host::INTRINSICS_MODULE,
        }
    }
}

/// Execute the inspect command.
pub fn execute(args: InspectArgs, format: OutputFormat) -> Result<()> {
    let runtime = Tether::with_defaults().context("Failed to create runtime")?;

    let module = runtime
        .load_file(&args.module)
        .context("Failed to load module")?;

    let show_all = args.all || (!args.exports && !args.imports && !args.memory && !args.abi);

    let mut result = InspectionResult {
        path: args.module.display().to_string(),
        name: module.name().map(String::from),
        exports: None,
        imports: None,
        memories: None,
        abi: None,
    };

    if show_all || args.exports {
        result.exports = Some(module.exports().iter().map(ExportDisplay::from).collect());
    }

    if show_all || args.imports {
        result.imports = Some(module.imports().iter().map(ImportDisplay::from).collect());
    }

    if show_all || args.memory {
        result.memories = Some(
            module
                .metadata()
                .memories
                .iter()
                .map(|m| MemoryDisplay {
                    min_pages: m.min_pages,
                    max_pages: m.max_pages,
                    memory64: m.memory64,
                })
                .collect(),
        );
    }

    if show_all || args.abi {
        result.abi = Some(AbiDisplay {
            complete: module.abi().is_complete(),
            abi: module.abi().clone(),
        });
    }

    match format {
        OutputFormat::Human => print_human(&args.module, &result),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::JsonCompact => {
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    Ok(())
}

fn print_human(path: &std::path::Path, result: &InspectionResult) {
    println!("Module: {}", path.display());
    if let Some(name) = &result.name {
        println!("Name: {}", name);
    }
    println!();

    if let Some(exports) = &result.exports {
        println!("Exports ({}):", exports.len());
        for export in exports {
            match &export.signature {
                Some(sig) => println!("  {} [{}]: {}", export.name, export.kind, sig),
                None => println!("  {} [{}]", export.name, export.kind),
            }
        }
        println!();
    }

    if let Some(imports) = &result.imports {
        println!("Imports ({}):", imports.len());
        for import in imports {
            let marker = if import.intrinsic { " (intrinsic)" } else { "" };
            match &import.signature {
                Some(sig) => println!(
                    "  {}::{} [{}]: {}{}",
                    import.module, import.name, import.kind, sig, marker
                ),
                None => println!(
                    "  {}::{} [{}]{}",
                    import.module, import.name, import.kind, marker
                ),
            }
        }
        println!();
    }

    if let Some(memories) = &result.memories {
        println!("Memories ({}):", memories.len());
        for (i, memory) in memories.iter().enumerate() {
            let max = memory
                .max_pages
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unbounded".to_string());
            let bits = if memory.memory64 { "64-bit" } else { "32-bit" };
            println!("  [{}] {} - {} pages ({})", i, memory.min_pages, max, bits);
        }
        println!();
    }

    if let Some(abi) = &result.abi {
        let mark = |present: bool| if present { "yes" } else { "no" };
        println!(
            "Bridge ABI: {}",
            if abi.complete { "complete" } else { "incomplete" }
        );
        println!("  memory:           {}", mark(abi.abi.memory));
        println!("  __tether_malloc:  {}", mark(abi.abi.malloc));
        println!("  __tether_realloc: {}", mark(abi.abi.realloc));
        println!("  __tether_free:    {}", mark(abi.abi.free));
        println!("  function table:   {}", mark(abi.abi.function_table));
        println!("  __tether_start:   {}", mark(abi.abi.start));
        if !abi.abi.intrinsics.is_empty() {
            println!("  intrinsics:       {}", abi.abi.intrinsics.join(", "));
        }
    }
}
