//! Run command - Instantiate a module with the bridge and call an export.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::{Deserialize, Serialize};

use tether::prelude::*;
use tether_core::BridgeStats;
use wasmtime::Val;

use crate::OutputFormat;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Path to the WebAssembly module (binary or text format)
    #[arg(required = true)]
    pub module: PathBuf,

    /// Function to execute (default: main or _start)
    #[arg(short = 'e', long)]
    pub function: Option<String>,

    /// Fuel limit for execution (enables fuel metering)
    #[arg(long)]
    pub fuel_limit: Option<u64>,

    /// Report double frees as errors regardless of the configured policy
    #[arg(long)]
    pub strict: bool,

    /// Show bridge statistics
    #[arg(long)]
    pub stats: bool,
}

/// Settings read from `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunConfig {
    bridge: BridgeConfig,
    engine: EngineConfig,
}

impl RunConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

/// Outcome of a run.
#[derive(Debug, Serialize)]
struct RunReport {
    module: String,
    function: String,
    success: bool,
    results: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<BridgeStats>,
}

fn render(value: &Val) -> String {
    match value {
        Val::I32(v) => v.to_string(),
        Val::I64(v) => v.to_string(),
        Val::F32(bits) => f32::from_bits(*bits).to_string(),
        Val::F64(bits) => f64::from_bits(*bits).to_string(),
        other => format!("{other:?}"),
    }
}

fn pick_function<'m>(requested: Option<&'m str>, module: &'m ValidatedModule) -> Result<&'m str> {
    if let Some(name) = requested {
        return Ok(name);
    }
    ["main", "_start"]
        .into_iter()
        .find(|name| module.has_export(name))
        .context("Module exports neither main nor _start; pass -e <function>")
}

/// Execute the run command.
pub fn execute(
    args: RunArgs,
    config: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let mut config = RunConfig::load(config)?;
    if let Some(fuel) = args.fuel_limit {
        config.engine = config.engine.with_fuel(fuel);
    }
    if args.strict {
        config.bridge = config.bridge.with_free_policy(FreePolicy::Strict);
    }

    let runtime = Tether::builder()
        .with_engine_config(config.engine)
        .with_bridge_config(config.bridge)
        .build()
        .context("Failed to create runtime")?;

    let module = runtime
        .load_file(&args.module)
        .context("Failed to load module")?;
    let function = pick_function(args.function.as_deref(), &module)?.to_string();

    let mut linker = runtime
        .linker::<()>()
        .context("Failed to define bridge intrinsics")?;
    linker
        .trap_unknown_imports(&module)
        .context("Failed to stub unknown imports")?;

    let mut instance = runtime
        .instantiate(&linker, &module, ())
        .context("Failed to instantiate module")?;

    let Some(func_type) = instance.func_type(&function) else {
        bail!("Function '{}' is not exported", function);
    };
    let params = func_type.params().len();
    if params > 0 {
        bail!(
            "Function '{}' takes {} parameters; only nullary functions can be run",
            function,
            params
        );
    }

    if !quiet {
        tracing::info!(
            module = %args.module.display(),
            function = %function,
            "Executing module"
        );
    }

    let outcome = instance
        .call_dynamic(&function, &[])
        .map_err(anyhow::Error::from)
        .and_then(|results| match instance.take_pending_error()? {
            Some(exception) => Err(anyhow::anyhow!("Guest left a pending error: {exception}")),
            None => Ok(results),
        });

    let report = RunReport {
        module: args.module.display().to_string(),
        function,
        success: outcome.is_ok(),
        results: outcome
            .as_ref()
            .map(|results| results.iter().map(render).collect())
            .unwrap_or_default(),
        error: outcome.as_ref().err().map(|e| format!("{e:#}")),
        stats: args.stats.then(|| instance.stats()),
    };

    instance.teardown().context("Failed to tear down instance")?;

    match format {
        OutputFormat::Human => {
            if report.success && !quiet {
                println!("{} completed", report.function);
                if !report.results.is_empty() {
                    println!("Results: {}", report.results.join(", "));
                }
            }
            if let Some(stats) = &report.stats {
                println!("\nBridge stats:");
                println!("  Live handles:          {}", stats.live_handles);
                println!("  Handle capacity:       {}", stats.handle_capacity);
                println!("  View rebuilds:         {}", stats.view_rebuilds);
                println!("  Bytes decoded:         {}", stats.bytes_decoded);
                println!("  Decoder instances:     {}", stats.decoder_instances);
                println!("  Live closures:         {}", stats.live_closures);
                println!("  Pending reclamations:  {}", stats.pending_reclamations);
                println!("  Error pending:         {}", stats.error_pending);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::JsonCompact => println!("{}", serde_json::to_string(&report)?),
    }

    outcome.map(drop).context("Execution failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_sections() {
        let config: RunConfig = toml::from_str(
            r#"
            [bridge.handles]
            max_handles = 256
            free_policy = "strict"

            [engine]
            fuel_enabled = true
            initial_fuel = 5000
        "#,
        )
        .unwrap();

        assert_eq!(config.bridge.handles.max_handles, 256);
        assert_eq!(config.bridge.handles.free_policy, FreePolicy::Strict);
        assert!(config.engine.fuel_enabled);
        assert_eq!(config.engine.initial_fuel, 5000);
    }

    #[test]
    fn test_run_config_defaults_without_file() {
        let config = RunConfig::load(None).unwrap();
        assert_eq!(config.bridge, BridgeConfig::default());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_render_values() {
        assert_eq!(render(&Val::I32(-3)), "-3");
        assert_eq!(render(&Val::F64(2.5f64.to_bits())), "2.5");
    }
}
