//! midibridge - run an untrusted MIDI script against the bridge
//!
//! # Configuration
//!
//! The bridge config is read from `--config`, or from
//! `<config dir>/midibridge/config.json` when that file exists. Without either
//! the defaults apply and no devices are present.
//!
//! Log output goes to stderr and follows `RUST_LOG`; `--verbose` raises the
//! default level to debug.
//!
//! `--print-types` writes TypeScript definitions for the script API to stdout.

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use midibridge_engine::{BridgeConfig, InMemoryChannel, LocalBridge, PortRegistry, ScriptLimits};
use midibridge_platform::MemoryBackend;
use midibridge_protocol::PortDescriptor;
use midibridge_script_host::{ScriptConfig, ScriptHost, TYPESCRIPT_DEFINITIONS};

const LOG_TARGETS: [&str; 5] = [
    "midibridge",
    "midibridge_engine",
    "midibridge_platform",
    "midibridge_policy",
    "midibridge_script_host",
];

/// midibridge - Web MIDI bridge for sandboxed scripts
#[derive(Parser, Debug)]
#[command(name = "midibridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Bridge config file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the native port enumeration and exit
    #[arg(long)]
    print_ports: bool,

    /// Print TypeScript definitions for the script API and exit
    #[arg(long)]
    print_types: bool,

    /// Script to run
    #[arg(required_unless_present_any = ["print_ports", "print_types"])]
    script: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_types {
        print!("{TYPESCRIPT_DEFINITIONS}");
        return Ok(());
    }
    init_tracing(args.verbose)?;

    let config = load_config(args.config.as_deref())?;
    let backend = config.build_backend();

    if args.print_ports {
        let ports = enumerate(backend)?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    let script = args.script.context("No script given")?;
    let source = fs::read_to_string(&script)
        .with_context(|| format!("Failed to read script {}", script.display()))?;

    let bridge = Rc::new(LocalBridge::new(backend, config.to_policy()));
    let host = ScriptHost::new(script_config(&config.script));

    tracing::info!(script = %script.display(), "Running script");
    let pump = bridge.clone();
    let result = host.execute(&source, bridge.engine(), move || {
        if let Err(e) = pump.poll() {
            tracing::warn!(error = %e, "Bridge pump failed");
        }
    })?;

    if let Some(value) = result.return_value {
        println!("{value}");
    }
    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::from_default_env();
    for target in LOG_TARGETS {
        filter = filter.add_directive(format!("{target}={level}").parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("midibridge").join("config.json"))
}

fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => {
                tracing::debug!("No config file, using defaults");
                return Ok(BridgeConfig::default());
            }
        },
    };

    tracing::info!("Config file: {}", path.display());
    Ok(BridgeConfig::load(&path)?)
}

fn script_config(limits: &ScriptLimits) -> ScriptConfig {
    ScriptConfig {
        timeout_ms: limits.timeout_ms,
        memory_limit: limits.memory_limit,
        max_sleep_ms: limits.max_sleep_ms,
    }
}

/// One enumeration pass, without a script context attached
fn enumerate(backend: MemoryBackend) -> Result<Vec<PortDescriptor>> {
    let (host, _content) = InMemoryChannel::new();
    let (sender, _receiver) = host.split();
    let registry = PortRegistry::new(backend, sender);

    Ok(registry
        .enumerate()?
        .into_iter()
        .map(|port| port.descriptor)
        .collect())
}
