//! hostbind CLI - run modules against the host bridge
//!
//! Commands:
//!   hostbind run <wasm>  - Instantiate, start and drain the event loop
//!   hostbind imports     - List the host functions a module may import

use clap::{Parser, Subcommand};
use hostbind::config::BridgeConfig;
use hostbind::runtime::{import_catalogue, ImportEntry};
use hostbind::Runtime;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostbind")]
#[command(about = "Run WebAssembly modules against the hostbind bridge", long_about = None)]
struct Cli {
    /// Bridge configuration (JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module: start it, then deliver events until idle
    Run {
        /// Path to the WASM file
        wasm_file: PathBuf,

        /// Stop after this many event loop turns
        #[arg(long)]
        max_turns: Option<usize>,
    },
    /// List the imports registered for the configured module name
    Imports {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            wasm_file,
            max_turns,
        } => run_command(&wasm_file, config, max_turns),
        Commands::Imports { json } => imports_command(&config, json),
    }
}

fn run_command(wasm_file: &Path, config: BridgeConfig, max_turns: Option<usize>) -> anyhow::Result<()> {
    let runtime = Runtime::new();
    let module = runtime.load_file(wasm_file)?;
    let mut bridge = module.instantiate(config)?;

    bridge.start()?;
    let turns = bridge.run_until_idle(max_turns.unwrap_or(usize::MAX))?;

    let state = bridge.state();
    tracing::info!(
        turns,
        live_handles = state.table.live_count(),
        live_closures = state.closures.live_count(),
        "event loop idle"
    );
    Ok(())
}

fn imports_command(config: &BridgeConfig, json: bool) -> anyhow::Result<()> {
    let entries = import_catalogue(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print_entries(&entries);
    }
    Ok(())
}

fn print_entries(entries: &[ImportEntry]) {
    for entry in entries {
        let results = if entry.results.is_empty() {
            "()".to_string()
        } else {
            entry.results.join(", ")
        };
        println!(
            "{}.{}: ({}) -> {}",
            entry.module,
            entry.name,
            entry.params.join(", "),
            results
        );
    }
}
