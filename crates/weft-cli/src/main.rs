use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use weft_core::ai::SimulatedClient;
use weft_core::config::{load_config, PersistenceBackend, WeftConfig};
use weft_core::executor::WorkflowExecutor;
use weft_core::persistence::InMemoryPersistence;
use weft_core::spending::CostLedger;
use weft_core::tools::ToolRegistry;

mod cleanup;
mod run;
mod trace;

#[derive(Parser)]
#[command(name = "weft", version, about = "Weft workflow execution platform")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workflow version against an input file.
    Run(run::RunArgs),
    /// Print the canonical JSON trace of an invocation.
    Trace {
        /// Invocation id to inspect.
        invocation_id: String,
    },
    /// Force-fail invocations stuck in `running` past the grace window.
    CleanupStale,
}

#[tokio::main]
async fn main() -> Result<()> {
    weft_core::init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let executor = build_executor(&config)?;

    match cli.command {
        Command::Run(args) => run::run(&executor, args).await,
        Command::Trace { invocation_id } => trace::print_trace(&executor, &invocation_id).await,
        Command::CleanupStale => cleanup::cleanup_stale(&executor, &config).await,
    }
}

/// Assemble the executor from config.
///
/// Without a wired AI provider the simulated client drives nodes; real
/// provider adapters and SQL persistence plug in through the same ports.
fn build_executor(config: &WeftConfig) -> Result<WorkflowExecutor> {
    let persistence = match config.persistence.backend {
        PersistenceBackend::Memory => Arc::new(InMemoryPersistence::new()),
        PersistenceBackend::Sql => {
            bail!("the sql backend needs an external driver; configure backend = \"memory\"")
        }
    };

    Ok(WorkflowExecutor::new(
        persistence,
        Arc::new(SimulatedClient::new()),
        Arc::new(ToolRegistry::new()),
        Arc::new(CostLedger::new(config.spending.cap_usd)),
        config.clone(),
    ))
}
