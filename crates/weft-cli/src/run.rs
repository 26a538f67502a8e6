use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use weft_core::executor::{RunOptions, WorkflowExecutor};
use weft_core::model::{InvocationStatus, VersionOperation};
use weft_core::persistence::PersistencePort;

#[derive(Args)]
pub struct RunArgs {
    /// Workflow version to run.
    #[arg(long, default_value = "v1")]
    pub version_id: String,

    /// File containing the workflow input (JSON, or plain text).
    #[arg(long)]
    pub input: PathBuf,

    /// Register this DSL file (JSON) as the version before running.
    #[arg(long)]
    pub dsl: Option<PathBuf>,

    /// Workflow id used when registering a DSL.
    #[arg(long, default_value = "adhoc")]
    pub workflow_id: String,

    /// Print the canonical JSON trace after the run.
    #[arg(long)]
    pub emit_trace: bool,
}

pub async fn run(executor: &WorkflowExecutor, args: RunArgs) -> Result<()> {
    if let Some(dsl_path) = &args.dsl {
        let raw = std::fs::read_to_string(dsl_path)
            .with_context(|| format!("failed to read dsl file {}", dsl_path.display()))?;
        let dsl: serde_json::Value =
            serde_json::from_str(&raw).context("dsl file is not valid JSON")?;
        executor
            .create_version(
                &args.workflow_id,
                "registered from the command line",
                &args.version_id,
                dsl,
                VersionOperation::Init,
                "cli run",
                None,
            )
            .await?;
    }

    let raw_input = std::fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read input file {}", args.input.display()))?;
    // JSON inputs pass through as values; anything else is plain text.
    let input: serde_json::Value = serde_json::from_str(&raw_input)
        .unwrap_or_else(|_| serde_json::Value::String(raw_input.trim_end().to_string()));

    let invocation = executor
        .run_to_completion(&args.version_id, input, RunOptions::default())
        .await?;

    println!("invocation: {}", invocation.invocation_id);
    println!("status:     {}", invocation.status.label());
    println!("cost:       ${:.4}", invocation.usd_cost);
    if let Some(output) = &invocation.workflow_output {
        println!("output:     {output}");
    }

    if args.emit_trace {
        let bundle = executor
            .persistence()
            .get_trace(invocation.invocation_id)
            .await?;
        println!("{}", serde_json::to_string_pretty(&bundle)?);
    }

    if invocation.status != InvocationStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
