use anyhow::{Context, Result};
use uuid::Uuid;

use weft_core::executor::WorkflowExecutor;
use weft_core::persistence::PersistencePort;

/// Print the canonical JSON trace bundle for an invocation.
pub async fn print_trace(executor: &WorkflowExecutor, invocation_id: &str) -> Result<()> {
    let id: Uuid = invocation_id
        .parse()
        .context("invocation id must be a uuid")?;

    let bundle = executor.persistence().get_trace(id).await?;
    println!("{}", serde_json::to_string_pretty(&bundle)?);
    Ok(())
}
