use std::time::Duration;

use anyhow::Result;

use weft_core::config::WeftConfig;
use weft_core::executor::WorkflowExecutor;
use weft_core::persistence::PersistencePort;

/// Force-fail invocations stuck in `running` past the grace window.
pub async fn cleanup_stale(executor: &WorkflowExecutor, config: &WeftConfig) -> Result<()> {
    let grace = Duration::from_secs(config.persistence.stale_cleanup_grace_seconds);
    let report = executor.persistence().cleanup_stale(grace).await?;

    println!("workflow invocations failed: {}", report.workflow_invocations);
    println!("node invocations failed:     {}", report.node_invocations);
    Ok(())
}
