//! The persistence port: an append-only record of workflows, versions,
//! invocations, nodes, node invocations, and messages.
//!
//! The port speaks domain nouns only and never leaks backend types.
//! Concrete database drivers are external collaborators; the in-memory
//! implementation in [`memory`] is part of the core and preserves every
//! invariant for tests and single-process runs.

mod memory;

pub use memory::InMemoryPersistence;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dsl::NodeConfig;
use crate::model::{
    Fitness, InvocationStatus, Message, NodeInvocation, NodeInvocationStatus, NodeVersionRecord,
    WorkflowInvocation, WorkflowRecord, WorkflowVersion,
};

/// Error kinds surfaced by any backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Illegal state transition or concurrent conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Wrapped driver error; the only retryable kind.
    #[error("backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Backend(_))
    }
}

/// Partial update of a workflow invocation, keyed by `invocation_id`.
///
/// Status transitions are monotonic: `running` may move to a terminal
/// state once, terminal states never change again.
#[derive(Debug, Clone, Default)]
pub struct InvocationPatch {
    pub status: Option<InvocationStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub usd_cost: Option<f64>,
    pub workflow_output: Option<serde_json::Value>,
    pub fitness: Option<Fitness>,
    /// Rounded to an integer percentage before storage.
    pub accuracy: Option<f64>,
    pub fitness_score: Option<f64>,
    pub extras: Option<serde_json::Value>,
}

/// Insert payload for a node invocation row; the port assigns the id.
#[derive(Debug, Clone)]
pub struct NodeInvocationStart {
    pub node_id: String,
    pub node_version_id: Uuid,
    pub invocation_id: Uuid,
    pub model: String,
    pub attempt_no: u32,
    pub start_time: DateTime<Utc>,
}

/// Terminal update for a node invocation row.
#[derive(Debug, Clone)]
pub struct NodeInvocationEnd {
    pub node_invocation_id: Uuid,
    pub status: NodeInvocationStatus,
    pub end_time: DateTime<Utc>,
    pub usd_cost: f64,
    pub output: Option<serde_json::Value>,
    pub summary: String,
    pub files: Vec<String>,
    pub error: Option<String>,
    /// Serialized trace and proposed memory delta.
    pub extras: Option<serde_json::Value>,
}

/// Listing filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub status: Option<InvocationStatus>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    pub min_accuracy: Option<f64>,
    pub max_accuracy: Option<f64>,
    pub min_fitness: Option<f64>,
    pub max_fitness: Option<f64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub generation_id: Option<String>,
    pub wf_version_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    StartTime,
    UsdCost,
    Status,
    Fitness,
    Accuracy,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListSort {
    pub field: SortField,
    pub dir: SortDir,
}

impl Default for ListSort {
    fn default() -> Self {
        Self {
            field: SortField::StartTime,
            dir: SortDir::Desc,
        }
    }
}

/// Aggregates computed over the full filtered set, not just the page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationAggregates {
    pub total_spent_usd: f64,
    pub avg_accuracy: Option<f64>,
    pub failed_count: u64,
}

/// One page of the invocation listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPage {
    pub rows: Vec<WorkflowInvocation>,
    pub total_count: u64,
    pub aggregates: InvocationAggregates,
}

/// Counts of rows force-failed by `cleanup_stale`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub workflow_invocations: u64,
    pub node_invocations: u64,
}

/// Full execution trace of one workflow invocation, assembled for the
/// read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceBundle {
    pub workflow: WorkflowRecord,
    pub version: WorkflowVersion,
    pub invocation: WorkflowInvocation,
    /// Ordered by `start_time`.
    pub node_invocations: Vec<NodeInvocation>,
    /// Ordered by `seq`.
    pub messages: Vec<Message>,
}

/// Boxed async callback run against a transactional subview of the port.
pub type TxCallback = Box<
    dyn FnOnce(
            Arc<dyn PersistencePort>,
        )
            -> Pin<Box<dyn Future<Output = std::result::Result<(), PersistenceError>> + Send>>
        + Send,
>;

/// The narrow persistence capability, speaking domain nouns only.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Idempotent upsert of the workflow identity row.
    async fn ensure_workflow(
        &self,
        workflow_id: &str,
        description: &str,
    ) -> std::result::Result<(), PersistenceError>;

    /// Insert-or-upsert by `version_id`. The DSL blob is annotated with
    /// the current schema version if absent; an unknown annotated version
    /// is refused with `Conflict`.
    async fn create_workflow_version(
        &self,
        version: WorkflowVersion,
    ) -> std::result::Result<(), PersistenceError>;

    async fn workflow_version(
        &self,
        version_id: &str,
    ) -> std::result::Result<WorkflowVersion, PersistenceError>;

    /// Insert a fresh invocation row (must be `running`).
    async fn create_workflow_invocation(
        &self,
        invocation: WorkflowInvocation,
    ) -> std::result::Result<(), PersistenceError>;

    async fn update_workflow_invocation(
        &self,
        invocation_id: Uuid,
        patch: InvocationPatch,
    ) -> std::result::Result<(), PersistenceError>;

    async fn workflow_invocation(
        &self,
        invocation_id: Uuid,
    ) -> std::result::Result<WorkflowInvocation, PersistenceError>;

    /// Snapshot a node config, assigning the next monotonic `version`
    /// under `(node_id, wf_version_id)` atomically.
    async fn save_node_version(
        &self,
        config: NodeConfig,
        wf_version_id: &str,
    ) -> std::result::Result<NodeVersionRecord, PersistenceError>;

    async fn latest_node_version(
        &self,
        node_id: &str,
        wf_version_id: &str,
    ) -> std::result::Result<Option<NodeVersionRecord>, PersistenceError>;

    /// Insert a node invocation in `running`, returning its id.
    async fn start_node_invocation(
        &self,
        start: NodeInvocationStart,
    ) -> std::result::Result<Uuid, PersistenceError>;

    async fn end_node_invocation(
        &self,
        end: NodeInvocationEnd,
    ) -> std::result::Result<(), PersistenceError>;

    /// Insert with uniqueness on `msg_id`.
    async fn save_message(&self, msg: Message) -> std::result::Result<(), PersistenceError>;

    /// Page through invocations; `page` starts at 1.
    async fn list_invocations(
        &self,
        page: u32,
        page_size: u32,
        filters: ListFilters,
        sort: ListSort,
    ) -> std::result::Result<InvocationPage, PersistenceError>;

    /// Delete invocations, cascading to their node invocations and
    /// messages. Returns the number of invocation rows removed.
    async fn delete_invocations(
        &self,
        ids: &[Uuid],
    ) -> std::result::Result<u64, PersistenceError>;

    /// Force-fail invocations (and their node invocations) still
    /// `running` past the grace window.
    async fn cleanup_stale(
        &self,
        grace: Duration,
    ) -> std::result::Result<CleanupReport, PersistenceError>;

    /// Assemble the full trace bundle for the read API.
    async fn get_trace(
        &self,
        invocation_id: Uuid,
    ) -> std::result::Result<TraceBundle, PersistenceError>;

    /// Run `callback` against a transactional subview; commit on success,
    /// roll back on failure.
    async fn with_transaction(
        &self,
        callback: TxCallback,
    ) -> std::result::Result<(), PersistenceError>;
}

/// Retry a persistence operation up to 3 times with exponential backoff.
///
/// Only `Backend` errors are retried; everything else surfaces at once.
pub async fn with_retries<T, F, Fut>(
    op_name: &str,
    mut op: F,
) -> std::result::Result<T, PersistenceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, PersistenceError>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                let backoff = Duration::from_millis(50 * 2u64.pow(attempt - 1));
                tracing::warn!(
                    op = op_name,
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying persistence operation"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
