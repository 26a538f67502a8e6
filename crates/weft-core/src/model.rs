//! Domain records persisted through the persistence port.
//!
//! These are plain serde structs speaking domain nouns only; no backend
//! types leak into them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsl::NodeConfig;
use crate::payload::Payload;

/// Immutable workflow identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub description: String,
}

/// How a workflow version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOperation {
    Init,
    Mutation,
    Crossover,
    Immigrant,
}

/// Append-only snapshot of a workflow's structure.
///
/// The `dsl` blob is opaque to persistence apart from its
/// `schema_version` annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub version_id: String,
    pub workflow_id: String,
    pub dsl: serde_json::Value,
    pub operation: VersionOperation,
    pub commit_message: String,
    pub generation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a workflow invocation. Created `running`, transitions
/// exactly once to a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
            InvocationStatus::RolledBack => "rolled_back",
        }
    }
}

/// One end-to-end execution of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInvocation {
    pub invocation_id: Uuid,
    pub version_id: String,
    pub status: InvocationStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub usd_cost: f64,
    pub workflow_input: Option<serde_json::Value>,
    pub workflow_output: Option<serde_json::Value>,
    pub fitness: Option<Fitness>,
    /// Stored as an integer percentage (rounded at the persistence boundary).
    pub accuracy: Option<f64>,
    pub fitness_score: Option<f64>,
    pub run_id: Option<String>,
    pub generation_id: Option<String>,
    pub extras: Option<serde_json::Value>,
}

impl WorkflowInvocation {
    /// Fresh invocation row in `running` state.
    pub fn started(
        version_id: &str,
        workflow_input: Option<serde_json::Value>,
        run_id: Option<String>,
        generation_id: Option<String>,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            version_id: version_id.to_string(),
            status: InvocationStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            usd_cost: 0.0,
            workflow_input,
            workflow_output: None,
            fitness: None,
            accuracy: None,
            fitness_score: None,
            run_id,
            generation_id,
            extras: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// One snapshot row per `(node_id, version_id, bump)`.
///
/// `version` is monotonic per node within its workflow version; memory
/// lives inside the config snapshot and a new bump is written whenever a
/// node invocation's memory delta is committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeVersionRecord {
    pub node_version_id: Uuid,
    pub node_id: String,
    pub wf_version_id: String,
    pub version: u32,
    pub config: NodeConfig,
}

/// Lifecycle of a single node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInvocationStatus {
    Running,
    Completed,
    Failed,
}

impl NodeInvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeInvocationStatus::Running)
    }
}

/// One execution of a node inside a workflow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInvocation {
    pub node_invocation_id: Uuid,
    pub node_id: String,
    pub node_version_id: Uuid,
    pub invocation_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: NodeInvocationStatus,
    pub model: String,
    pub attempt_no: u32,
    pub usd_cost: f64,
    pub output: Option<serde_json::Value>,
    pub summary: String,
    pub files: Vec<String>,
    pub error: Option<String>,
    /// Serialized trace and proposed memory delta.
    pub extras: Option<serde_json::Value>,
}

/// Role of a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Delegation,
    Result,
    Sequential,
    Aggregated,
    Error,
}

/// One message routed between nodes within a workflow invocation.
///
/// `seq` is assigned monotonically by the executor at emit time.
/// Back-references are plain identifiers resolved through persistence,
/// never in-memory pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: Uuid,
    pub invocation_id: Uuid,
    pub from_node_id: Option<String>,
    pub to_node_id: Option<String>,
    pub seq: u64,
    pub role: MessageRole,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    pub origin_invocation_id: Option<Uuid>,
}

/// Fitness payload produced by an external evaluator.
///
/// The wire form is duck-typed (number, object, or stringified JSON);
/// normalization happens once here and downstream code matches on the
/// variants only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Fitness {
    Score(f64),
    Structured(serde_json::Map<String, serde_json::Value>),
    Opaque(String),
}

impl Fitness {
    pub fn as_score(&self) -> Option<f64> {
        match self {
            Fitness::Score(s) => Some(*s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Fitness {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => Fitness::Score(f),
                None => Fitness::Opaque(n.to_string()),
            },
            serde_json::Value::Object(map) => Fitness::Structured(map),
            serde_json::Value::String(s) => {
                // Stringified JSON shows up in the wild; unwrap one level.
                match serde_json::from_str::<serde_json::Value>(&s) {
                    Ok(serde_json::Value::Number(n)) if n.as_f64().is_some() => {
                        Fitness::Score(n.as_f64().unwrap())
                    }
                    Ok(serde_json::Value::Object(map)) => Fitness::Structured(map),
                    _ => Fitness::Opaque(s),
                }
            }
            other => Fitness::Opaque(other.to_string()),
        }
    }
}

impl From<Fitness> for serde_json::Value {
    fn from(fitness: Fitness) -> Self {
        match fitness {
            Fitness::Score(s) => serde_json::Number::from_f64(s)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Fitness::Structured(map) => serde_json::Value::Object(map),
            Fitness::Opaque(s) => serde_json::Value::String(s),
        }
    }
}
