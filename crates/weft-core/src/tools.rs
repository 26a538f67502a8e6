//! Tool registry: resolves declared tool names into callable handles.
//!
//! Concrete tool implementations live outside the core; they register here
//! as trait objects. MCP (network) tools are initialized eagerly at node
//! entry via [`Tool::prepare`]; code (in-process) tools receive the
//! execution context on every call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::ai::ToolSpec;
use crate::error::{Result, WeftError};

/// Failure of a single tool call. Stays inside the node invocation as an
/// `error` trace step; never crosses the node boundary.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("execution failed: {0}")]
    Execution(String),
}

/// Per-invocation context injected into every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workflow_invocation_id: Uuid,
    pub workflow_version_id: String,
    pub node_id: String,
    pub main_goal: String,
    pub files: Vec<String>,
}

/// A named callable with a declared argument schema.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema of the accepted arguments.
    fn parameters_schema(&self) -> serde_json::Value;

    /// One-time initialization at node entry. MCP tools establish their
    /// connection here; code tools usually have nothing to do.
    async fn prepare(&self, _ctx: &ToolContext) -> std::result::Result<(), ToolError> {
        Ok(())
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError>;
}

/// Resolved, ordered set of tool handles for one node invocation.
#[derive(Clone, Default)]
pub struct ToolSet {
    handles: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.handles.iter().find(|t| t.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handles.iter().map(|t| t.name()).collect()
    }

    /// Tool surface handed to the model.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.handles
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Spec for a single named tool.
    pub fn spec(&self, name: &str) -> Option<ToolSpec> {
        self.get(name).map(|t| ToolSpec {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet").field("names", &self.names()).finish()
    }
}

/// Registry of available tools, split by source.
///
/// Read-mostly after startup; per-invocation state lives in the
/// [`ToolContext`] passed to each call, so handles are shared safely.
#[derive(Default)]
pub struct ToolRegistry {
    code: HashMap<String, Arc<dyn Tool>>,
    mcp: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_code(&mut self, tool: Arc<dyn Tool>) {
        self.code.insert(tool.name().to_string(), tool);
    }

    pub fn register_mcp(&mut self, tool: Arc<dyn Tool>) {
        self.mcp.insert(tool.name().to_string(), tool);
    }

    /// Resolve a node's declared tool names into a [`ToolSet`].
    ///
    /// Code tools shadow MCP tools on a name collision (logged, not
    /// fatal). An undeclared name is a validation failure for the node.
    /// MCP handles run their eager `prepare` here, at node entry.
    pub async fn resolve(
        &self,
        code_names: &[String],
        mcp_names: &[String],
        ctx: &ToolContext,
    ) -> Result<ToolSet> {
        let mut handles: Vec<Arc<dyn Tool>> = Vec::new();

        for name in code_names {
            let tool = self.code.get(name).ok_or_else(|| {
                WeftError::Tool(format!("code tool '{name}' is not registered"))
            })?;
            handles.push(Arc::clone(tool));
        }

        for name in mcp_names {
            if code_names.contains(name) {
                warn!(
                    tool = %name,
                    node_id = %ctx.node_id,
                    "tool name declared by both sources; code tool shadows mcp"
                );
                continue;
            }
            let tool = self.mcp.get(name).ok_or_else(|| {
                WeftError::Tool(format!("mcp tool '{name}' is not registered"))
            })?;
            tool.prepare(ctx)
                .await
                .map_err(|e| WeftError::Tool(format!("mcp tool '{name}' failed to init: {e}")))?;
            handles.push(Arc::clone(tool));
        }

        Ok(ToolSet { handles })
    }
}
