//! Workflow DSL: the declarative node graph carried by a workflow version.
//!
//! The DSL travels as an opaque JSON blob in [`crate::model::WorkflowVersion`];
//! this module is the only place that parses and validates it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Schema version this build understands. Anything else is refused at
/// version creation, never at run time.
pub const DSL_SCHEMA_VERSION: u32 = 1;

/// Reserved sentinel `node_id` denoting workflow termination.
pub const END_NODE_ID: &str = "end";

/// Sentinel sender for the seed message of an invocation.
pub const START_NODE_ID: &str = "start";

/// How a node's successors receive its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandOffType {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

/// Configuration of one agent node inside the DSL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
    pub model_name: String,
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    #[serde(default)]
    pub code_tools: Vec<String>,
    pub hand_offs: Vec<String>,
    #[serde(default)]
    pub hand_off_type: HandOffType,
    /// Durable per-node key-value memory; updates are committed by the
    /// executor and become visible to the node's *next* invocation.
    #[serde(default)]
    pub memory: BTreeMap<String, String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub wait_for: Vec<String>,
    #[serde(default)]
    pub use_direct_sdk: bool,
}

impl NodeConfig {
    pub fn tool_names(&self) -> Vec<&str> {
        self.code_tools
            .iter()
            .chain(self.mcp_tools.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn has_tools(&self) -> bool {
        !self.code_tools.is_empty() || !self.mcp_tools.is_empty()
    }
}

/// The parsed workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDsl {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub entry_node_id: String,
    pub nodes: Vec<NodeConfig>,
}

fn default_schema_version() -> u32 {
    DSL_SCHEMA_VERSION
}

impl WorkflowDsl {
    /// Parse a DSL blob, refusing unknown schema versions before any
    /// structural validation.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        if let Some(found) = value.get("schema_version").and_then(|v| v.as_u64()) {
            let found = found as u32;
            if found != DSL_SCHEMA_VERSION {
                return Err(WeftError::SchemaVersion {
                    found,
                    supported: DSL_SCHEMA_VERSION,
                });
            }
        }

        let dsl: WorkflowDsl = serde_json::from_value(value.clone())
            .map_err(|e| WeftError::Validation(format!("malformed workflow dsl: {e}")))?;
        dsl.validate()?;
        Ok(dsl)
    }

    /// Serialize back to the opaque blob form, schema version included.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("dsl serialization is infallible")
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Structural validation of the graph.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(WeftError::Validation("workflow has no nodes".into()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if node.node_id.is_empty() {
                return Err(WeftError::Validation("node with empty node_id".into()));
            }
            if node.node_id == END_NODE_ID || node.node_id == START_NODE_ID {
                return Err(WeftError::Validation(format!(
                    "node_id '{}' is reserved",
                    node.node_id
                )));
            }
            if !seen.insert(node.node_id.as_str()) {
                return Err(WeftError::Validation(format!(
                    "duplicate node_id '{}'",
                    node.node_id
                )));
            }
        }

        if self.node(&self.entry_node_id).is_none() {
            return Err(WeftError::Validation(format!(
                "entry node '{}' not found in workflow",
                self.entry_node_id
            )));
        }

        for node in &self.nodes {
            if node.hand_offs.is_empty() {
                return Err(WeftError::Validation(format!(
                    "node '{}' declares no hand_offs",
                    node.node_id
                )));
            }
            for target in &node.hand_offs {
                if target != END_NODE_ID && self.node(target).is_none() {
                    return Err(WeftError::Validation(format!(
                        "node '{}' hands off to unknown node '{target}'",
                        node.node_id
                    )));
                }
            }
            for dep in &node.wait_for {
                if self.node(dep).is_none() {
                    return Err(WeftError::Validation(format!(
                        "node '{}' waits for unknown node '{dep}'",
                        node.node_id
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_dsl() -> serde_json::Value {
        json!({
            "entry_node_id": "echo",
            "nodes": [{
                "node_id": "echo",
                "system_prompt": "Echo the input.",
                "model_name": "sim-1",
                "hand_offs": ["end"]
            }]
        })
    }

    #[test]
    fn parse_minimal_dsl() {
        let dsl = WorkflowDsl::parse(&echo_dsl()).unwrap();
        assert_eq!(dsl.schema_version, DSL_SCHEMA_VERSION);
        assert_eq!(dsl.entry_node_id, "echo");
        assert_eq!(dsl.nodes.len(), 1);
        assert_eq!(dsl.nodes[0].hand_off_type, HandOffType::Sequential);
        assert!(!dsl.nodes[0].use_direct_sdk);
    }

    #[test]
    fn unknown_schema_version_refused() {
        let mut blob = echo_dsl();
        blob["schema_version"] = json!(99);
        let err = WorkflowDsl::parse(&blob).unwrap_err();
        assert!(matches!(
            err,
            WeftError::SchemaVersion {
                found: 99,
                supported: DSL_SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn reserved_node_ids_rejected() {
        for reserved in [END_NODE_ID, START_NODE_ID] {
            let blob = json!({
                "entry_node_id": reserved,
                "nodes": [{
                    "node_id": reserved,
                    "system_prompt": "x",
                    "model_name": "m",
                    "hand_offs": ["end"]
                }]
            });
            let err = WorkflowDsl::parse(&blob).unwrap_err();
            assert!(err.to_string().contains("reserved"), "{err}");
        }
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let blob = json!({
            "entry_node_id": "a",
            "nodes": [
                {"node_id": "a", "system_prompt": "x", "model_name": "m", "hand_offs": ["end"]},
                {"node_id": "a", "system_prompt": "y", "model_name": "m", "hand_offs": ["end"]}
            ]
        });
        let err = WorkflowDsl::parse(&blob).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_handoff_target_rejected() {
        let blob = json!({
            "entry_node_id": "a",
            "nodes": [
                {"node_id": "a", "system_prompt": "x", "model_name": "m", "hand_offs": ["ghost"]}
            ]
        });
        let err = WorkflowDsl::parse(&blob).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn missing_entry_rejected() {
        let blob = json!({
            "entry_node_id": "nope",
            "nodes": [
                {"node_id": "a", "system_prompt": "x", "model_name": "m", "hand_offs": ["end"]}
            ]
        });
        let err = WorkflowDsl::parse(&blob).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn empty_handoffs_rejected() {
        let blob = json!({
            "entry_node_id": "a",
            "nodes": [
                {"node_id": "a", "system_prompt": "x", "model_name": "m", "hand_offs": []}
            ]
        });
        let err = WorkflowDsl::parse(&blob).unwrap_err();
        assert!(err.to_string().contains("no hand_offs"));
    }

    #[test]
    fn to_value_round_trips_with_schema_version() {
        let dsl = WorkflowDsl::parse(&echo_dsl()).unwrap();
        let blob = dsl.to_value();
        assert_eq!(blob["schema_version"], json!(DSL_SCHEMA_VERSION));
        let back = WorkflowDsl::parse(&blob).unwrap();
        assert_eq!(back, dsl);
    }

    #[test]
    fn tool_names_code_before_mcp() {
        let node: NodeConfig = serde_json::from_value(json!({
            "node_id": "n",
            "system_prompt": "x",
            "model_name": "m",
            "mcp_tools": ["search"],
            "code_tools": ["todo_write"],
            "hand_offs": ["end"]
        }))
        .unwrap();
        assert_eq!(node.tool_names(), vec!["todo_write", "search"]);
        assert!(node.has_tools());
    }
}
