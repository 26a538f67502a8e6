//! Typed step trace produced during one node invocation.
//!
//! The trace is owned exclusively by its node invocation until the pipeline
//! returns; it is then frozen and handed to persistence. Step order reflects
//! real-time append order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Serialized size bound: beyond this many steps, older non-terminal steps
/// are summarized and collapsed.
pub const MAX_TRACE_STEPS: usize = 200;

/// One step in an agent's execution trace. Closed variant set; every
/// consumer pattern-matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentStep {
    /// Context message shown to the model at entry.
    Prepare { content: String },

    /// Free-text AI rationale for the next action.
    Reasoning { content: String },

    /// Short plan for the next action.
    Plan { content: String },

    /// One executed tool call.
    Tool {
        name: String,
        args: serde_json::Value,
        #[serde(rename = "return")]
        output: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Plain textual model output.
    Text { content: String },

    /// Recoverable error surfaced by a substep; the loop continues.
    Error { reason: String },

    /// Proposed memory update derived at terminate.
    Learning { delta: BTreeMap<String, String> },

    /// Final step; present exactly once, always last.
    Terminate { content: String, summary: String },

    /// Developer-visible only; excluded from the outward serialized view.
    Debug { content: String },
}

impl AgentStep {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentStep::Prepare { .. } => "prepare",
            AgentStep::Reasoning { .. } => "reasoning",
            AgentStep::Plan { .. } => "plan",
            AgentStep::Tool { .. } => "tool",
            AgentStep::Text { .. } => "text",
            AgentStep::Error { .. } => "error",
            AgentStep::Learning { .. } => "learning",
            AgentStep::Terminate { .. } => "terminate",
            AgentStep::Debug { .. } => "debug",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStep::Terminate { .. })
    }

    /// Single-line rendering used when the trace is shown to the model.
    fn render(&self) -> String {
        match self {
            AgentStep::Prepare { content } => format!("[prepare] {content}"),
            AgentStep::Reasoning { content } => format!("[reasoning] {content}"),
            AgentStep::Plan { content } => format!("[plan] {content}"),
            AgentStep::Tool {
                name,
                args,
                output,
                summary,
            } => {
                let outcome = summary
                    .clone()
                    .unwrap_or_else(|| compact(output, 400));
                format!("[tool:{name}] args={} -> {outcome}", compact(args, 200))
            }
            AgentStep::Text { content } => format!("[text] {content}"),
            AgentStep::Error { reason } => format!("[error] {reason}"),
            AgentStep::Learning { delta } => {
                format!("[learning] {} memory key(s) updated", delta.len())
            }
            AgentStep::Terminate { content, .. } => format!("[terminate] {content}"),
            AgentStep::Debug { content } => format!("[debug] {content}"),
        }
    }
}

fn compact(value: &serde_json::Value, max_chars: usize) -> String {
    let s = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.chars().count() <= max_chars {
        s
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

/// Ordered, append-only trace with a serialized size bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStepTrace {
    steps: Vec<AgentStep>,
    /// Number of earlier steps collapsed away to honor [`MAX_TRACE_STEPS`].
    #[serde(default)]
    collapsed: usize,
    #[serde(skip)]
    frozen: bool,
}

impl AgentStepTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Appends to a frozen trace are dropped with a warning;
    /// the pipeline owns the trace until it returns, so this only fires on
    /// a programming error.
    pub fn push(&mut self, step: AgentStep) {
        if self.frozen {
            tracing::warn!(kind = step.kind(), "dropping append to frozen trace");
            return;
        }
        if self.steps.len() >= MAX_TRACE_STEPS {
            self.collapse_oldest();
        }
        self.steps.push(step);
    }

    /// Collapse the oldest half of the trace into a single summary step.
    fn collapse_oldest(&mut self) {
        let take = self.steps.len() / 2;
        if take == 0 {
            return;
        }
        let removed: Vec<AgentStep> = self.steps.drain(..take).collect();
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for step in &removed {
            *counts.entry(step.kind()).or_default() += 1;
        }
        let breakdown = counts
            .iter()
            .map(|(k, n)| format!("{n} {k}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.collapsed += removed.len();
        self.steps.insert(
            0,
            AgentStep::Text {
                content: format!(
                    "[{} earlier steps collapsed: {breakdown}]",
                    removed.len()
                ),
            },
        );
    }

    /// Freeze the trace; no further appends are accepted.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn collapsed(&self) -> usize {
        self.collapsed
    }

    pub fn last(&self) -> Option<&AgentStep> {
        self.steps.last()
    }

    /// True when the trace ends with its single `terminate` step.
    pub fn has_terminal(&self) -> bool {
        let terminals = self.steps.iter().filter(|s| s.is_terminal()).count();
        terminals == 1 && self.steps.last().is_some_and(|s| s.is_terminal())
    }

    pub fn tool_step_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, AgentStep::Tool { .. }))
            .count()
    }

    /// Content of the terminate step, or the last text step as fallback.
    pub fn final_output(&self) -> Option<&str> {
        for step in self.steps.iter().rev() {
            match step {
                AgentStep::Terminate { content, .. } => return Some(content),
                AgentStep::Text { content } => return Some(content),
                _ => {}
            }
        }
        None
    }

    /// Latest tool output rendered as a string (self-check target).
    pub fn last_tool_output(&self) -> Option<String> {
        self.steps.iter().rev().find_map(|s| match s {
            AgentStep::Tool { output, .. } => Some(match output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        })
    }

    /// Outward view handed to persistence: `debug` steps removed.
    pub fn outward_steps(&self) -> Vec<AgentStep> {
        self.steps
            .iter()
            .filter(|s| !matches!(s, AgentStep::Debug { .. }))
            .cloned()
            .collect()
    }

    /// Structured-text rendering shown to the model by the strategy
    /// selector. Debug steps are included; the model may use them.
    pub fn render_text(&self) -> String {
        if self.steps.is_empty() {
            return "(no steps yet)".to_string();
        }
        let mut out = String::new();
        if self.collapsed > 0 {
            out.push_str(&format!("({} earlier steps collapsed)\n", self.collapsed));
        }
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step.render()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_step(i: usize) -> AgentStep {
        AgentStep::Text {
            content: format!("step {i}"),
        }
    }

    #[test]
    fn append_preserves_order() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Reasoning {
            content: "think".into(),
        });
        trace.push(text_step(1));
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.steps()[0].kind(), "reasoning");
        assert_eq!(trace.steps()[1].kind(), "text");
    }

    #[test]
    fn frozen_trace_drops_appends() {
        let mut trace = AgentStepTrace::new();
        trace.push(text_step(1));
        trace.freeze();
        trace.push(text_step(2));
        assert_eq!(trace.len(), 1);
        assert!(trace.is_frozen());
    }

    #[test]
    fn terminal_invariant() {
        let mut trace = AgentStepTrace::new();
        trace.push(text_step(1));
        assert!(!trace.has_terminal());

        trace.push(AgentStep::Terminate {
            content: "done".into(),
            summary: "done".into(),
        });
        assert!(trace.has_terminal());
    }

    #[test]
    fn terminal_must_be_last() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Terminate {
            content: "done".into(),
            summary: "done".into(),
        });
        trace.push(text_step(1));
        assert!(!trace.has_terminal());
    }

    #[test]
    fn final_output_prefers_terminate() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Text {
            content: "draft".into(),
        });
        trace.push(AgentStep::Terminate {
            content: "final".into(),
            summary: "s".into(),
        });
        assert_eq!(trace.final_output(), Some("final"));
    }

    #[test]
    fn final_output_falls_back_to_text() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Text {
            content: "only text".into(),
        });
        assert_eq!(trace.final_output(), Some("only text"));
    }

    #[test]
    fn last_tool_output_renders_strings_bare() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Tool {
            name: "search".into(),
            args: json!({}),
            output: json!("result 42"),
            summary: None,
        });
        assert_eq!(trace.last_tool_output(), Some("result 42".into()));
    }

    #[test]
    fn outward_view_excludes_debug() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Debug {
            content: "internal".into(),
        });
        trace.push(text_step(1));
        let outward = trace.outward_steps();
        assert_eq!(outward.len(), 1);
        assert_eq!(outward[0].kind(), "text");
    }

    #[test]
    fn collapse_bounds_trace_size() {
        let mut trace = AgentStepTrace::new();
        for i in 0..(MAX_TRACE_STEPS + 50) {
            trace.push(text_step(i));
        }
        assert!(trace.len() <= MAX_TRACE_STEPS + 1);
        assert!(trace.collapsed() > 0);
        // The collapse marker sits at the front.
        match &trace.steps()[0] {
            AgentStep::Text { content } => assert!(content.contains("collapsed")),
            other => panic!("expected collapse marker, got {other:?}"),
        }
    }

    #[test]
    fn tool_step_serializes_with_return_key() {
        let step = AgentStep::Tool {
            name: "todo_write".into(),
            args: json!({"item": "milk"}),
            output: json!({"ok": true}),
            summary: Some("wrote one item".into()),
        };
        let v = serde_json::to_value(&step).unwrap();
        assert_eq!(v["type"], "tool");
        assert_eq!(v["return"]["ok"], true);
    }

    #[test]
    fn serde_round_trip_is_stable() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Reasoning {
            content: "r".into(),
        });
        trace.push(AgentStep::Tool {
            name: "t".into(),
            args: json!({"k": 1}),
            output: json!([1, 2]),
            summary: None,
        });
        trace.push(AgentStep::Learning {
            delta: BTreeMap::from([("seen".to_string(), "yes".to_string())]),
        });
        trace.push(AgentStep::Terminate {
            content: "c".into(),
            summary: "s".into(),
        });

        let json = serde_json::to_string(&trace).unwrap();
        let back: AgentStepTrace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trace);

        let json2 = serde_json::to_string(&back).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn render_text_numbers_steps() {
        let mut trace = AgentStepTrace::new();
        trace.push(AgentStep::Reasoning {
            content: "first".into(),
        });
        trace.push(text_step(2));
        let rendered = trace.render_text();
        assert!(rendered.starts_with("1. [reasoning] first"));
        assert!(rendered.contains("2. [text]"));
    }
}
