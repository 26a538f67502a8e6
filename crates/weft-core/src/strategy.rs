//! Strategy selector: asks the model which action a node should take next.
//!
//! One selector call per multi-step round. The decision comes back as
//! strict JSON; anything unparseable or out of contract degrades to an
//! `Error` decision so the loop can recover on the next round.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::ai::{AiClient, ChatMessage, CompletionRequest, CompletionResult};
use crate::error::{Result, WeftError};
use crate::spending::{SpendCheck, SpendingTracker};
use crate::tools::ToolSet;
use crate::trace::AgentStepTrace;

/// Leading line of every selector system prompt. The simulated client
/// keys off it to answer with a well-formed terminate decision.
pub const DECISION_PROMPT_HEADER: &str = "Decide the next action for this agent.";

/// Identity context the selector derives its system prompt from.
#[derive(Debug, Clone)]
pub struct IdentityPrompt {
    pub node_id: String,
    pub system_prompt: String,
    pub main_goal: String,
    pub memory: BTreeMap<String, String>,
}

/// Everything one selection round needs.
pub struct SelectorInput<'a> {
    pub invocation_id: Uuid,
    pub model_id: &'a str,
    pub identity: &'a IdentityPrompt,
    pub trace: &'a AgentStepTrace,
    pub rounds_left: u32,
    pub tools: &'a ToolSet,
}

/// The selector's decision for the round.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyDecision {
    Terminate {
        reasoning: String,
    },
    CallTool {
        tool_name: String,
        plan: String,
        /// Keywords/numbers expected in the tool output (self-check).
        check: String,
        expects_mutation: bool,
        reasoning: String,
    },
    Error {
        reasoning: String,
    },
}

/// Decision plus bookkeeping for the caller.
#[derive(Debug, Clone)]
pub struct SelectorOutcome {
    pub decision: StrategyDecision,
    pub usd_cost: f64,
    /// Full prompt sent, kept for auditability.
    pub debug_prompt: String,
}

/// Wire shape of the model's JSON answer.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum RawDecision {
    Terminate {
        reasoning: String,
    },
    CallTool {
        tool_name: String,
        #[serde(default)]
        plan: String,
        #[serde(default)]
        check: String,
        #[serde(default)]
        expects_mutation: bool,
        #[serde(default)]
        reasoning: String,
    },
    Error {
        reasoning: String,
    },
}

pub struct StrategySelector {
    ai: Arc<dyn AiClient>,
    spending: Arc<dyn SpendingTracker>,
}

impl StrategySelector {
    pub fn new(ai: Arc<dyn AiClient>, spending: Arc<dyn SpendingTracker>) -> Self {
        Self { ai, spending }
    }

    /// Run one selection round.
    ///
    /// Errors only on spending exceedance or provider-connectivity
    /// faults; model-level failures come back as `Error` decisions.
    pub async fn select(&self, input: SelectorInput<'_>) -> Result<SelectorOutcome> {
        if let SpendCheck::Exceeded { limit, total } = self.spending.check(input.invocation_id) {
            return Err(WeftError::SpendingExceeded { limit, total });
        }

        let system = self.build_system_prompt(&input);
        let trace_text = input.trace.render_text();
        let debug_prompt = format!("{system}\n--- trace ---\n{trace_text}");

        let request = CompletionRequest::text(
            input.model_id,
            vec![
                ChatMessage::system(system),
                ChatMessage::user(trace_text),
            ],
        );

        let result = self.ai.complete(request).await?;
        let usd_cost = result.usd_cost();
        self.spending.add_cost(input.invocation_id, usd_cost);

        let decision = match result {
            CompletionResult::Completed(completion) => {
                let content = completion.content.unwrap_or_default();
                self.parse_decision(&content, input.tools)
            }
            CompletionResult::Failed(failure) => StrategyDecision::Error {
                reasoning: format!("selection call failed: {}", failure.error_message),
            },
        };

        Ok(SelectorOutcome {
            decision,
            usd_cost,
            debug_prompt,
        })
    }

    fn build_system_prompt(&self, input: &SelectorInput<'_>) -> String {
        let mut prompt = String::new();
        prompt.push_str(DECISION_PROMPT_HEADER);
        prompt.push_str("\n\n");
        prompt.push_str(&format!("You are node '{}'.\n", input.identity.node_id));
        prompt.push_str(&format!("Role: {}\n", input.identity.system_prompt));
        prompt.push_str(&format!("Workflow goal: {}\n", input.identity.main_goal));

        if input.identity.memory.is_empty() {
            prompt.push_str("Memory: (empty)\n");
        } else {
            prompt.push_str("Memory:\n");
            for (key, value) in &input.identity.memory {
                prompt.push_str(&format!("  {key}: {value}\n"));
            }
        }

        prompt.push_str(&format!("\nRounds left: {}\n", input.rounds_left));
        if input.rounds_left == 1 {
            prompt.push_str(
                "This is the final round: terminate unless one more tool call clearly advances the goal.\n",
            );
        }

        prompt.push_str("\nAvailable tools:\n");
        for spec in input.tools.specs() {
            prompt.push_str(&format!(
                "- {}: {} (parameters: {})\n",
                spec.name, spec.description, spec.parameters
            ));
        }

        prompt.push_str(
            "\nAnswer with a single JSON object, nothing else. One of:\n\
             {\"action\": \"call_tool\", \"tool_name\": \"<name>\", \"plan\": \"<short plan>\", \
             \"check\": \"<keywords or numbers expected in the tool output>\", \
             \"expects_mutation\": <bool>, \"reasoning\": \"<why>\"}\n\
             {\"action\": \"terminate\", \"reasoning\": \"<why the goal is met or unreachable>\"}\n\
             {\"action\": \"error\", \"reasoning\": \"<what is wrong>\"}\n",
        );

        prompt
    }

    /// Parse the model's answer, enforcing the tool-membership contract.
    fn parse_decision(&self, content: &str, tools: &ToolSet) -> StrategyDecision {
        let json = extract_json_object(content);
        let raw: RawDecision = match serde_json::from_str(json) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "selector answer was not valid decision json");
                return StrategyDecision::Error {
                    reasoning: format!("unparseable decision: {e}"),
                };
            }
        };

        match raw {
            RawDecision::Terminate { reasoning } => StrategyDecision::Terminate { reasoning },
            RawDecision::Error { reasoning } => StrategyDecision::Error { reasoning },
            RawDecision::CallTool {
                tool_name,
                plan,
                check,
                expects_mutation,
                reasoning,
            } => {
                if !tools.contains(&tool_name) {
                    warn!(tool = %tool_name, "selector picked a tool outside the provided set");
                    return StrategyDecision::Error {
                        reasoning: format!("tool '{tool_name}' is not available to this node"),
                    };
                }
                StrategyDecision::CallTool {
                    tool_name,
                    plan,
                    check,
                    expects_mutation,
                    reasoning,
                }
            }
        }
    }
}

/// Strip code fences and surrounding prose; keep the outermost object.
pub(crate) fn extract_json_object(content: &str) -> &str {
    let start = content.find('{');
    let end = content.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &content[s..=e],
        _ => content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Completion, ScriptedClient};
    use crate::spending::CostLedger;
    use crate::tools::{Tool, ToolContext, ToolError, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoopTool(&'static str);

    #[async_trait]
    impl Tool for NoopTool {
        fn name(&self) -> &str {
            self.0
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        async fn call(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            Ok(json!(null))
        }
    }

    async fn tool_set(names: &[&'static str]) -> ToolSet {
        let mut registry = ToolRegistry::new();
        for name in names {
            registry.register_code(Arc::new(NoopTool(name)));
        }
        let ctx = ToolContext {
            workflow_invocation_id: Uuid::new_v4(),
            workflow_version_id: "v1".into(),
            node_id: "n".into(),
            main_goal: "g".into(),
            files: vec![],
        };
        let code: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        registry.resolve(&code, &[], &ctx).await.unwrap()
    }

    fn identity() -> IdentityPrompt {
        IdentityPrompt {
            node_id: "worker".into(),
            system_prompt: "Do the work.".into(),
            main_goal: "finish the task".into(),
            memory: BTreeMap::new(),
        }
    }

    fn selector(script: Vec<CompletionResult>) -> (StrategySelector, Arc<ScriptedClient>) {
        let ai = Arc::new(ScriptedClient::new(script));
        let spending = Arc::new(CostLedger::new(10.0));
        (
            StrategySelector::new(Arc::clone(&ai) as Arc<dyn AiClient>, spending),
            ai,
        )
    }

    #[tokio::test]
    async fn parses_call_tool_decision() {
        let answer = json!({
            "action": "call_tool",
            "tool_name": "todo_write",
            "plan": "write the first item",
            "check": "written 1",
            "expects_mutation": true,
            "reasoning": "nothing stored yet"
        })
        .to_string();
        let (selector, _ai) =
            selector(vec![CompletionResult::Completed(Completion::text(answer, 0.002))]);

        let tools = tool_set(&["todo_write"]).await;
        let trace = AgentStepTrace::new();
        let outcome = selector
            .select(SelectorInput {
                invocation_id: Uuid::new_v4(),
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 3,
                tools: &tools,
            })
            .await
            .unwrap();

        match outcome.decision {
            StrategyDecision::CallTool {
                tool_name,
                check,
                expects_mutation,
                ..
            } => {
                assert_eq!(tool_name, "todo_write");
                assert_eq!(check, "written 1");
                assert!(expects_mutation);
            }
            other => panic!("expected call_tool, got {other:?}"),
        }
        assert_eq!(outcome.usd_cost, 0.002);
        assert!(outcome.debug_prompt.contains(DECISION_PROMPT_HEADER));
    }

    #[tokio::test]
    async fn tool_outside_set_becomes_error_decision() {
        let answer = json!({
            "action": "call_tool",
            "tool_name": "rm_rf",
            "reasoning": "hallucinated"
        })
        .to_string();
        let (selector, _ai) =
            selector(vec![CompletionResult::Completed(Completion::text(answer, 0.001))]);

        let tools = tool_set(&["todo_write"]).await;
        let trace = AgentStepTrace::new();
        let outcome = selector
            .select(SelectorInput {
                invocation_id: Uuid::new_v4(),
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 3,
                tools: &tools,
            })
            .await
            .unwrap();

        assert!(matches!(outcome.decision, StrategyDecision::Error { .. }));
    }

    #[tokio::test]
    async fn fenced_json_is_accepted() {
        let answer = "```json\n{\"action\": \"terminate\", \"reasoning\": \"done\"}\n```";
        let (selector, _ai) = selector(vec![CompletionResult::Completed(Completion::text(
            answer, 0.001,
        ))]);

        let tools = tool_set(&[]).await;
        let trace = AgentStepTrace::new();
        let outcome = selector
            .select(SelectorInput {
                invocation_id: Uuid::new_v4(),
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 1,
                tools: &tools,
            })
            .await
            .unwrap();

        assert_eq!(
            outcome.decision,
            StrategyDecision::Terminate {
                reasoning: "done".into()
            }
        );
    }

    #[tokio::test]
    async fn model_failure_becomes_error_decision_with_cost() {
        let (selector, _ai) = selector(vec![CompletionResult::failed("overloaded", 0.0005)]);

        let tools = tool_set(&[]).await;
        let trace = AgentStepTrace::new();
        let outcome = selector
            .select(SelectorInput {
                invocation_id: Uuid::new_v4(),
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 2,
                tools: &tools,
            })
            .await
            .unwrap();

        assert!(matches!(outcome.decision, StrategyDecision::Error { .. }));
        assert_eq!(outcome.usd_cost, 0.0005);
    }

    #[tokio::test]
    async fn spending_exceeded_blocks_selection() {
        let ai = Arc::new(ScriptedClient::new(vec![CompletionResult::Completed(
            Completion::text("{}", 0.0),
        )]));
        let spending = Arc::new(CostLedger::new(0.01));
        let invocation_id = Uuid::new_v4();
        spending.add_cost(invocation_id, 1.0);

        let sel = StrategySelector::new(Arc::clone(&ai) as Arc<dyn AiClient>, spending);
        let tools = tool_set(&[]).await;
        let trace = AgentStepTrace::new();

        let err = sel
            .select(SelectorInput {
                invocation_id,
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 2,
                tools: &tools,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WeftError::SpendingExceeded { .. }));
        // No AI call was issued.
        assert_eq!(ai.requests().len(), 0);
    }

    #[tokio::test]
    async fn final_round_is_flagged_in_prompt() {
        let answer = json!({"action": "terminate", "reasoning": "ok"}).to_string();
        let (selector, ai) =
            selector(vec![CompletionResult::Completed(Completion::text(answer, 0.0))]);

        let tools = tool_set(&[]).await;
        let trace = AgentStepTrace::new();
        selector
            .select(SelectorInput {
                invocation_id: Uuid::new_v4(),
                model_id: "m",
                identity: &identity(),
                trace: &trace,
                rounds_left: 1,
                tools: &tools,
            })
            .await
            .unwrap();

        let system = ai.requests()[0].messages[0].content.clone();
        assert!(system.contains("final round"));
    }
}
