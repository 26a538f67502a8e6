//! Bounded multi-step tool loop (strategies V2 and V3).
//!
//! A plain `for` over `max_rounds`: each round asks the strategy selector
//! for the next action, executes at most one tool call with zero retries,
//! and lets failures become `error` steps the next round can repair. V3
//! adds mutation tracking, the post-hoc self-check, and per-tool
//! summarization on top of the V2 skeleton.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use super::{InvocationPipeline, NodeInvocationInput, Prepared, RunState};
use crate::ai::{CompletionMode, CompletionRequest, CompletionResult, ChatMessage, ToolChoice};
use crate::config::MultiStepStrategy;
use crate::error::Result;
use crate::strategy::{IdentityPrompt, SelectorInput, StrategyDecision};
use crate::trace::AgentStep;

impl InvocationPipeline {
    pub(super) async fn multi_step(
        &self,
        input: &NodeInvocationInput,
        prepared: &Prepared,
        run: &mut RunState,
        strategy: MultiStepStrategy,
    ) -> Result<()> {
        let v3 = strategy == MultiStepStrategy::V3;
        let max_rounds = super::effective_max_steps(
            input.node.max_steps,
            self.config.multi_step_max_rounds_default,
        );

        let identity = IdentityPrompt {
            node_id: input.node.node_id.clone(),
            system_prompt: input.node.system_prompt.clone(),
            main_goal: input.main_goal.clone(),
            memory: input.memory.clone(),
        };
        let ctx = self.tool_context(input);

        for round in 0..max_rounds {
            self.ensure_not_cancelled(&input.cancel)?;

            let outcome = self
                .selector
                .select(SelectorInput {
                    invocation_id: input.invocation_id,
                    model_id: &input.node.model_name,
                    identity: &identity,
                    trace: &run.trace,
                    rounds_left: max_rounds - round,
                    tools: &prepared.toolset,
                })
                .await?;
            run.usd += outcome.usd_cost;
            run.debug_prompts.push(outcome.debug_prompt);

            let (tool_name, plan, check, expects_mutation, reasoning) = match outcome.decision {
                StrategyDecision::Terminate { reasoning } => {
                    run.trace.push(AgentStep::Reasoning { content: reasoning });
                    break;
                }
                StrategyDecision::Error { reasoning } => {
                    run.trace.push(AgentStep::Error { reason: reasoning });
                    continue;
                }
                StrategyDecision::CallTool {
                    tool_name,
                    plan,
                    check,
                    expects_mutation,
                    reasoning,
                } => (tool_name, plan, check, expects_mutation, reasoning),
            };

            let mut rationale = reasoning;
            if !plan.is_empty() {
                rationale.push_str(&format!("\nPlan: {plan}"));
            }
            if v3 && !check.is_empty() {
                rationale.push_str(&format!("\nCheck: {check}"));
            }
            if v3 && expects_mutation {
                rationale.push_str(" [EXPECTS_MUTATION]");
            }
            run.trace.push(AgentStep::Reasoning { content: rationale });

            // One provider call, forced to the selected tool, no repair.
            // Membership was validated by the selector; a miss here means
            // the toolset changed under us, which the loop can survive.
            let Some(spec) = prepared.toolset.spec(&tool_name) else {
                run.trace.push(AgentStep::Error {
                    reason: format!("tool '{tool_name}' vanished from the toolset"),
                });
                continue;
            };
            let request = CompletionRequest {
                model_id: input.node.model_name.clone(),
                messages: vec![
                    ChatMessage::system(input.node.system_prompt.clone()),
                    ChatMessage::user(format!(
                        "{}\n\nCall the tool '{tool_name}' now. Plan: {plan}",
                        prepared.incoming
                    )),
                ],
                mode: CompletionMode::Tool,
                tools: vec![spec],
                tool_choice: ToolChoice::Named(tool_name.clone()),
                max_steps: 1,
                repair: false,
                save_outputs: false,
            };

            let result = self.ai.complete(request).await?;
            let usd = result.usd_cost();
            self.spending.add_cost(input.invocation_id, usd);
            run.usd += usd;

            let completion = match result {
                CompletionResult::Completed(completion) => completion,
                CompletionResult::Failed(failure) => {
                    run.trace.push(AgentStep::Error {
                        reason: format!("ai call failed: {}", failure.error_message),
                    });
                    continue;
                }
            };

            let Some(call) = completion.tool_calls.into_iter().next() else {
                run.trace.push(AgentStep::Error {
                    reason: format!("model produced no call for tool '{tool_name}'"),
                });
                continue;
            };
            if call.name != tool_name {
                run.trace.push(AgentStep::Error {
                    reason: format!(
                        "model called '{}' instead of the selected '{tool_name}'",
                        call.name
                    ),
                });
                continue;
            }

            let Some(tool) = prepared.toolset.get(&tool_name).map(Arc::clone) else {
                run.trace.push(AgentStep::Error {
                    reason: format!("tool '{tool_name}' vanished from the toolset"),
                });
                continue;
            };
            match self
                .call_tool(&tool, call.args.clone(), &ctx, &input.cancel)
                .await?
            {
                Ok(output) => {
                    let summary = if v3 {
                        let rendered = match &output {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        match self
                            .summarize(input.invocation_id, &input.node.model_name, &rendered)
                            .await
                        {
                            Some((summary, usd)) => {
                                run.usd += usd;
                                Some(summary)
                            }
                            None => None,
                        }
                    } else {
                        None
                    };

                    run.trace.push(AgentStep::Tool {
                        name: call.name,
                        args: call.args,
                        output,
                        summary,
                    });

                    // Self-check: no automatic retry; the next round's
                    // selector may repair.
                    if v3 && !check.is_empty() {
                        let latest = run.trace.last_tool_output().unwrap_or_default();
                        if !self_check_passes(&check, &latest) {
                            run.trace.push(AgentStep::Error {
                                reason: format!(
                                    "Self-check failed: none of the expected tokens from '{check}' found in tool output"
                                ),
                            });
                        }
                    }
                }
                Err(err) => {
                    run.trace.push(AgentStep::Error {
                        reason: format!("tool '{tool_name}' failed: {err}"),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Keywords and numeric tokens extracted from a `check` string.
fn check_tokens(check: &str) -> Vec<String> {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN_RE.get_or_init(|| {
        Regex::new(r"\d+(?:\.\d+)?|[A-Za-z_][A-Za-z0-9_-]{2,}").expect("static regex")
    });
    re.find_iter(check)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// The check passes when any extracted token appears in the output.
/// An empty/unextractable check passes trivially.
fn self_check_passes(check: &str, output: &str) -> bool {
    let tokens = check_tokens(check);
    if tokens.is_empty() {
        return true;
    }
    let haystack = output.to_lowercase();
    tokens.iter().any(|t| haystack.contains(t.as_str()))
}
