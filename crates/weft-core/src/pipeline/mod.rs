//! Node invocation pipeline: prepare → execute → process.
//!
//! One pipeline run is a small interpreter around a single node: it picks
//! an execution strategy, drives the bounded tool loop, derives learnings,
//! resolves the handoff, and always returns a result — internal failures
//! are caught once and transformed into an error result carrying the
//! partially built trace.

mod learning;
mod multi_step;

pub use learning::LEARNING_PROMPT_HEADER;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::ai::{
    AiClient, ChatMessage, CompletionMode, CompletionRequest, CompletionResult, ToolChoice,
};
use crate::config::{CoordinationType, HandoffContentMode, MultiStepStrategy, PipelineConfig,
    HARD_STEP_CAP,
};
use crate::dsl::NodeConfig;
use crate::error::{Result, WeftError};
use crate::executor::CancelToken;
use crate::handoff::{HandoffDecision, HandoffReply, HandoffResolver};
use crate::payload::Payload;
use crate::spending::{SpendCheck, SpendingTracker};
use crate::strategy::StrategySelector;
use crate::tools::{Tool, ToolContext, ToolError, ToolRegistry, ToolSet};
use crate::trace::{AgentStep, AgentStepTrace};

/// Effective step/round bound for one node invocation.
///
/// A value of 0 is valid and causes immediate termination with no tool
/// calls.
pub fn effective_max_steps(node_max: Option<u32>, global_default: u32) -> u32 {
    node_max.unwrap_or(global_default).min(HARD_STEP_CAP)
}

/// How the node invocation will be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    SingleCall,
    MultiStep(MultiStepStrategy),
    DirectSdk,
}

/// Everything one node invocation needs, assembled by the executor.
#[derive(Debug, Clone)]
pub struct NodeInvocationInput {
    pub invocation_id: Uuid,
    pub version_id: String,
    pub node: NodeConfig,
    pub node_version_id: Uuid,
    /// Memory snapshot from the latest node version.
    pub memory: BTreeMap<String, String>,
    pub payload: Payload,
    pub main_goal: String,
    pub files: Vec<String>,
    pub attempt_no: u32,
    pub cancel: CancelToken,
}

/// Outcome of one node invocation. Never an `Err`: failures surface as
/// `error` plus whatever trace was built before the failure.
#[derive(Debug, Clone)]
pub struct NodeInvocationResult {
    pub node_id: String,
    pub final_output: String,
    pub summary: String,
    pub next_ids: Vec<String>,
    pub replies: Vec<HandoffReply>,
    /// Total accumulated cost including handoff selection and validation.
    pub usd_cost: f64,
    /// Frozen trace, terminate step included.
    pub trace: AgentStepTrace,
    /// Proposed memory delta; the executor commits it.
    pub updated_memory: Option<BTreeMap<String, String>>,
    pub debug_prompts: Vec<String>,
    pub error: Option<String>,
}

impl NodeInvocationResult {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Short summary prefixed with the node id.
    pub fn summary_with_info(&self) -> String {
        format!("[{}] {}", self.node_id, self.summary)
    }
}

/// Mutable state threaded through one pipeline run.
struct RunState {
    trace: AgentStepTrace,
    usd: f64,
    debug_prompts: Vec<String>,
    updated_memory: Option<BTreeMap<String, String>>,
    error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            trace: AgentStepTrace::new(),
            usd: 0.0,
            debug_prompts: Vec::new(),
            updated_memory: None,
            error: None,
        }
    }
}

/// Output of the prepare phase.
struct Prepared {
    toolset: ToolSet,
    incoming: String,
    strategy: ExecutionStrategy,
    tool_choice: ToolChoice,
}

pub struct InvocationPipeline {
    ai: Arc<dyn AiClient>,
    tools: Arc<ToolRegistry>,
    spending: Arc<dyn SpendingTracker>,
    selector: StrategySelector,
    handoff: HandoffResolver,
    config: PipelineConfig,
    cancel_grace: Duration,
}

impl InvocationPipeline {
    pub fn new(
        ai: Arc<dyn AiClient>,
        tools: Arc<ToolRegistry>,
        spending: Arc<dyn SpendingTracker>,
        config: PipelineConfig,
        content_mode: HandoffContentMode,
        coordination: CoordinationType,
        cancel_grace: Duration,
    ) -> Self {
        let selector = StrategySelector::new(Arc::clone(&ai), Arc::clone(&spending));
        let handoff = HandoffResolver::new(
            Arc::clone(&ai),
            Arc::clone(&spending),
            content_mode,
            coordination,
        );
        Self {
            ai,
            tools,
            spending,
            selector,
            handoff,
            config,
            cancel_grace,
        }
    }

    /// Run one node invocation to a result.
    pub async fn run(&self, input: NodeInvocationInput) -> NodeInvocationResult {
        let mut run = RunState::new();

        let prepared = match self.prepare(&input, &mut run).await {
            Ok(prepared) => Some(prepared),
            Err(err) => {
                self.absorb(&mut run, err);
                None
            }
        };

        if let Some(prepared) = &prepared {
            debug!(
                node_id = %input.node.node_id,
                strategy = ?prepared.strategy,
                tools = prepared.toolset.len(),
                "executing node invocation"
            );
            if let Err(err) = self.execute(&input, prepared, &mut run).await {
                self.absorb(&mut run, err);
            }
        }

        self.finalize(&input, &mut run).await;

        let (next_ids, replies) = self.process(&input, &mut run).await;

        let final_output = run.trace.final_output().unwrap_or_default().to_string();
        let summary = match run.trace.last() {
            Some(AgentStep::Terminate { summary, .. }) => summary.clone(),
            _ => String::new(),
        };

        run.trace.freeze();

        NodeInvocationResult {
            node_id: input.node.node_id.clone(),
            final_output,
            summary,
            next_ids,
            replies,
            usd_cost: run.usd,
            trace: run.trace,
            updated_memory: run.updated_memory,
            debug_prompts: run.debug_prompts,
            error: run.error,
        }
    }

    // -----------------------------------------------------------------
    // Phase 1: prepare
    // -----------------------------------------------------------------

    async fn prepare(&self, input: &NodeInvocationInput, run: &mut RunState) -> Result<Prepared> {
        let ctx = self.tool_context(input);
        let toolset = self
            .tools
            .resolve(&input.node.code_tools, &input.node.mcp_tools, &ctx)
            .await?;

        let mut incoming = input.payload.joined_text();
        if !input.memory.is_empty() {
            incoming.push_str("\n\nMemory:\n");
            for (key, value) in &input.memory {
                incoming.push_str(&format!("  {key}: {value}\n"));
            }
        }

        let strategy = if input.node.use_direct_sdk {
            ExecutionStrategy::DirectSdk
        } else if self.config.multi_step_enabled && !toolset.is_empty() {
            ExecutionStrategy::MultiStep(self.config.multi_step_strategy)
        } else {
            ExecutionStrategy::SingleCall
        };

        let tool_choice = if toolset.len() == 1 {
            ToolChoice::Required
        } else {
            ToolChoice::Auto
        };

        run.trace.push(AgentStep::Prepare {
            content: incoming.clone(),
        });

        Ok(Prepared {
            toolset,
            incoming,
            strategy,
            tool_choice,
        })
    }

    fn tool_context(&self, input: &NodeInvocationInput) -> ToolContext {
        ToolContext {
            workflow_invocation_id: input.invocation_id,
            workflow_version_id: input.version_id.clone(),
            node_id: input.node.node_id.clone(),
            main_goal: input.main_goal.clone(),
            files: input.files.clone(),
        }
    }

    // -----------------------------------------------------------------
    // Phase 2: execute
    // -----------------------------------------------------------------

    async fn execute(
        &self,
        input: &NodeInvocationInput,
        prepared: &Prepared,
        run: &mut RunState,
    ) -> Result<()> {
        match prepared.strategy {
            ExecutionStrategy::SingleCall => self.single_call(input, prepared, run).await,
            ExecutionStrategy::MultiStep(strategy) => {
                self.multi_step(input, prepared, run, strategy).await
            }
            ExecutionStrategy::DirectSdk => self.direct_sdk(input, prepared, run).await,
        }
    }

    async fn single_call(
        &self,
        input: &NodeInvocationInput,
        prepared: &Prepared,
        run: &mut RunState,
    ) -> Result<()> {
        self.ensure_spend_ok(input.invocation_id)?;
        self.ensure_not_cancelled(&input.cancel)?;

        let mut max_steps = effective_max_steps(
            input.node.max_steps,
            self.config.single_call_max_steps_default,
        );
        if prepared.tool_choice == ToolChoice::Required {
            max_steps = max_steps.min(1);
        }
        if max_steps == 0 {
            return Ok(());
        }

        let mode = if prepared.toolset.is_empty() {
            CompletionMode::Text
        } else {
            CompletionMode::Tool
        };
        let request = CompletionRequest {
            model_id: input.node.model_name.clone(),
            messages: vec![
                ChatMessage::system(input.node.system_prompt.clone()),
                ChatMessage::user(prepared.incoming.clone()),
            ],
            mode,
            tools: prepared.toolset.specs(),
            tool_choice: prepared.tool_choice.clone(),
            max_steps,
            repair: false,
            save_outputs: false,
        };

        let result = self.ai.complete(request).await?;
        let usd = result.usd_cost();
        self.spending.add_cost(input.invocation_id, usd);
        run.usd += usd;

        match result {
            CompletionResult::Completed(completion) => {
                if let Some(content) = completion.content {
                    if !content.is_empty() {
                        run.trace.push(AgentStep::Text { content });
                    }
                }
                let ctx = self.tool_context(input);
                for call in completion.tool_calls.into_iter().take(max_steps as usize) {
                    let Some(tool) = prepared.toolset.get(&call.name) else {
                        run.trace.push(AgentStep::Error {
                            reason: format!("model called unknown tool '{}'", call.name),
                        });
                        continue;
                    };
                    let tool = Arc::clone(tool);
                    match self.call_tool(&tool, call.args.clone(), &ctx, &input.cancel).await? {
                        Ok(output) => run.trace.push(AgentStep::Tool {
                            name: call.name,
                            args: call.args,
                            output,
                            summary: None,
                        }),
                        Err(err) => run.trace.push(AgentStep::Error {
                            reason: format!("tool '{}' failed: {err}", call.name),
                        }),
                    }
                }
            }
            CompletionResult::Failed(failure) => {
                // A failed single call terminates the invocation; the
                // synthesized error terminate is added by finalize.
                run.trace.push(AgentStep::Error {
                    reason: format!("ai call failed: {}", failure.error_message),
                });
                run.error = Some("ai_provider_error".into());
            }
        }

        Ok(())
    }

    async fn direct_sdk(
        &self,
        input: &NodeInvocationInput,
        prepared: &Prepared,
        run: &mut RunState,
    ) -> Result<()> {
        self.ensure_spend_ok(input.invocation_id)?;
        self.ensure_not_cancelled(&input.cancel)?;

        // The SDK adapter takes one combined prompt; no multi-step here.
        let prompt = format!("{}\n\n{}", input.node.system_prompt, prepared.incoming);
        let mut request =
            CompletionRequest::text(input.node.model_name.clone(), vec![ChatMessage::user(prompt)]);
        request.save_outputs = true;

        let result = self.ai.complete(request).await?;
        let usd = result.usd_cost();
        self.spending.add_sdk_cost(input.invocation_id, usd);
        run.usd += usd;

        match result {
            CompletionResult::Completed(completion) => {
                if let Some(content) = completion.content {
                    run.trace.push(AgentStep::Text { content });
                }
            }
            CompletionResult::Failed(failure) => {
                run.trace.push(AgentStep::Error {
                    reason: format!("sdk call failed: {}", failure.error_message),
                });
                run.error = Some("ai_provider_error".into());
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Phase 3: process
    // -----------------------------------------------------------------

    /// Resolve the handoff for a successful run. Failed runs emit nothing:
    /// the executor terminates the workflow invocation instead.
    async fn process(
        &self,
        input: &NodeInvocationInput,
        run: &mut RunState,
    ) -> (Vec<String>, Vec<HandoffReply>) {
        if run.error.is_some() {
            return (Vec::new(), Vec::new());
        }

        let final_output = run.trace.final_output().unwrap_or_default().to_string();
        let decision: HandoffDecision = match self
            .handoff
            .resolve(
                input.invocation_id,
                &input.node.model_name,
                &input.node,
                &final_output,
            )
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(node_id = %input.node.node_id, error = %err, "handoff resolution failed");
                run.error = Some("handoff_failed".into());
                return (Vec::new(), Vec::new());
            }
        };

        run.usd += decision.usd_cost;
        if let Some(prompt) = decision.debug_prompt {
            run.debug_prompts.push(prompt);
        }
        (decision.next_ids, decision.replies)
    }

    // -----------------------------------------------------------------
    // Learning, terminate synthesis, shared plumbing
    // -----------------------------------------------------------------

    /// Run learning (AI budget permitting) and guarantee the single
    /// trailing terminate step.
    async fn finalize(&self, input: &NodeInvocationInput, run: &mut RunState) {
        if run.trace.has_terminal() {
            return;
        }

        let ai_usable = run.error.is_none()
            && !input.cancel.is_cancelled()
            && !self.spending.check(input.invocation_id).is_exceeded();

        if ai_usable {
            match learning::derive_memory_update(
                self.ai.as_ref(),
                self.spending.as_ref(),
                input,
                &run.trace,
            )
            .await
            {
                learning::LearningOutcome::Updated { memory, usd_cost } => {
                    run.usd += usd_cost;
                    run.trace.push(AgentStep::Learning {
                        delta: memory.clone(),
                    });
                    run.updated_memory = Some(memory);
                }
                learning::LearningOutcome::Unchanged { usd_cost } => {
                    run.usd += usd_cost;
                }
                learning::LearningOutcome::Failed { reason, usd_cost } => {
                    run.usd += usd_cost;
                    run.trace.push(AgentStep::Error {
                        reason: format!("learning failed: {reason}"),
                    });
                }
            }
        }

        let content = terminate_content(&run.trace, &run.error);
        let summary = if ai_usable {
            match self
                .summarize(
                    input.invocation_id,
                    &input.node.model_name,
                    &content,
                )
                .await
            {
                Some((summary, usd)) => {
                    run.usd += usd;
                    summary
                }
                None => local_summary(&content),
            }
        } else {
            local_summary(&content)
        };

        run.trace.push(AgentStep::Terminate { content, summary });
    }

    /// 2-retry-bounded short summary of `text`.
    async fn summarize(
        &self,
        invocation_id: Uuid,
        model_id: &str,
        text: &str,
    ) -> Option<(String, f64)> {
        const MAX_RETRIES: u32 = 2;
        let mut usd_total = 0.0;

        for _attempt in 0..=MAX_RETRIES {
            if self.spending.check(invocation_id).is_exceeded() {
                break;
            }
            let request = CompletionRequest::text(
                model_id,
                vec![
                    ChatMessage::system("Summarize the following in one short sentence."),
                    ChatMessage::user(text.to_string()),
                ],
            );
            match self.ai.complete(request).await {
                Ok(result) => {
                    let usd = result.usd_cost();
                    self.spending.add_cost(invocation_id, usd);
                    usd_total += usd;
                    if let CompletionResult::Completed(completion) = result {
                        if let Some(content) = completion.content {
                            let trimmed = content.trim().to_string();
                            if !trimmed.is_empty() {
                                return Some((trimmed, usd_total));
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "summarization call failed");
                    break;
                }
            }
        }
        None
    }

    /// Execute one tool call, observing cancellation with a grace window.
    ///
    /// A call already in flight when the token fires may finish within
    /// the grace window and keep its result; otherwise it is discarded.
    async fn call_tool(
        &self,
        tool: &Arc<dyn Tool>,
        args: serde_json::Value,
        ctx: &ToolContext,
        cancel: &CancelToken,
    ) -> Result<std::result::Result<serde_json::Value, ToolError>> {
        self.ensure_not_cancelled(cancel)?;

        let fut = tool.call(args, ctx);
        tokio::pin!(fut);
        tokio::select! {
            out = &mut fut => Ok(out),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.cancel_grace, &mut fut).await {
                    Ok(out) => Ok(out),
                    Err(_) => Err(WeftError::Cancelled(
                        "tool call discarded after cancellation grace window".into(),
                    )),
                }
            }
        }
    }

    fn ensure_spend_ok(&self, invocation_id: Uuid) -> Result<()> {
        match self.spending.check(invocation_id) {
            SpendCheck::Ok => Ok(()),
            SpendCheck::Exceeded { limit, total } => {
                Err(WeftError::SpendingExceeded { limit, total })
            }
        }
    }

    fn ensure_not_cancelled(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(WeftError::Cancelled("invocation cancelled".into()))
        } else {
            Ok(())
        }
    }

    /// Catch-once: transform an internal error into trace + error reason.
    fn absorb(&self, run: &mut RunState, err: WeftError) {
        let reason = match &err {
            WeftError::SpendingExceeded { .. } => "spending_exceeded",
            WeftError::Cancelled(_) => "cancelled",
            WeftError::AiProvider(_) => "ai_provider_error",
            WeftError::Tool(_) => "tool_error",
            WeftError::Validation(_) => "validation_error",
            _ => "internal_error",
        };
        run.trace.push(AgentStep::Error {
            reason: err.to_string(),
        });
        if run.error.is_none() {
            run.error = Some(reason.to_string());
        }
    }
}

/// Content for a synthesized terminate step: the last meaningful output,
/// or the error reason when nothing was produced.
fn terminate_content(trace: &AgentStepTrace, error: &Option<String>) -> String {
    for step in trace.steps().iter().rev() {
        match step {
            AgentStep::Text { content } => return content.clone(),
            AgentStep::Tool {
                summary: Some(summary),
                ..
            } => return summary.clone(),
            AgentStep::Tool { output, .. } => {
                return match output {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }
            }
            AgentStep::Reasoning { content } => return content.clone(),
            _ => {}
        }
    }
    match error {
        Some(reason) => format!("no output ({reason})"),
        None => String::new(),
    }
}

/// Local fallback summary when the AI is unavailable.
fn local_summary(content: &str) -> String {
    if content.is_empty() {
        return "(no output)".to_string();
    }
    let mut summary: String = content.chars().take(120).collect();
    if content.chars().count() > 120 {
        summary.push('…');
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Completion, ScriptedClient, SimulatedClient};
    use crate::spending::CostLedger;
    use serde_json::json;

    fn node(overrides: serde_json::Value) -> NodeConfig {
        let mut base = json!({
            "node_id": "echo",
            "system_prompt": "Echo the input.",
            "model_name": "m",
            "hand_offs": ["end"]
        });
        base.as_object_mut()
            .unwrap()
            .extend(overrides.as_object().cloned().unwrap_or_default());
        serde_json::from_value(base).unwrap()
    }

    fn pipeline(ai: Arc<dyn AiClient>, cap: f64) -> (InvocationPipeline, Arc<CostLedger>) {
        let spending = Arc::new(CostLedger::new(cap));
        let pipeline = InvocationPipeline::new(
            ai,
            Arc::new(ToolRegistry::new()),
            Arc::clone(&spending) as Arc<dyn SpendingTracker>,
            PipelineConfig::default(),
            HandoffContentMode::Full,
            CoordinationType::Sequential,
            Duration::from_secs(2),
        );
        (pipeline, spending)
    }

    fn input(node: NodeConfig, payload: Payload) -> NodeInvocationInput {
        NodeInvocationInput {
            invocation_id: Uuid::new_v4(),
            version_id: "v1".into(),
            node,
            node_version_id: Uuid::new_v4(),
            memory: BTreeMap::new(),
            payload,
            main_goal: "test goal".into(),
            files: vec![],
            attempt_no: 1,
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn effective_max_steps_clamps_to_hard_cap() {
        assert_eq!(effective_max_steps(None, 6), 6);
        assert_eq!(effective_max_steps(Some(3), 6), 3);
        assert_eq!(effective_max_steps(Some(25), 6), 10);
        assert_eq!(effective_max_steps(None, 25), 10);
        assert_eq!(effective_max_steps(Some(0), 6), 0);
    }

    #[tokio::test]
    async fn single_call_echo_produces_text_then_terminate() {
        let (pipeline, _) = pipeline(Arc::new(SimulatedClient::new()), 10.0);
        let result = pipeline
            .run(input(node(json!({})), Payload::text("hello")))
            .await;

        assert!(result.error.is_none());
        assert!(result.trace.has_terminal());
        assert!(result.final_output.contains("hello"));
        assert_eq!(result.next_ids, vec!["end"]);
        assert!(result.usd_cost > 0.0);

        let kinds: Vec<&str> = result.trace.steps().iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec!["prepare", "text", "terminate"]);
    }

    #[tokio::test]
    async fn zero_max_steps_terminates_without_completion_calls() {
        let ai = Arc::new(ScriptedClient::new(vec![
            // learning, then terminate summary; no completion call happens
            CompletionResult::Completed(Completion::text("{}", 0.001)),
            CompletionResult::Completed(Completion::text("nothing to do", 0.001)),
        ]));
        let (pipeline, _) = pipeline(Arc::clone(&ai) as Arc<dyn AiClient>, 10.0);

        let result = pipeline
            .run(input(
                node(json!({"max_steps": 0})),
                Payload::text("ignored"),
            ))
            .await;

        assert!(result.error.is_none());
        assert!(result.trace.has_terminal());
        assert_eq!(result.trace.tool_step_count(), 0);
        assert_eq!(ai.requests().len(), 2);
    }

    #[tokio::test]
    async fn failed_single_call_synthesizes_error_terminate() {
        let ai = Arc::new(ScriptedClient::new(vec![CompletionResult::failed(
            "model overloaded",
            0.003,
        )]));
        let (pipeline, _) = pipeline(Arc::clone(&ai) as Arc<dyn AiClient>, 10.0);

        let result = pipeline
            .run(input(node(json!({})), Payload::text("hi")))
            .await;

        assert_eq!(result.error.as_deref(), Some("ai_provider_error"));
        assert!(result.trace.has_terminal());
        assert!(result
            .trace
            .steps()
            .iter()
            .any(|s| matches!(s, AgentStep::Error { .. })));
        // Failed nodes emit no messages.
        assert!(result.next_ids.is_empty());
        // Cost still accounted.
        assert!((result.usd_cost - 0.003).abs() < 1e-9);
    }

    #[tokio::test]
    async fn spending_cap_blocks_all_calls() {
        let ai = Arc::new(ScriptedClient::new(vec![]));
        let (pipeline, spending) = pipeline(Arc::clone(&ai) as Arc<dyn AiClient>, 0.01);

        let inp = input(node(json!({})), Payload::text("hi"));
        spending.add_cost(inp.invocation_id, 5.0);

        let result = pipeline.run(inp).await;

        assert_eq!(result.error.as_deref(), Some("spending_exceeded"));
        assert!(result.trace.has_terminal());
        assert_eq!(ai.requests().len(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_yields_cancelled_result() {
        let ai = Arc::new(ScriptedClient::new(vec![]));
        let (pipeline, _) = pipeline(Arc::clone(&ai) as Arc<dyn AiClient>, 10.0);

        let inp = input(node(json!({})), Payload::text("hi"));
        inp.cancel.cancel();

        let result = pipeline.run(inp).await;

        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert!(result.trace.has_terminal());
        assert_eq!(ai.requests().len(), 0);
    }

    #[tokio::test]
    async fn direct_sdk_concatenates_prompt_and_tracks_sdk_cost() {
        let ai = Arc::new(ScriptedClient::new(vec![
            CompletionResult::Completed(Completion::text("sdk says hi", 0.02)),
            // learning prompt answer
            CompletionResult::Completed(Completion::text("{}", 0.001)),
            // terminate summary answer
            CompletionResult::Completed(Completion::text("short", 0.001)),
        ]));
        let (pipeline, spending) = pipeline(Arc::clone(&ai) as Arc<dyn AiClient>, 10.0);

        let inp = input(
            node(json!({"use_direct_sdk": true})),
            Payload::text("payload text"),
        );
        let invocation_id = inp.invocation_id;
        let result = pipeline.run(inp).await;

        assert!(result.error.is_none());
        assert_eq!(result.final_output, "sdk says hi");
        assert!((spending.sdk_total(invocation_id) - 0.02).abs() < 1e-9);

        let first = &ai.requests()[0];
        assert_eq!(first.messages.len(), 1);
        assert!(first.messages[0].content.contains("Echo the input."));
        assert!(first.messages[0].content.contains("payload text"));
        assert!(first.save_outputs);
    }

    #[tokio::test]
    async fn memory_snapshot_joins_the_incoming_message() {
        let ai = Arc::new(SimulatedClient::new());
        let (pipeline, _) = pipeline(ai, 10.0);

        let mut inp = input(node(json!({})), Payload::text("task"));
        inp.memory.insert("style".into(), "terse".into());

        let result = pipeline.run(inp).await;
        match &result.trace.steps()[0] {
            AgentStep::Prepare { content } => {
                assert!(content.contains("task"));
                assert!(content.contains("style: terse"));
            }
            other => panic!("expected prepare step, got {other:?}"),
        }
    }
}
