//! Workflow executor: drives a whole workflow invocation.
//!
//! Seeds a message to the entry node, invokes nodes through the pipeline,
//! routes resulting messages, and terminates when a node hands off to the
//! `end` sentinel. Owns the per-invocation queue and cancellation token;
//! every mutation goes through the persistence port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ai::AiClient;
use crate::config::WeftConfig;
use crate::dsl::{NodeConfig, WorkflowDsl, END_NODE_ID, START_NODE_ID};
use crate::error::{Result, WeftError};
use crate::model::{
    InvocationStatus, Message, MessageRole, NodeInvocationStatus, VersionOperation,
    WorkflowInvocation, WorkflowVersion,
};
use crate::payload::Payload;
use crate::persistence::{
    with_retries, InvocationPatch, NodeInvocationEnd, NodeInvocationStart, PersistencePort,
};
use crate::pipeline::{InvocationPipeline, NodeInvocationInput, NodeInvocationResult};
use crate::redact::SecretRedactor;
use crate::spending::SpendingTracker;
use crate::tools::ToolRegistry;

// ---------------------------------------------------------------------------
// Cancellation token
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation shared by everything inside one workflow
/// invocation. Observed at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token fires. Safe against firing between the
    /// flag check and the wait.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Options for one workflow run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub generation_id: Option<String>,
    /// Workflow files exposed to tools through the execution context.
    pub files: Vec<String>,
}

/// Async handle for a running workflow invocation.
#[derive(Debug)]
pub struct InvocationHandle {
    pub invocation_id: Uuid,
    cancel: CancelToken,
    join: tokio::task::JoinHandle<()>,
}

impl InvocationHandle {
    /// Fire the invocation's cancellation token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub struct WorkflowExecutor {
    persistence: Arc<dyn PersistencePort>,
    spending: Arc<dyn SpendingTracker>,
    pipeline: Arc<InvocationPipeline>,
    config: Arc<WeftConfig>,
    redactor: SecretRedactor,
}

impl WorkflowExecutor {
    pub fn new(
        persistence: Arc<dyn PersistencePort>,
        ai: Arc<dyn AiClient>,
        tools: Arc<ToolRegistry>,
        spending: Arc<dyn SpendingTracker>,
        config: WeftConfig,
    ) -> Self {
        let config = Arc::new(config);
        let pipeline = Arc::new(InvocationPipeline::new(
            ai,
            tools,
            Arc::clone(&spending),
            config.pipeline.clone(),
            config.handoff.content_mode,
            config.executor.coordination,
            Duration::from_secs(config.executor.cancel_grace_seconds),
        ));
        Self {
            persistence,
            spending,
            pipeline,
            config,
            redactor: SecretRedactor::new(),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn PersistencePort> {
        &self.persistence
    }

    /// Validate a DSL blob and persist it as a new workflow version.
    pub async fn create_version(
        &self,
        workflow_id: &str,
        description: &str,
        version_id: &str,
        dsl: serde_json::Value,
        operation: VersionOperation,
        commit_message: &str,
        generation_id: Option<String>,
    ) -> Result<WorkflowVersion> {
        let parsed = WorkflowDsl::parse(&dsl)?;
        let version = WorkflowVersion {
            version_id: version_id.to_string(),
            workflow_id: workflow_id.to_string(),
            dsl: parsed.to_value(),
            operation,
            commit_message: commit_message.to_string(),
            generation_id,
            created_at: Utc::now(),
        };

        with_retries("ensure_workflow", || {
            self.persistence.ensure_workflow(workflow_id, description)
        })
        .await?;
        with_retries("create_workflow_version", || {
            self.persistence.create_workflow_version(version.clone())
        })
        .await?;
        Ok(version)
    }

    /// Start a workflow invocation, returning an async handle.
    pub async fn run_workflow(
        &self,
        version_id: &str,
        input: serde_json::Value,
        opts: RunOptions,
    ) -> Result<InvocationHandle> {
        let version = with_retries("workflow_version", || {
            self.persistence.workflow_version(version_id)
        })
        .await?;
        let dsl = WorkflowDsl::parse(&version.dsl)?;

        let invocation = WorkflowInvocation::started(
            version_id,
            Some(input.clone()),
            opts.run_id,
            opts.generation_id,
        );
        let invocation_id = invocation.invocation_id;
        with_retries("create_workflow_invocation", || {
            self.persistence.create_workflow_invocation(invocation.clone())
        })
        .await?;

        let cancel = CancelToken::new();
        let driver = Drive {
            executor: self.clone(),
            invocation_id,
            version_id: version_id.to_string(),
            dsl,
            cancel: cancel.clone(),
            goal: goal_from_input(&input),
            files: opts.files,
            seq: 0,
            nodes_invoked: 0,
            terminal: Vec::new(),
            queue: VecDeque::new(),
        };

        let join = tokio::spawn(async move {
            driver.run(input).await;
        });

        info!(%invocation_id, version_id, "workflow invocation started");
        Ok(InvocationHandle {
            invocation_id,
            cancel,
            join,
        })
    }

    /// Wait for a running invocation and fetch its terminal row.
    pub async fn await_invocation(&self, handle: InvocationHandle) -> Result<WorkflowInvocation> {
        let invocation_id = handle.invocation_id;
        if let Err(e) = handle.join.await {
            error!(%invocation_id, error = %e, "invocation driver panicked");
        }
        Ok(with_retries("workflow_invocation", || {
            self.persistence.workflow_invocation(invocation_id)
        })
        .await?)
    }

    /// Run a workflow and wait for its terminal state.
    pub async fn run_to_completion(
        &self,
        version_id: &str,
        input: serde_json::Value,
        opts: RunOptions,
    ) -> Result<WorkflowInvocation> {
        let handle = self.run_workflow(version_id, input, opts).await?;
        self.await_invocation(handle).await
    }

    // -------------------------------------------------------------------
    // Node invocation plumbing (shared by sequential and parallel paths)
    // -------------------------------------------------------------------

    /// Persist start, run the pipeline, persist end, commit memory.
    async fn invoke_node(
        &self,
        invocation_id: Uuid,
        version_id: String,
        node: NodeConfig,
        msg: Message,
        goal: String,
        files: Vec<String>,
        cancel: CancelToken,
    ) -> Result<NodeRun> {
        // Memory comes from the latest node version; first contact
        // snapshots the DSL config.
        let node_version = match with_retries("latest_node_version", || {
            self.persistence.latest_node_version(&node.node_id, &version_id)
        })
        .await?
        {
            Some(nv) => nv,
            None => {
                with_retries("save_node_version", || {
                    self.persistence.save_node_version(node.clone(), &version_id)
                })
                .await?
            }
        };
        let memory = node_version.config.memory.clone();

        let node_invocation_id = with_retries("start_node_invocation", || {
            self.persistence.start_node_invocation(NodeInvocationStart {
                node_id: node.node_id.clone(),
                node_version_id: node_version.node_version_id,
                invocation_id,
                model: node.model_name.clone(),
                attempt_no: 1,
                start_time: Utc::now(),
            })
        })
        .await?;

        let result = self
            .pipeline
            .run(NodeInvocationInput {
                invocation_id,
                version_id: version_id.clone(),
                node: node.clone(),
                node_version_id: node_version.node_version_id,
                memory: memory.clone(),
                payload: msg.payload.clone(),
                main_goal: goal,
                files,
                attempt_no: 1,
                cancel,
            })
            .await;

        let status = if result.is_failed() {
            NodeInvocationStatus::Failed
        } else {
            NodeInvocationStatus::Completed
        };
        let extras = self.node_extras(&result);
        with_retries("end_node_invocation", || {
            self.persistence.end_node_invocation(NodeInvocationEnd {
                node_invocation_id,
                status,
                end_time: Utc::now(),
                usd_cost: result.usd_cost,
                output: Some(serde_json::Value::String(result.final_output.clone())),
                summary: result.summary_with_info(),
                files: Vec::new(),
                error: result.error.clone(),
                extras: Some(extras.clone()),
            })
        })
        .await?;

        // Memory delta commits on successful terminate only, and only
        // when it actually differs; visible to the node's next invocation.
        if !result.is_failed() {
            if let Some(delta) = &result.updated_memory {
                if *delta != memory {
                    let mut next = node.clone();
                    next.memory = delta.clone();
                    with_retries("save_node_version", || {
                        self.persistence.save_node_version(next.clone(), &version_id)
                    })
                    .await?;
                }
            }
        }

        Ok(NodeRun {
            node_invocation_id,
            result,
        })
    }

    /// Outward trace (redacted) plus the proposed memory delta.
    fn node_extras(&self, result: &NodeInvocationResult) -> serde_json::Value {
        let steps = result.trace.outward_steps();
        let serialized = serde_json::to_string(&steps).unwrap_or_default();
        let (redacted, _) = self.redactor.redact(&serialized);
        let trace_value: serde_json::Value =
            serde_json::from_str(&redacted).unwrap_or(serde_json::Value::String(redacted));

        serde_json::json!({
            "trace": trace_value,
            "memory_delta": result.updated_memory,
            "debug_prompts": result.debug_prompts,
        })
    }
}

/// Result of one node invocation plus its persisted row id.
struct NodeRun {
    node_invocation_id: Uuid,
    result: NodeInvocationResult,
}

fn goal_from_input(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Drive loop
// ---------------------------------------------------------------------------

/// Per-invocation driver state. Owns the queue and the seq counter.
struct Drive {
    executor: WorkflowExecutor,
    invocation_id: Uuid,
    version_id: String,
    dsl: WorkflowDsl,
    cancel: CancelToken,
    goal: String,
    files: Vec<String>,
    seq: u64,
    nodes_invoked: u32,
    terminal: Vec<Payload>,
    queue: VecDeque<Message>,
}

impl Drive {
    /// Run the invocation to a terminal state. Always persists one.
    async fn run(mut self, input: serde_json::Value) {
        let wall_clock = Duration::from_secs(self.executor.config.executor.wall_clock_seconds);

        let drive_result = tokio::time::timeout(wall_clock, self.drive_loop(input)).await;
        let failure = match drive_result {
            Ok(failure) => failure,
            Err(_) => {
                warn!(invocation_id = %self.invocation_id, "wall clock exceeded, cancelling");
                self.cancel.cancel();
                Some("wall_clock_exceeded".to_string())
            }
        };

        let end_reached = !self.terminal.is_empty();
        let status = if failure.is_none() && end_reached {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };
        let failure = if failure.is_none() && !end_reached {
            Some("no path reached 'end'".to_string())
        } else {
            failure
        };

        let workflow_output = match self.terminal.len() {
            0 => None,
            1 => Some(serde_json::Value::String(self.terminal[0].joined_text())),
            _ => serde_json::to_value(Payload::Aggregated {
                parts: self.terminal.clone(),
            })
            .ok(),
        };

        let patch = InvocationPatch {
            status: Some(status),
            end_time: Some(Utc::now()),
            usd_cost: Some(self.executor.spending.total(self.invocation_id)),
            workflow_output,
            extras: failure
                .as_ref()
                .map(|reason| serde_json::json!({ "error": reason })),
            ..Default::default()
        };

        // Best effort: the terminal state must land even when the run
        // itself failed. Stale cleanup is the backstop if it does not.
        if let Err(e) = with_retries("update_workflow_invocation", || {
            self.executor
                .persistence
                .update_workflow_invocation(self.invocation_id, patch.clone())
        })
        .await
        {
            error!(
                invocation_id = %self.invocation_id,
                error = %e,
                "failed to persist terminal invocation state"
            );
        }

        info!(
            invocation_id = %self.invocation_id,
            status = status.label(),
            nodes = self.nodes_invoked,
            "workflow invocation finished"
        );
    }

    /// The message loop. Returns the failure reason, if any.
    async fn drive_loop(&mut self, input: serde_json::Value) -> Option<String> {
        let entry = self.dsl.entry_node_id.clone();
        let seed_payload = match input {
            serde_json::Value::String(s) => Payload::text(s),
            other => Payload::json(other),
        };
        if let Err(e) = self
            .emit(None, &entry, MessageRole::Delegation, seed_payload, None)
            .await
        {
            return Some(short_reason(&e));
        }

        while let Some(msg) = self.queue.pop_front() {
            if self.cancel.is_cancelled() {
                return Some("cancelled".to_string());
            }

            let to = msg.to_node_id.clone().unwrap_or_default();
            if to == END_NODE_ID {
                self.terminal.push(msg.payload.clone());
                continue;
            }

            if self.executor.spending.check(self.invocation_id).is_exceeded() {
                self.cancel.cancel();
                return Some("spending_exceeded".to_string());
            }

            let Some(node) = self.dsl.node(&to).cloned() else {
                return Some(format!("unknown node '{to}'"));
            };

            if self.nodes_invoked >= self.executor.config.executor.max_nodes_per_invocation {
                return Some("step_budget_exhausted".to_string());
            }
            self.nodes_invoked += 1;

            let run = match self
                .executor
                .invoke_node(
                    self.invocation_id,
                    self.version_id.clone(),
                    node,
                    msg,
                    self.goal.clone(),
                    self.files.clone(),
                    self.cancel.clone(),
                )
                .await
            {
                Ok(run) => run,
                Err(e) => return Some(short_reason(&e)),
            };

            if run.result.is_failed() {
                self.cancel.cancel();
                return Some(
                    run.result
                        .error
                        .clone()
                        .unwrap_or_else(|| "node_failed".to_string()),
                );
            }

            if run.result.next_ids.len() > 1 {
                if let Some(reason) = self.fan_out(run).await {
                    return Some(reason);
                }
            } else if let Some(reason) = self.emit_replies(&run).await {
                return Some(reason);
            }
        }

        None
    }

    /// Parallel handoff: persist the outgoing messages, run one subtask
    /// per target, join, then enqueue the branch results.
    async fn fan_out(&mut self, run: NodeRun) -> Option<String> {
        let from_node = run.result.node_id.clone();

        // Branch configs are validated before anything is spawned.
        let mut branches = Vec::new();
        for reply in &run.result.replies {
            let Some(node) = self.dsl.node(&reply.to_node_id).cloned() else {
                return Some(format!("unknown node '{}'", reply.to_node_id));
            };
            branches.push((node, reply.clone()));
        }

        let budget = self.executor.config.executor.max_nodes_per_invocation;
        if self.nodes_invoked + branches.len() as u32 > budget {
            return Some("step_budget_exhausted".to_string());
        }
        self.nodes_invoked += branches.len() as u32;

        // The fan-out messages carry consecutive seq values.
        let mut branch_msgs = Vec::new();
        for (_, reply) in &branches {
            match self
                .emit_detached(
                    Some(from_node.clone()),
                    &reply.to_node_id,
                    reply.role,
                    reply.payload.clone(),
                    Some(run.node_invocation_id),
                )
                .await
            {
                Ok(msg) => branch_msgs.push(msg),
                Err(e) => return Some(short_reason(&e)),
            }
        }

        let mut handles = Vec::new();
        for ((node, _), msg) in branches.into_iter().zip(branch_msgs) {
            let executor = self.executor.clone();
            let invocation_id = self.invocation_id;
            let version_id = self.version_id.clone();
            let goal = self.goal.clone();
            let files = self.files.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .invoke_node(invocation_id, version_id, node, msg, goal, files, cancel)
                    .await
            }));
        }

        // Join all branches before enqueuing any of their results.
        let mut branch_runs = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(run)) => branch_runs.push(run),
                Ok(Err(e)) => {
                    self.cancel.cancel();
                    return Some(short_reason(&e));
                }
                Err(e) => {
                    self.cancel.cancel();
                    return Some(format!("branch task panicked: {e}"));
                }
            }
        }

        for run in &branch_runs {
            if run.result.is_failed() {
                self.cancel.cancel();
                return Some(
                    run.result
                        .error
                        .clone()
                        .unwrap_or_else(|| "node_failed".to_string()),
                );
            }
        }

        for run in branch_runs {
            if let Some(reason) = self.emit_replies(&run).await {
                return Some(reason);
            }
        }

        None
    }

    /// Emit a finished node's replies into the queue.
    async fn emit_replies(&mut self, run: &NodeRun) -> Option<String> {
        for reply in &run.result.replies {
            if let Err(e) = self
                .emit(
                    Some(run.result.node_id.clone()),
                    &reply.to_node_id,
                    reply.role,
                    reply.payload.clone(),
                    Some(run.node_invocation_id),
                )
                .await
            {
                return Some(short_reason(&e));
            }
        }
        None
    }

    /// Persist one message with the next seq and push it onto the queue.
    async fn emit(
        &mut self,
        from: Option<String>,
        to: &str,
        role: MessageRole,
        payload: Payload,
        origin: Option<Uuid>,
    ) -> Result<()> {
        let msg = self.emit_detached(from, to, role, payload, origin).await?;
        self.queue.push_back(msg);
        Ok(())
    }

    /// Persist one message without queueing it (fan-out path queues after
    /// the join instead).
    async fn emit_detached(
        &mut self,
        from: Option<String>,
        to: &str,
        role: MessageRole,
        payload: Payload,
        origin: Option<Uuid>,
    ) -> Result<Message> {
        self.seq += 1;
        let msg = Message {
            msg_id: Uuid::new_v4(),
            invocation_id: self.invocation_id,
            from_node_id: from.or_else(|| Some(START_NODE_ID.to_string())),
            to_node_id: Some(to.to_string()),
            seq: self.seq,
            role,
            payload,
            created_at: Utc::now(),
            origin_invocation_id: origin,
        };
        with_retries("save_message", || {
            self.executor.persistence.save_message(msg.clone())
        })
        .await?;
        Ok(msg)
    }
}

fn short_reason(err: &WeftError) -> String {
    match err {
        WeftError::SpendingExceeded { .. } => "spending_exceeded".to_string(),
        WeftError::Cancelled(_) => "cancelled".to_string(),
        WeftError::Persistence(_) => "persistence_error".to_string(),
        WeftError::Validation(_) => "validation_error".to_string(),
        WeftError::Tool(_) => "tool_error".to_string(),
        WeftError::AiProvider(_) => "ai_provider_error".to_string(),
        _ => "internal_error".to_string(),
    }
}
