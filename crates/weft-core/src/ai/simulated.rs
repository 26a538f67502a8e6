//! Deterministic AI clients for dry-runs and tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AiClient, ChatRole, Completion, CompletionRequest, CompletionResult, FinishReason, Usage,
};
use crate::error::{Result, WeftError};
use crate::pipeline::LEARNING_PROMPT_HEADER;
use crate::strategy::DECISION_PROMPT_HEADER;

/// Simulated per-call cost; small but non-zero so cost accounting paths
/// are exercised.
pub const SIMULATED_COST_PER_CALL: f64 = 0.0001;

/// Local stand-in for a real provider.
///
/// Echoes the last user message, answers strategy-selection prompts with
/// an immediate terminate decision, and reports a tiny cost per call.
/// Used by the CLI when no provider is wired and by smoke tests.
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    cost_per_call: f64,
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClient {
    pub fn new() -> Self {
        Self {
            cost_per_call: SIMULATED_COST_PER_CALL,
        }
    }

    pub fn with_cost(cost_per_call: f64) -> Self {
        Self { cost_per_call }
    }
}

#[async_trait]
impl AiClient for SimulatedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        let user = request.last_user_content().unwrap_or_default().to_string();

        // Strategy-selection prompts get a well-formed terminate decision
        // and learning prompts an empty mapping; the simulated model never
        // has anything useful to do with tools or memory.
        let system_contains = |needle: &str| {
            request
                .messages
                .iter()
                .any(|m| m.role == ChatRole::System && m.content.contains(needle))
        };

        let content = if system_contains(DECISION_PROMPT_HEADER) {
            r#"{"action": "terminate", "reasoning": "simulated run, nothing further to do"}"#
                .to_string()
        } else if system_contains(LEARNING_PROMPT_HEADER) {
            "{}".to_string()
        } else {
            user.clone()
        };

        let usage = Usage {
            input_tokens: (user.len() / 4) as u64,
            output_tokens: (content.len() / 4) as u64,
        };

        Ok(CompletionResult::Completed(Completion {
            content: Some(content),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage,
            usd_cost: self.cost_per_call,
        }))
    }
}

/// Queue of canned outcomes, popped one per call.
///
/// Tests script exact model behavior with it and assert on the recorded
/// requests afterwards. Popping an empty script is a provider fault: it
/// means the test's expectations and the code path diverged.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<CompletionResult>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new(results: Vec<CompletionResult>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Append another canned outcome to the script.
    pub fn push(&self, result: CompletionResult) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

#[async_trait]
impl AiClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| WeftError::AiProvider("scripted client exhausted".into()))
    }
}
