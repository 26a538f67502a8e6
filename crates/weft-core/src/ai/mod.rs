//! The AI client port: a single completion call against a language model.
//!
//! Concrete provider SDKs live outside the core and implement [`AiClient`].
//! Model-level failures are data (`CompletionResult::Failed`), never `Err`;
//! `Err` is reserved for provider-connectivity faults the caller cannot
//! recover from. Cost is always reported, including on failure.

mod simulated;

pub use simulated::{ScriptedClient, SimulatedClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Role of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Whether the model answers in text or may call tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    Text,
    Tool,
}

/// Tool surface handed to the model: name, description, JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool-choice policy for one completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Required,
    /// Force a specific tool by name.
    Named(String),
}

/// Request for a single model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub mode: CompletionMode,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub max_steps: u32,
    /// Allow the provider adapter to repair malformed tool arguments.
    pub repair: bool,
    /// Ask the provider adapter to keep raw outputs for debugging.
    pub save_outputs: bool,
}

impl CompletionRequest {
    /// Plain text request with no tool surface.
    pub fn text(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            mode: CompletionMode::Text,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            max_steps: 1,
            repair: false,
            save_outputs: false,
        }
    }

    /// Tool-mode request.
    pub fn tool(
        model_id: impl Into<String>,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSpec>,
        tool_choice: ToolChoice,
        max_steps: u32,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            mode: CompletionMode::Tool,
            tools,
            tool_choice,
            max_steps,
            repair: false,
            save_outputs: false,
        }
    }

    /// Last user-authored message, if any.
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

/// Successful model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub usd_cost: f64,
}

impl Completion {
    /// Canned text completion, handy for scripted tests.
    pub fn text(content: impl Into<String>, usd_cost: f64) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
            usd_cost,
        }
    }

    /// Canned tool-call completion.
    pub fn calling(name: impl Into<String>, args: serde_json::Value, usd_cost: f64) -> Self {
        let name = name.into();
        Self {
            content: None,
            tool_calls: vec![ToolCallRequest {
                id: format!("call-{name}"),
                name,
                args,
            }],
            finish_reason: FinishReason::ToolCalls,
            usage: Usage::default(),
            usd_cost,
        }
    }
}

/// Model-level failure. Carries whatever cost accrued before failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFailure {
    pub error_message: String,
    pub debug_output: Option<String>,
    pub usd_cost_so_far: f64,
}

/// Outcome of one completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompletionResult {
    Completed(Completion),
    Failed(CompletionFailure),
}

impl CompletionResult {
    pub fn failed(message: impl Into<String>, usd_cost_so_far: f64) -> Self {
        CompletionResult::Failed(CompletionFailure {
            error_message: message.into(),
            debug_output: None,
            usd_cost_so_far,
        })
    }

    /// Cost is reported on both arms.
    pub fn usd_cost(&self) -> f64 {
        match self {
            CompletionResult::Completed(c) => c.usd_cost,
            CompletionResult::Failed(f) => f.usd_cost_so_far,
        }
    }
}

/// The narrow AI port: one call, mode `text` or `tool`.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResult>;
}
