use serde::{Deserialize, Serialize};

/// Hard cap on tool rounds/steps; node and global settings are clamped
/// down to this, never above it.
pub const HARD_STEP_CAP: u32 = 10;

/// Top-level configuration loaded from `weft.toml`.
///
/// Every tunable is enumerated here; unknown keys are rejected at parse
/// time and the whole struct is immutable after initialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WeftConfig {
    pub executor: ExecutorConfig,
    pub pipeline: PipelineConfig,
    pub spending: SpendingConfig,
    pub handoff: HandoffConfig,
    pub persistence: PersistenceConfig,
}

/// Workflow executor limits and coordination mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    /// Cycle/length safety: maximum node invocations per workflow invocation.
    pub max_nodes_per_invocation: u32,
    /// Wall-clock budget for one workflow invocation.
    pub wall_clock_seconds: u64,
    /// Grace window for in-flight tool calls after cancellation fires.
    pub cancel_grace_seconds: u64,
    pub coordination: CoordinationType,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_invocation: 64,
            wall_clock_seconds: 900,
            cancel_grace_seconds: 2,
            coordination: CoordinationType::Sequential,
        }
    }
}

/// Role given to fan-out messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationType {
    Sequential,
    Delegation,
}

/// Node invocation pipeline strategy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub multi_step_enabled: bool,
    pub multi_step_strategy: MultiStepStrategy,
    pub multi_step_max_rounds_default: u32,
    pub single_call_max_steps_default: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            multi_step_enabled: true,
            multi_step_strategy: MultiStepStrategy::V3,
            multi_step_max_rounds_default: 6,
            single_call_max_steps_default: 1,
        }
    }
}

/// Multi-step loop generation. V3 adds mutation tracking, self-check,
/// and per-tool summarization on top of the V2 skeleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiStepStrategy {
    V2,
    V3,
}

/// Process-wide spending cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpendingConfig {
    pub cap_usd: f64,
}

impl Default for SpendingConfig {
    fn default() -> Self {
        Self { cap_usd: 10.0 }
    }
}

/// Handoff payload construction policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HandoffConfig {
    pub content_mode: HandoffContentMode,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            content_mode: HandoffContentMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffContentMode {
    Full,
    /// Truncate handoff content to 500 characters.
    Truncated,
}

/// Persistence backend selection and stale-row policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Invocations still `running` past this window are force-failed by
    /// `cleanup_stale`.
    pub stale_cleanup_grace_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            stale_cleanup_grace_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    Memory,
    Sql,
}
