//! Learning: derive a durable memory update when a node terminates.

use std::collections::BTreeMap;

use tracing::warn;

use super::NodeInvocationInput;
use crate::ai::{AiClient, ChatMessage, CompletionRequest, CompletionResult};
use crate::spending::SpendingTracker;
use crate::strategy::extract_json_object;
use crate::trace::AgentStepTrace;

/// Leading line of every learning system prompt. The simulated client
/// keys off it to answer with an empty mapping.
pub const LEARNING_PROMPT_HEADER: &str = "Derive durable learnings for this agent.";

/// Result of the learning call. Memory is left unchanged on anything but
/// `Updated`; the caller records `Failed` as an `error` trace step.
pub(super) enum LearningOutcome {
    Updated {
        memory: BTreeMap<String, String>,
        usd_cost: f64,
    },
    Unchanged {
        usd_cost: f64,
    },
    Failed {
        reason: String,
        usd_cost: f64,
    },
}

/// Ask the model for the node's updated memory mapping.
pub(super) async fn derive_memory_update(
    ai: &dyn AiClient,
    spending: &dyn SpendingTracker,
    input: &NodeInvocationInput,
    trace: &AgentStepTrace,
) -> LearningOutcome {
    let mut system = String::new();
    system.push_str(LEARNING_PROMPT_HEADER);
    system.push_str("\n\n");
    system.push_str(&format!(
        "Node '{}' just finished an invocation.\nRole: {}\nWorkflow goal: {}\n",
        input.node.node_id, input.node.system_prompt, input.main_goal
    ));
    if input.memory.is_empty() {
        system.push_str("Current memory: (empty)\n");
    } else {
        system.push_str("Current memory:\n");
        for (key, value) in &input.memory {
            system.push_str(&format!("  {key}: {value}\n"));
        }
    }
    system.push_str(
        "\nReturn the node's full updated memory as one JSON object mapping \
         string keys to string values. Return {} if nothing durable was learned.\n",
    );

    let request = CompletionRequest::text(
        input.node.model_name.clone(),
        vec![
            ChatMessage::system(system),
            ChatMessage::user(trace.render_text()),
        ],
    );

    let result = match ai.complete(request).await {
        Ok(result) => result,
        Err(err) => {
            warn!(error = %err, "learning call could not reach the provider");
            return LearningOutcome::Failed {
                reason: err.to_string(),
                usd_cost: 0.0,
            };
        }
    };

    let usd_cost = result.usd_cost();
    spending.add_cost(input.invocation_id, usd_cost);

    let content = match result {
        CompletionResult::Completed(completion) => completion.content.unwrap_or_default(),
        CompletionResult::Failed(failure) => {
            return LearningOutcome::Failed {
                reason: failure.error_message,
                usd_cost,
            }
        }
    };

    match serde_json::from_str::<BTreeMap<String, String>>(extract_json_object(&content)) {
        Ok(memory) if memory.is_empty() || memory == input.memory => {
            LearningOutcome::Unchanged { usd_cost }
        }
        Ok(memory) => LearningOutcome::Updated { memory, usd_cost },
        Err(e) => LearningOutcome::Failed {
            reason: format!("unparseable memory mapping: {e}"),
            usd_cost,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Completion, ScriptedClient};
    use crate::dsl::NodeConfig;
    use crate::executor::CancelToken;
    use crate::payload::Payload;
    use crate::spending::CostLedger;
    use serde_json::json;
    use uuid::Uuid;

    fn input(memory: BTreeMap<String, String>) -> NodeInvocationInput {
        let node: NodeConfig = serde_json::from_value(json!({
            "node_id": "n",
            "system_prompt": "work",
            "model_name": "m",
            "hand_offs": ["end"]
        }))
        .unwrap();
        NodeInvocationInput {
            invocation_id: Uuid::new_v4(),
            version_id: "v1".into(),
            node,
            node_version_id: Uuid::new_v4(),
            memory,
            payload: Payload::text("x"),
            main_goal: "goal".into(),
            files: vec![],
            attempt_no: 1,
            cancel: CancelToken::new(),
        }
    }

    #[tokio::test]
    async fn updated_memory_parses() {
        let ai = ScriptedClient::new(vec![CompletionResult::Completed(Completion::text(
            json!({"style": "brief"}).to_string(),
            0.002,
        ))]);
        let spending = CostLedger::new(10.0);
        let trace = AgentStepTrace::new();

        let outcome =
            derive_memory_update(&ai, &spending, &input(BTreeMap::new()), &trace).await;
        match outcome {
            LearningOutcome::Updated { memory, usd_cost } => {
                assert_eq!(memory["style"], "brief");
                assert_eq!(usd_cost, 0.002);
            }
            _ => panic!("expected updated"),
        }
    }

    #[tokio::test]
    async fn empty_mapping_means_unchanged() {
        let ai = ScriptedClient::new(vec![CompletionResult::Completed(Completion::text(
            "{}", 0.001,
        ))]);
        let spending = CostLedger::new(10.0);
        let trace = AgentStepTrace::new();

        let outcome =
            derive_memory_update(&ai, &spending, &input(BTreeMap::new()), &trace).await;
        assert!(matches!(outcome, LearningOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn identical_mapping_means_unchanged() {
        let current = BTreeMap::from([("style".to_string(), "brief".to_string())]);
        let ai = ScriptedClient::new(vec![CompletionResult::Completed(Completion::text(
            json!({"style": "brief"}).to_string(),
            0.001,
        ))]);
        let spending = CostLedger::new(10.0);
        let trace = AgentStepTrace::new();

        let outcome = derive_memory_update(&ai, &spending, &input(current), &trace).await;
        assert!(matches!(outcome, LearningOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn garbage_answer_fails_and_leaves_memory_alone() {
        let ai = ScriptedClient::new(vec![CompletionResult::Completed(Completion::text(
            "no json here",
            0.001,
        ))]);
        let spending = CostLedger::new(10.0);
        let trace = AgentStepTrace::new();

        let outcome =
            derive_memory_update(&ai, &spending, &input(BTreeMap::new()), &trace).await;
        assert!(matches!(outcome, LearningOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn model_failure_reports_cost() {
        let ai = ScriptedClient::new(vec![CompletionResult::failed("overloaded", 0.0004)]);
        let spending = CostLedger::new(10.0);
        let trace = AgentStepTrace::new();

        let outcome =
            derive_memory_update(&ai, &spending, &input(BTreeMap::new()), &trace).await;
        match outcome {
            LearningOutcome::Failed { usd_cost, .. } => assert_eq!(usd_cost, 0.0004),
            _ => panic!("expected failed"),
        }
    }
}
