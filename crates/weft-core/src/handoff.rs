//! Handoff resolution: which node(s) receive a node's output next.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::ai::{AiClient, ChatMessage, CompletionRequest, CompletionResult};
use crate::config::{CoordinationType, HandoffContentMode};
use crate::dsl::{HandOffType, NodeConfig, END_NODE_ID};
use crate::error::Result;
use crate::model::MessageRole;
use crate::payload::Payload;
use crate::spending::{SpendCheck, SpendingTracker};

/// Handoff content is cut here under the `truncated` policy.
const TRUNCATED_CONTENT_CHARS: usize = 500;

/// One outgoing reply, addressed to a single successor.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffReply {
    pub to_node_id: String,
    pub role: MessageRole,
    pub payload: Payload,
}

/// Resolved routing for a finished node invocation.
#[derive(Debug, Clone)]
pub struct HandoffDecision {
    pub next_ids: Vec<String>,
    pub replies: Vec<HandoffReply>,
    pub usd_cost: f64,
    /// Present when the AI was consulted for the pick.
    pub debug_prompt: Option<String>,
}

/// Chooses the next recipient(s) from a node's declared successors.
pub struct HandoffResolver {
    ai: Arc<dyn AiClient>,
    spending: Arc<dyn SpendingTracker>,
    content_mode: HandoffContentMode,
    coordination: CoordinationType,
}

impl HandoffResolver {
    pub fn new(
        ai: Arc<dyn AiClient>,
        spending: Arc<dyn SpendingTracker>,
        content_mode: HandoffContentMode,
        coordination: CoordinationType,
    ) -> Self {
        Self {
            ai,
            spending,
            content_mode,
            coordination,
        }
    }

    /// Resolve the routing for `node` given its final output.
    ///
    /// Fan-out applies iff the node declares `parallel`, has more than one
    /// successor, and none of them is `end`. Everything else picks exactly
    /// one successor; the AI is consulted only when there is an actual
    /// choice to make, and an out-of-set pick falls back to the first
    /// declared successor.
    pub async fn resolve(
        &self,
        invocation_id: Uuid,
        model_id: &str,
        node: &NodeConfig,
        final_output: &str,
    ) -> Result<HandoffDecision> {
        let targets = &node.hand_offs;

        let is_parallel = node.hand_off_type == HandOffType::Parallel
            && targets.len() > 1
            && !targets.iter().any(|t| t == END_NODE_ID);

        if is_parallel {
            let replies = targets
                .iter()
                .map(|t| self.reply_for(t, final_output))
                .collect();
            return Ok(HandoffDecision {
                next_ids: targets.clone(),
                replies,
                usd_cost: 0.0,
                debug_prompt: None,
            });
        }

        if targets.len() == 1 {
            let target = targets[0].clone();
            return Ok(HandoffDecision {
                next_ids: vec![target.clone()],
                replies: vec![self.reply_for(&target, final_output)],
                usd_cost: 0.0,
                debug_prompt: None,
            });
        }

        let (picked, usd_cost, debug_prompt) = self
            .pick_successor(invocation_id, model_id, node, final_output)
            .await?;

        Ok(HandoffDecision {
            next_ids: vec![picked.clone()],
            replies: vec![self.reply_for(&picked, final_output)],
            usd_cost,
            debug_prompt,
        })
    }

    /// Ask the AI to pick one successor, validating membership.
    async fn pick_successor(
        &self,
        invocation_id: Uuid,
        model_id: &str,
        node: &NodeConfig,
        final_output: &str,
    ) -> Result<(String, f64, Option<String>)> {
        let fallback = node.hand_offs[0].clone();

        if let SpendCheck::Exceeded { .. } = self.spending.check(invocation_id) {
            warn!(
                node_id = %node.node_id,
                "spending cap reached, handing off to first successor without selection"
            );
            return Ok((fallback, 0.0, None));
        }

        let system = format!(
            "You route the output of node '{}' ({}).\n\
             Declared successors: {}.\n\
             Answer with exactly one successor id from that list, nothing else.\n\
             Answer 'end' only if it is listed and the workflow should stop.",
            node.node_id,
            node.system_prompt,
            node.hand_offs.join(", "),
        );
        let request = CompletionRequest::text(
            model_id,
            vec![
                ChatMessage::system(system.clone()),
                ChatMessage::user(final_output.to_string()),
            ],
        );

        let result = self.ai.complete(request).await?;
        let usd_cost = result.usd_cost();
        self.spending.add_cost(invocation_id, usd_cost);

        let picked = match result {
            CompletionResult::Completed(completion) => {
                let answer = completion.content.unwrap_or_default();
                match match_successor(&answer, &node.hand_offs) {
                    Some(id) => id,
                    None => {
                        warn!(
                            node_id = %node.node_id,
                            answer = %answer,
                            "handoff pick not in declared successors, falling back to first"
                        );
                        fallback
                    }
                }
            }
            CompletionResult::Failed(failure) => {
                warn!(
                    node_id = %node.node_id,
                    error = %failure.error_message,
                    "handoff selection call failed, falling back to first successor"
                );
                fallback
            }
        };

        Ok((picked, usd_cost, Some(system)))
    }

    fn reply_for(&self, target: &str, final_output: &str) -> HandoffReply {
        let payload = match self.content_mode {
            HandoffContentMode::Full => Payload::text(final_output),
            HandoffContentMode::Truncated => {
                Payload::text(final_output).truncated(TRUNCATED_CONTENT_CHARS)
            }
        };
        let role = if target == END_NODE_ID {
            MessageRole::Result
        } else {
            match self.coordination {
                CoordinationType::Sequential => MessageRole::Sequential,
                CoordinationType::Delegation => MessageRole::Delegation,
            }
        };
        HandoffReply {
            to_node_id: target.to_string(),
            role,
            payload,
        }
    }
}

/// Find the declared successor the answer names.
///
/// An exact (trimmed) match wins; otherwise the successor mentioned
/// earliest in the answer is taken.
fn match_successor(answer: &str, hand_offs: &[String]) -> Option<String> {
    let trimmed = answer.trim().trim_matches(|c| c == '"' || c == '\'' || c == '.');
    for id in hand_offs {
        if trimmed == id {
            return Some(id.clone());
        }
    }
    hand_offs
        .iter()
        .filter_map(|id| answer.find(id.as_str()).map(|pos| (pos, id)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, id)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{Completion, ScriptedClient};
    use crate::spending::CostLedger;
    use serde_json::json;

    fn node(hand_offs: Vec<&str>, hand_off_type: HandOffType) -> NodeConfig {
        let mut cfg: NodeConfig = serde_json::from_value(json!({
            "node_id": "router",
            "system_prompt": "Route things.",
            "model_name": "m",
            "hand_offs": hand_offs,
        }))
        .unwrap();
        cfg.hand_off_type = hand_off_type;
        cfg
    }

    fn resolver(script: Vec<CompletionResult>) -> (HandoffResolver, Arc<ScriptedClient>) {
        let ai = Arc::new(ScriptedClient::new(script));
        (
            HandoffResolver::new(
                Arc::clone(&ai) as Arc<dyn AiClient>,
                Arc::new(CostLedger::new(10.0)),
                HandoffContentMode::Full,
                CoordinationType::Sequential,
            ),
            ai,
        )
    }

    #[tokio::test]
    async fn parallel_fans_out_to_all_targets() {
        let (resolver, ai) = resolver(vec![]);
        let node = node(vec!["b", "c"], HandOffType::Parallel);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["b", "c"]);
        assert_eq!(decision.replies.len(), 2);
        assert_eq!(decision.usd_cost, 0.0);
        assert_eq!(ai.requests().len(), 0);
        for reply in &decision.replies {
            assert_eq!(reply.role, MessageRole::Sequential);
        }
    }

    #[tokio::test]
    async fn parallel_with_end_degrades_to_single_pick() {
        let answer = CompletionResult::Completed(Completion::text("end", 0.001));
        let (resolver, _ai) = resolver(vec![answer]);
        let node = node(vec!["b", "end"], HandOffType::Parallel);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids.len(), 1);
        assert_eq!(decision.next_ids[0], "end");
        assert_eq!(decision.replies[0].role, MessageRole::Result);
    }

    #[tokio::test]
    async fn single_successor_skips_the_ai() {
        let (resolver, ai) = resolver(vec![]);
        let node = node(vec!["next"], HandOffType::Sequential);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["next"]);
        assert_eq!(ai.requests().len(), 0);
        assert!(decision.debug_prompt.is_none());
    }

    #[tokio::test]
    async fn ai_pick_is_validated_against_declared_set() {
        let answer = CompletionResult::Completed(Completion::text("responder", 0.002));
        let (resolver, _ai) = resolver(vec![answer]);
        let node = node(vec!["classifier", "responder"], HandOffType::Conditional);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "needs a response")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["responder"]);
        assert_eq!(decision.usd_cost, 0.002);
        assert!(decision.debug_prompt.is_some());
    }

    #[tokio::test]
    async fn out_of_set_pick_falls_back_to_first() {
        let answer = CompletionResult::Completed(Completion::text("hallucinated_node", 0.001));
        let (resolver, _ai) = resolver(vec![answer]);
        let node = node(vec!["alpha", "beta"], HandOffType::Sequential);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["alpha"]);
    }

    #[tokio::test]
    async fn failed_selection_falls_back_to_first() {
        let (resolver, _ai) = resolver(vec![CompletionResult::failed("overloaded", 0.0007)]);
        let node = node(vec!["alpha", "beta"], HandOffType::Sequential);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["alpha"]);
        assert_eq!(decision.usd_cost, 0.0007);
    }

    #[tokio::test]
    async fn spending_cap_blocks_the_selection_call() {
        let ai = Arc::new(ScriptedClient::new(vec![]));
        let spending = Arc::new(CostLedger::new(0.01));
        let invocation_id = Uuid::new_v4();
        spending.add_cost(invocation_id, 1.0);

        let resolver = HandoffResolver::new(
            Arc::clone(&ai) as Arc<dyn AiClient>,
            spending,
            HandoffContentMode::Full,
            CoordinationType::Sequential,
        );
        let node = node(vec!["alpha", "beta"], HandOffType::Sequential);

        let decision = resolver
            .resolve(invocation_id, "m", &node, "output")
            .await
            .unwrap();

        assert_eq!(decision.next_ids, vec!["alpha"]);
        assert_eq!(ai.requests().len(), 0);
    }

    #[tokio::test]
    async fn truncated_mode_cuts_reply_content() {
        let ai = Arc::new(ScriptedClient::new(vec![]));
        let resolver = HandoffResolver::new(
            Arc::clone(&ai) as Arc<dyn AiClient>,
            Arc::new(CostLedger::new(10.0)),
            HandoffContentMode::Truncated,
            CoordinationType::Delegation,
        );
        let node = node(vec!["next"], HandOffType::Sequential);
        let long_output = "y".repeat(900);

        let decision = resolver
            .resolve(Uuid::new_v4(), "m", &node, &long_output)
            .await
            .unwrap();

        match &decision.replies[0].payload {
            Payload::Text { text } => {
                assert!(text.len() < 600);
                assert!(text.ends_with("[truncated]"));
            }
            other => panic!("expected text, got {other:?}"),
        }
        assert_eq!(decision.replies[0].role, MessageRole::Delegation);
    }
}
