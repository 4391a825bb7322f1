//! Edge gating: decides which outgoing edges of a completed node fire.

pub mod expr;

use async_trait::async_trait;
use tracing::warn;

use crate::executor::NodeResult;
use crate::graph::edge::{EdgeCondition, EdgeSpec};
use crate::graph::spec::Graph;
use crate::memory::MemorySnapshot;

/// External provider for LLM_DECIDE edges: chooses one target among the
/// candidate edges actually leaving the node. The engine never inspects
/// how the choice is made.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn choose(
        &self,
        node_id: &str,
        candidates: &[String],
        memory: &MemorySnapshot,
    ) -> anyhow::Result<ProviderChoice>;
}

/// A provider's answer: the chosen target plus its stated reasoning,
/// which flows into the decision trail.
#[derive(Debug, Clone)]
pub struct ProviderChoice {
    pub target: String,
    pub reasoning: String,
}

/// Record of a delegated edge choice, surfaced so the scheduler can
/// write it to the decision trail.
#[derive(Debug, Clone)]
pub struct EdgeDecision {
    pub options: Vec<String>,
    pub chosen: String,
    pub reasoning: String,
}

/// The edges that fire for one completed node, in priority-desc then
/// declaration order, plus any delegated decision made along the way.
pub struct EligibleEdges<'g> {
    pub edges: Vec<(usize, &'g EdgeSpec)>,
    pub llm_decision: Option<EdgeDecision>,
}

/// Evaluates every outgoing edge of `node_id` against the node result and
/// a memory snapshot. Never fails the run: CONDITIONAL evaluation errors
/// fail closed and a misbehaving provider simply fires no LLM_DECIDE edge.
pub async fn eligible_edges<'g>(
    graph: &'g Graph,
    node_id: &str,
    result: &NodeResult,
    memory: &MemorySnapshot,
    provider: Option<&dyn DecisionProvider>,
) -> EligibleEdges<'g> {
    let mut llm_candidates: Vec<(usize, &EdgeSpec)> = Vec::new();
    let mut fired: Vec<(usize, &EdgeSpec)> = Vec::new();

    for (idx, edge) in graph.outgoing_edges(node_id) {
        let fires = match &edge.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => result.success,
            EdgeCondition::OnFailure => !result.success,
            EdgeCondition::Conditional { .. } => graph
                .compiled_expr(idx)
                .map(|e| e.eval_bool(memory))
                .unwrap_or(false),
            EdgeCondition::LlmDecide => {
                llm_candidates.push((idx, edge));
                false
            }
        };
        if fires {
            fired.push((idx, edge));
        }
    }

    let mut llm_decision = None;
    if !llm_candidates.is_empty() {
        match provider {
            None => {
                warn!(
                    node = node_id,
                    "LLM_DECIDE edges present but no decision provider configured"
                );
            }
            Some(provider) => {
                let options: Vec<String> = llm_candidates
                    .iter()
                    .map(|(_, e)| e.target.clone())
                    .collect();
                match provider.choose(node_id, &options, memory).await {
                    Ok(choice) if options.contains(&choice.target) => {
                        let chosen = llm_candidates
                            .iter()
                            .find(|(_, e)| e.target == choice.target)
                            .copied()
                            .expect("chosen target verified against candidates");
                        fired.push(chosen);
                        llm_decision = Some(EdgeDecision {
                            options,
                            chosen: choice.target,
                            reasoning: choice.reasoning,
                        });
                    }
                    Ok(choice) => {
                        // Constrained to edges actually leaving the node;
                        // an out-of-set answer is ignored.
                        warn!(
                            node = node_id,
                            chosen = %choice.target,
                            "decision provider chose a target outside the candidate set"
                        );
                    }
                    Err(e) => {
                        warn!(node = node_id, "decision provider failed: {e}");
                    }
                }
            }
        }
    }

    // Restore the graph's evaluation order after the delegated choice was
    // appended.
    fired.sort_by_key(|(idx, edge)| (std::cmp::Reverse(edge.priority), *idx));

    EligibleEdges {
        edges: fired,
        llm_decision,
    }
}
