use std::collections::{HashMap, HashSet};

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::condition::expr::Expr;
use crate::config::RunLimits;
use crate::error::{EngineError, Result};
use crate::graph::edge::{EdgeCondition, EdgeSpec};
use crate::graph::node::NodeSpec;

/// Whole-workflow definition: nodes, gated transitions, entry/terminal/
/// pause sets, and per-graph resource limits. Built once, validated at
/// load time, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    pub goal_id: String,
    pub entry_node: String,
    /// Additional entry points seeded alongside `entry_node`.
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    pub terminal_nodes: Vec<String>,
    #[serde(default)]
    pub pause_nodes: Vec<String>,
    #[serde(default)]
    pub limits: RunLimits,
}

impl GraphSpec {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Validates the spec and compiles it into an executable [`Graph`].
    ///
    /// All structural errors surface here, at load time, never during a
    /// run: duplicate node ids, dangling edge endpoints, entry/terminal/
    /// pause ids outside the node set, unreachable terminals, unparsable
    /// CONDITIONAL expressions, and overlapping output keys between nodes
    /// that could be scheduled concurrently.
    pub fn validate(self) -> Result<Graph> {
        let mut node_index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node_index.insert(node.id.clone(), i).is_some() {
                return Err(EngineError::validation_field(
                    format!("duplicate node id '{}'", node.id),
                    "nodes",
                ));
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !node_index.contains_key(endpoint) {
                    return Err(EngineError::validation_field(
                        format!(
                            "edge {} -> {} references unknown node '{}'",
                            edge.source, edge.target, endpoint
                        ),
                        "edges",
                    ));
                }
            }
        }

        for (field, ids) in [
            ("entry_node", std::slice::from_ref(&self.entry_node)),
            ("entry_points", self.entry_points.as_slice()),
            ("terminal_nodes", self.terminal_nodes.as_slice()),
            ("pause_nodes", self.pause_nodes.as_slice()),
        ] {
            for id in ids {
                if !node_index.contains_key(id) {
                    return Err(EngineError::validation_field(
                        format!("{field} references unknown node '{id}'"),
                        field,
                    ));
                }
            }
        }

        if self.terminal_nodes.is_empty() {
            return Err(EngineError::validation_field(
                "graph declares no terminal nodes",
                "terminal_nodes",
            ));
        }

        // Structure graph for reachability queries. Self-loops are legal
        // (iterative refinement); the visit cap is the only loop guard.
        let mut dag = DiGraph::<&str, ()>::new();
        let mut petgraph_index: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            let idx = dag.add_node(node.id.as_str());
            petgraph_index.insert(node.id.as_str(), idx);
        }
        for edge in &self.edges {
            dag.add_edge(
                petgraph_index[edge.source.as_str()],
                petgraph_index[edge.target.as_str()],
                (),
            );
        }

        let entry_ids: Vec<&str> = std::iter::once(self.entry_node.as_str())
            .chain(self.entry_points.iter().map(|s| s.as_str()))
            .collect();
        let terminal_reachable = self.terminal_nodes.iter().any(|t| {
            entry_ids.iter().any(|e| {
                has_path_connecting(&dag, petgraph_index[*e], petgraph_index[t.as_str()], None)
            })
        });
        if !terminal_reachable {
            return Err(EngineError::validation_field(
                "no terminal node is reachable from the entry set",
                "terminal_nodes",
            ));
        }

        // Overlapping output keys are a validation error unless the two
        // nodes are path-connected: nodes joined by a directed path can
        // never be scheduled concurrently, so the overlap is mutually
        // exclusive by construction.
        let mut writers: HashMap<&str, Vec<&NodeSpec>> = HashMap::new();
        for node in &self.nodes {
            for key in &node.output_keys {
                writers.entry(key.as_str()).or_default().push(node);
            }
        }
        for (key, nodes) in &writers {
            for i in 0..nodes.len() {
                for j in (i + 1)..nodes.len() {
                    let (a, b) = (nodes[i], nodes[j]);
                    let ai = petgraph_index[a.id.as_str()];
                    let bi = petgraph_index[b.id.as_str()];
                    let connected = has_path_connecting(&dag, ai, bi, None)
                        || has_path_connecting(&dag, bi, ai, None);
                    if !connected {
                        return Err(EngineError::validation_field(
                            format!(
                                "nodes '{}' and '{}' both write '{key}' but are not \
                                 mutually exclusive",
                                a.id, b.id
                            ),
                            "nodes",
                        ));
                    }
                }
            }
        }

        // Compile CONDITIONAL expressions once; parse failures are load
        // errors, never run-time ones.
        let mut compiled = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            if let EdgeCondition::Conditional { expr } = &edge.condition {
                let parsed = Expr::parse(expr).map_err(|e| {
                    EngineError::validation_field(
                        format!("edge {} -> {}: {e}", edge.source, edge.target),
                        "edges",
                    )
                })?;
                compiled.insert(i, parsed);
            }
        }

        // Outgoing edge lists, pre-sorted by priority descending then
        // declaration order (sort_by_key is stable).
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in self.edges.iter().enumerate() {
            outgoing.entry(edge.source.clone()).or_default().push(i);
        }
        for indices in outgoing.values_mut() {
            indices.sort_by_key(|&i| std::cmp::Reverse(self.edges[i].priority));
        }

        for node in &self.nodes {
            let reachable = entry_ids.iter().any(|e| {
                has_path_connecting(&dag, petgraph_index[*e], petgraph_index[node.id.as_str()], None)
            });
            if !reachable {
                warn!(node = %node.id, graph = %self.id, "node is unreachable from the entry set");
            }
        }

        let mut direct_edges = HashSet::new();
        for edge in &self.edges {
            direct_edges.insert((edge.source.clone(), edge.target.clone()));
        }

        let nullable_keys = self
            .nodes
            .iter()
            .flat_map(|n| n.nullable_output_keys.iter().cloned())
            .collect();

        Ok(Graph {
            spec: self,
            node_index,
            outgoing,
            compiled,
            direct_edges,
            nullable_keys,
        })
    }
}

/// Validated, executable form of a [`GraphSpec`]: the immutable spec plus
/// compiled expressions and pre-computed adjacency.
#[derive(Debug)]
pub struct Graph {
    spec: GraphSpec,
    node_index: HashMap<String, usize>,
    /// Per-node outgoing edge indices, priority-desc then declaration order.
    outgoing: HashMap<String, Vec<usize>>,
    /// Compiled CONDITIONAL expressions keyed by edge index.
    compiled: HashMap<usize, Expr>,
    direct_edges: HashSet<(String, String)>,
    /// Keys some node declares as a nullable output. Inputs naming such a
    /// key are not required for readiness.
    nullable_keys: HashSet<String>,
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn goal_id(&self) -> &str {
        &self.spec.goal_id
    }

    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.node_index.get(id).map(|&i| &self.spec.nodes[i])
    }

    /// Entry node plus any additional entry points, deduplicated.
    pub fn entry_set(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.spec.entry_node)
            .chain(self.spec.entry_points.iter())
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.spec.terminal_nodes.iter().any(|t| t == id)
    }

    pub fn is_pause(&self, id: &str) -> bool {
        self.spec.pause_nodes.iter().any(|p| p == id)
    }

    /// Outgoing edges of a node in evaluation order.
    pub fn outgoing_edges(&self, id: &str) -> impl Iterator<Item = (usize, &EdgeSpec)> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| (i, &self.spec.edges[i]))
    }

    pub fn compiled_expr(&self, edge_index: usize) -> Option<&Expr> {
        self.compiled.get(&edge_index)
    }

    /// Input keys that must be present before the node may run: declared
    /// inputs minus keys some producer marks nullable.
    pub fn required_input_keys(&self, node: &NodeSpec) -> Vec<String> {
        node.input_keys
            .iter()
            .filter(|k| !self.nullable_keys.contains(k.as_str()))
            .cloned()
            .collect()
    }

    /// Whether two nodes share a direct edge in either direction.
    pub fn edge_related(&self, a: &str, b: &str) -> bool {
        self.direct_edges.contains(&(a.to_string(), b.to_string()))
            || self.direct_edges.contains(&(b.to_string(), a.to_string()))
    }
}
