//! The logical operator DAG: the input to graph compilation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::LogicalNodeId;
use crate::resource::ResourceProfile;

/// Policy controlling whether an operator may be fused with its upstream
/// neighbour into a single physical vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainingStrategy {
    /// Never chains with anything, up or downstream.
    Never,
    /// Chains freely as long as the other fusion conditions hold.
    Always,
    /// May only be the head of a chain.
    Head,
    /// May be the head of a chain, and also chains with upstream sources.
    HeadWithSources,
}

impl ChainingStrategy {
    /// Whether a node with this policy may sit as the *source* side of a
    /// fusable edge.
    pub(crate) fn allows_chaining_as_source(self) -> bool {
        matches!(
            self,
            ChainingStrategy::Always | ChainingStrategy::Head | ChainingStrategy::HeadWithSources
        )
    }

    /// Whether a node with this policy may sit as the *sink* side of a
    /// fusable edge, given whether the upstream node is itself a source
    /// operator (no inbound edges).
    pub(crate) fn allows_chaining_as_sink(self, source_is_source_op: bool) -> bool {
        match self {
            ChainingStrategy::Always => true,
            ChainingStrategy::HeadWithSources => source_is_source_op,
            ChainingStrategy::Head | ChainingStrategy::Never => false,
        }
    }
}

/// How a logical edge distributes records across the downstream instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partitioner {
    /// Index-preserving: instance `i` upstream feeds instance `i` downstream
    /// only (requires equal parallelism).
    Forward,
    /// Round-robins across a subset of downstream instances when
    /// parallelism changes.
    Rescale,
    /// Partitions by a key hash.
    Hash,
    /// Sends every record to every downstream instance.
    Broadcast,
    /// Round-robins across all downstream instances.
    Rebalance,
    /// User-provided partitioning function; opaque to the compiler.
    Custom,
}

impl Partitioner {
    pub fn is_forward(self) -> bool {
        matches!(self, Partitioner::Forward)
    }
}

/// Whether an edge is streamed eagerly or materialized fully before the
/// consumer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeMode {
    Pipelined,
    Blocking,
    Undefined,
}

impl ExchangeMode {
    pub(crate) fn is_batch(self) -> bool {
        matches!(self, ExchangeMode::Blocking)
    }
}

/// One node of the user's logical dataflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalNode {
    pub id: LogicalNodeId,
    /// Human-readable operator kind, stable across submissions (e.g.
    /// `"flat_map"`, `"window"`); feeds the deterministic hash.
    pub op_kind: String,
    pub parallelism: crate::ids::CoordUInt,
    pub max_parallelism: crate::ids::CoordUInt,
    /// Vertices sharing this key may share a slot; `None` falls back to the
    /// default per-region grouping computed by the compiler.
    pub sharing_group: Option<String>,
    /// Subtasks of equal index across nodes sharing a co-location key are
    /// pinned to the same physical slot.
    pub co_location_key: Option<String>,
    pub chaining_strategy: ChainingStrategy,
    pub resources: ResourceProfile,
    /// Explicit user-provided hash seed (stable across submissions even if
    /// the node's position in the DAG changes), consumed by the
    /// deterministic hasher.
    pub user_hash: Option<u64>,
}

impl LogicalNode {
    /// Invariant: `1 <= parallelism <= max_parallelism`.
    pub fn validate(&self) -> Result<(), String> {
        if self.parallelism == 0 {
            return Err(format!("node {} has parallelism 0", self.id));
        }
        if self.parallelism > self.max_parallelism {
            return Err(format!(
                "node {} parallelism {} exceeds max_parallelism {}",
                self.id, self.parallelism, self.max_parallelism
            ));
        }
        Ok(())
    }
}

/// One edge of the user's logical dataflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogicalEdge {
    pub source: LogicalNodeId,
    pub target: LogicalNodeId,
    pub partitioner: Partitioner,
    pub exchange_mode: ExchangeMode,
    /// Which of the target's (possibly multiple) inputs this edge feeds;
    /// used by fusion rule 6 ("sink has exactly one inbound edge of this
    /// edge's input-slot").
    pub target_input_slot: u32,
}

/// The full logical DAG: nodes plus edges, as submitted by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicalGraph {
    pub nodes: HashMap<LogicalNodeId, LogicalNode>,
    pub edges: Vec<LogicalEdge>,
}

impl LogicalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: LogicalNode) -> &mut Self {
        self.nodes.insert(node.id, node);
        self
    }

    pub fn add_edge(&mut self, edge: LogicalEdge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub(crate) fn outgoing(&self, id: LogicalNodeId) -> impl Iterator<Item = &LogicalEdge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub(crate) fn incoming(&self, id: LogicalNodeId) -> impl Iterator<Item = &LogicalEdge> {
        self.edges.iter().filter(move |e| e.target == id)
    }

    /// Nodes with no inbound edges: the roots the compiler walks from.
    pub(crate) fn sources(&self) -> Vec<LogicalNodeId> {
        let mut ids: Vec<_> = self
            .nodes
            .keys()
            .copied()
            .filter(|id| self.incoming(*id).next().is_none())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_source_op(&self, id: LogicalNodeId) -> bool {
        self.incoming(id).next().is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        for node in self.nodes.values() {
            node.validate()?;
        }
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(format!("edge references unknown source {}", edge.source));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(format!("edge references unknown target {}", edge.target));
            }
        }
        Ok(())
    }
}
