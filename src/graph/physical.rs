//! The physical job graph: the output of graph compilation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::hashing::ChainHash;
use crate::graph::logical::{ExchangeMode, Partitioner};
use crate::ids::{BlockId, CoordUInt, LogicalNodeId};
use crate::resource::ResourceProfile;

/// How a physical edge distributes records between the parallel instances
/// of two physical vertices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionPattern {
    /// Instance `i` of the source only ever talks to instance `i` of the
    /// target (requires equal parallelism).
    PointWise,
    /// Every instance of the source may talk to every instance of the
    /// target.
    AllToAll,
}

/// The result-partition materialization strategy of a physical edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    /// Bounded pipeline: producer blocks when the consumer falls behind
    /// past a fixed number of in-flight buffers.
    PipelinedBounded,
    /// Pipelined with a soft, approximate backlog bound.
    PipelinedApproximate,
    /// Fully materialized before the consumer may start.
    Blocking,
}

impl PartitionType {
    pub fn from_exchange_mode(mode: ExchangeMode) -> PartitionType {
        match mode {
            ExchangeMode::Pipelined | ExchangeMode::Undefined => PartitionType::PipelinedBounded,
            ExchangeMode::Blocking => PartitionType::Blocking,
        }
    }
}

/// One member of a fused chain: the original logical node plus the index it
/// occupies inside the chain (0 = chain head).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainMember {
    pub logical_id: LogicalNodeId,
    pub chain_index: u32,
    /// Serialized configuration blob for this member, keyed by its original
    /// logical id so the deployed task can reconstruct the chain at
    /// start-up.
    pub config: serde_json::Value,
}

/// A node of the compiled job graph: one or more logical nodes fused into a
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalVertex {
    pub id: BlockId,
    /// Deterministic hash of the chain head, per `graph::hashing`.
    pub chain_head_hash: ChainHash,
    pub members: Vec<ChainMember>,
    pub parallelism: CoordUInt,
    pub max_parallelism: CoordUInt,
    pub resources: ResourceProfile,
    pub sharing_group: String,
    pub co_location_key: Option<String>,
}

impl PhysicalVertex {
    pub fn chain_head(&self) -> &ChainMember {
        &self.members[0]
    }
}

/// An edge of the compiled job graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhysicalEdge {
    pub source: BlockId,
    pub target: BlockId,
    pub distribution: DistributionPattern,
    pub partition_type: PartitionType,
    pub partitioner: Partitioner,
}

/// Checkpoint-related settings compiled onto the physical graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub alignment_timeout_ms: u64,
    pub retention: RetentionPolicy,
    /// Physical vertices that have no inbound edges: they inject barriers.
    pub triggers: Vec<BlockId>,
    /// Every vertex acknowledges and commits its part of the checkpoint.
    pub ack_and_commit: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicy {
    DeleteOnCancellation,
    RetainOnCancellation,
}

/// The fully compiled job graph, ready for slot-sharing assignment and
/// deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalGraph {
    pub vertices: HashMap<BlockId, PhysicalVertex>,
    pub edges: Vec<PhysicalEdge>,
    pub checkpoint_settings: CheckpointSettings,
}

impl PhysicalGraph {
    pub(crate) fn outgoing(&self, id: BlockId) -> impl Iterator<Item = &PhysicalEdge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub(crate) fn incoming(&self, id: BlockId) -> impl Iterator<Item = &PhysicalEdge> {
        self.edges.iter().filter(move |e| e.target == id)
    }
}
