//! Graph compilation: logical DAG -> physical job graph.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;

use crate::graph::chaining::is_fusable;
use crate::graph::hashing::compute_node_hashes;
use crate::graph::logical::{ExchangeMode, LogicalGraph, LogicalNodeId};
use crate::graph::physical::{
    CheckpointSettings, ChainMember, DistributionPattern, PartitionType, PhysicalEdge,
    PhysicalGraph, PhysicalVertex, RetentionPolicy,
};
use crate::graph::sharing_plan::assign_sharing_groups;
use crate::ids::BlockId;

#[derive(Debug, Error)]
pub enum GraphCompileError {
    #[error("invalid logical graph: {0}")]
    InvalidGraph(String),
}

/// Settings the caller supplies for the checkpoint coordinator; the
/// compiler folds these, plus the trigger/ack/commit vertex sets it derives
/// from topology, into [`CheckpointSettings`].
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub alignment_timeout_ms: u64,
    pub retention: RetentionPolicy,
}

/// Compiles `graph` into a physical job graph.
///
/// `chaining_enabled` corresponds to fusion condition 7 ("chaining is
/// globally enabled"); `explicit_sharing_groups` lets the caller pin a
/// logical node's chain to a specific slot-sharing group name, overriding
/// the compiler's default per-pipelined-region grouping.
///
/// Compiling the same `graph` twice (with the same parameters) yields a
/// bit-identical [`PhysicalGraph`]: every [`BlockId`] is a pure function of
/// the logical graph's topology and hints.
pub fn compile(
    graph: &LogicalGraph,
    chaining_enabled: bool,
    checkpoint_config: &CheckpointConfig,
) -> Result<PhysicalGraph, GraphCompileError> {
    graph.validate().map_err(GraphCompileError::InvalidGraph)?;

    let hashes = compute_node_hashes(graph);
    let block_id_of = |id: LogicalNodeId| -> BlockId { BlockId(hashes[&id]) };

    let mut members_by_block: HashMap<BlockId, Vec<ChainMember>> = HashMap::new();
    let mut physical_edges: Vec<PhysicalEdge> = Vec::new();
    let mut visited_roots: HashSet<LogicalNodeId> = HashSet::new();
    let mut queue: VecDeque<LogicalNodeId> = graph.sources().into_iter().collect();
    for id in &queue {
        visited_roots.insert(*id);
    }

    while let Some(root) = queue.pop_front() {
        let block_id = block_id_of(root);
        let mut members = Vec::new();
        let mut current = root;
        let mut chain_index = 0u32;

        loop {
            let node = graph
                .nodes
                .get(&current)
                .ok_or_else(|| GraphCompileError::InvalidGraph(format!("missing node {current}")))?;
            members.push(ChainMember {
                logical_id: current,
                chain_index,
                config: node_config(node),
            });

            let mut outgoing: Vec<_> = graph.outgoing(current).collect();
            outgoing.sort_by_key(|e| (e.target, e.target_input_slot));

            let mut fused_next = None;
            for edge in &outgoing {
                let target = graph.nodes.get(&edge.target).ok_or_else(|| {
                    GraphCompileError::InvalidGraph(format!("missing node {}", edge.target))
                })?;
                if fused_next.is_none() && is_fusable(graph, edge, node, target, chaining_enabled) {
                    fused_next = Some(edge.target);
                } else {
                    physical_edges.push(PhysicalEdge {
                        source: block_id,
                        target: block_id_of(edge.target),
                        distribution: distribution_pattern(edge.partitioner),
                        partition_type: PartitionType::from_exchange_mode(edge.exchange_mode),
                        partitioner: edge.partitioner,
                    });
                    if visited_roots.insert(edge.target) {
                        queue.push_back(edge.target);
                    }
                }
            }

            match fused_next {
                Some(next) => {
                    current = next;
                    chain_index += 1;
                }
                None => break,
            }
        }

        members_by_block.insert(block_id, members);
    }

    let mut vertices = HashMap::with_capacity(members_by_block.len());
    for (block_id, members) in members_by_block {
        let head = graph.nodes[&members[0].logical_id].clone();
        let mut resources = crate::resource::ResourceProfile::ZERO;
        for m in &members {
            resources = resources.merge(&graph.nodes[&m.logical_id].resources);
        }
        vertices.insert(
            block_id,
            PhysicalVertex {
                id: block_id,
                chain_head_hash: hashes[&head.id],
                members,
                parallelism: head.parallelism,
                max_parallelism: head.max_parallelism,
                resources,
                sharing_group: String::new(), // filled in below
                co_location_key: head.co_location_key.clone(),
            },
        );
    }

    let mut explicit_groups = HashMap::new();
    for v in vertices.values() {
        if let Some(g) = &graph.nodes[&v.chain_head().logical_id].sharing_group {
            explicit_groups.insert(v.id, g.clone());
        }
    }

    let mut physical_graph = PhysicalGraph {
        vertices,
        edges: physical_edges,
        checkpoint_settings: CheckpointSettings {
            interval_ms: checkpoint_config.interval_ms,
            timeout_ms: checkpoint_config.timeout_ms,
            alignment_timeout_ms: checkpoint_config.alignment_timeout_ms,
            retention: checkpoint_config.retention,
            triggers: vec![],
            ack_and_commit: vec![],
        },
    };

    let groups = assign_sharing_groups(&physical_graph, &explicit_groups);
    for (id, group) in groups {
        physical_graph.vertices.get_mut(&id).unwrap().sharing_group = group;
    }

    let mut all_ids: Vec<BlockId> = physical_graph.vertices.keys().copied().collect();
    all_ids.sort();
    let triggers: Vec<BlockId> = all_ids
        .iter()
        .copied()
        .filter(|id| physical_graph.incoming(*id).next().is_none())
        .collect();
    physical_graph.checkpoint_settings.triggers = triggers;
    physical_graph.checkpoint_settings.ack_and_commit = all_ids;

    Ok(physical_graph)
}

fn distribution_pattern(partitioner: crate::graph::logical::Partitioner) -> DistributionPattern {
    use crate::graph::logical::Partitioner::*;
    match partitioner {
        Forward | Rescale => DistributionPattern::PointWise,
        Hash | Broadcast | Rebalance | Custom => DistributionPattern::AllToAll,
    }
}

fn node_config(node: &crate::graph::logical::LogicalNode) -> serde_json::Value {
    #[derive(Serialize)]
    struct Cfg<'a> {
        op_kind: &'a str,
        parallelism: crate::ids::CoordUInt,
    }
    serde_json::to_value(Cfg {
        op_kind: &node.op_kind,
        parallelism: node.parallelism,
    })
    .unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::logical::*;
    use crate::ids::LogicalNodeId;

    fn node(
        id: u64,
        kind: &str,
        parallelism: u64,
        strategy: ChainingStrategy,
    ) -> LogicalNode {
        LogicalNode {
            id: LogicalNodeId(id),
            op_kind: kind.into(),
            parallelism,
            max_parallelism: 128,
            sharing_group: None,
            co_location_key: None,
            chaining_strategy: strategy,
            resources: Default::default(),
            user_hash: None,
        }
    }

    fn default_cfg() -> CheckpointConfig {
        CheckpointConfig {
            interval_ms: 1000,
            timeout_ms: 60_000,
            alignment_timeout_ms: 0,
            retention: RetentionPolicy::DeleteOnCancellation,
        }
    }

    /// Scenario: Source(1, HEAD_WITH_SOURCES) -[forward]->
    /// FlatMap(4, ALWAYS) -[hash]-> Window(4, ALWAYS) -[forward]-> Sink(4,
    /// ALWAYS). Expect 3 physical vertices: {Source}, {FlatMap},
    /// {Window->Sink} — the Source->FlatMap forward edge doesn't fuse
    /// because parallelisms differ, the FlatMap->Window edge is a hash
    /// partition (boundary), and Window->Sink fuses since both sides chain
    /// ALWAYS at equal parallelism over a forward edge.
    fn build_scenario_graph() -> LogicalGraph {
        let mut g = LogicalGraph::new();
        g.add_node(node(1, "source", 1, ChainingStrategy::HeadWithSources));
        g.add_node(node(2, "flat_map", 4, ChainingStrategy::Always));
        g.add_node(node(3, "window", 4, ChainingStrategy::Always));
        g.add_node(node(4, "sink", 4, ChainingStrategy::Always));
        g.add_edge(LogicalEdge {
            source: LogicalNodeId(1),
            target: LogicalNodeId(2),
            partitioner: Partitioner::Forward,
            exchange_mode: ExchangeMode::Pipelined,
            target_input_slot: 0,
        });
        g.add_edge(LogicalEdge {
            source: LogicalNodeId(2),
            target: LogicalNodeId(3),
            partitioner: Partitioner::Hash,
            exchange_mode: ExchangeMode::Pipelined,
            target_input_slot: 0,
        });
        g.add_edge(LogicalEdge {
            source: LogicalNodeId(3),
            target: LogicalNodeId(4),
            partitioner: Partitioner::Forward,
            exchange_mode: ExchangeMode::Pipelined,
            target_input_slot: 0,
        });
        g
    }

    #[test]
    fn chain_fusion_matches_seed_scenario() {
        let g = build_scenario_graph();
        let cfg = default_cfg();
        let physical = compile(&g, true, &cfg).unwrap();
        assert_eq!(physical.vertices.len(), 3);
        let window_and_sink = physical
            .vertices
            .values()
            .find(|v| v.members.len() == 2)
            .expect("window+sink should be fused into one vertex");
        assert_eq!(window_and_sink.members[0].logical_id, LogicalNodeId(3));
        assert_eq!(window_and_sink.members[1].logical_id, LogicalNodeId(4));
    }

    #[test]
    fn compile_is_deterministic_across_invocations() {
        let g = build_scenario_graph();
        let cfg = default_cfg();
        let p1 = compile(&g, true, &cfg).unwrap();
        let p2 = compile(&g, true, &cfg).unwrap();
        let mut ids1: Vec<_> = p1.vertices.keys().copied().collect();
        let mut ids2: Vec<_> = p2.vertices.keys().copied().collect();
        ids1.sort();
        ids2.sort();
        assert_eq!(ids1, ids2);
        for id in ids1 {
            assert_eq!(
                p1.vertices[&id].chain_head_hash,
                p2.vertices[&id].chain_head_hash
            );
        }
    }

    #[test]
    fn source_triggers_checkpoint() {
        let g = build_scenario_graph();
        let cfg = default_cfg();
        let physical = compile(&g, true, &cfg).unwrap();
        assert_eq!(physical.checkpoint_settings.triggers.len(), 1);
        let trigger = physical.checkpoint_settings.triggers[0];
        assert_eq!(physical.vertices[&trigger].chain_head().logical_id, LogicalNodeId(1));
    }

    #[test]
    fn parallelism_exceeding_max_is_rejected() {
        let mut g = LogicalGraph::new();
        let mut n = node(1, "source", 5, ChainingStrategy::Always);
        n.max_parallelism = 4;
        g.add_node(n);
        let cfg = default_cfg();
        assert!(compile(&g, true, &cfg).is_err());
    }
}
