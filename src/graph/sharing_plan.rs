//! Slot-sharing group assignment and managed-memory fraction computation.

use std::collections::HashMap;

use crate::graph::physical::{PartitionType, PhysicalGraph};
use crate::ids::BlockId;

/// A scope managed memory is requested for; slot-scope use-cases reserve
/// their whole fraction on a single operator, operator-scope use-cases
/// split proportionally by weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUseCase {
    OperatorScope,
    SlotScope,
}

/// Assigns a slot-sharing group to every physical vertex.
///
/// Default policy: every vertex in one pipelined region (a maximal run of
/// vertices connected by non-blocking edges) shares one group, named after
/// the smallest [`BlockId`] in the region. A vertex whose chain head came
/// from a logical node with an explicit `sharing_group` always uses that
/// name instead, overriding the default.
pub fn assign_sharing_groups(
    graph: &PhysicalGraph,
    explicit_groups: &HashMap<BlockId, String>,
) -> HashMap<BlockId, String> {
    let mut parent: HashMap<BlockId, BlockId> = graph.vertices.keys().map(|&id| (id, id)).collect();

    fn find(parent: &mut HashMap<BlockId, BlockId>, x: BlockId) -> BlockId {
        let p = parent[&x];
        if p == x {
            x
        } else {
            let root = find(parent, p);
            parent.insert(x, root);
            root
        }
    }

    fn union(parent: &mut HashMap<BlockId, BlockId>, a: BlockId, b: BlockId) {
        let ra = find(parent, a);
        let rb = find(parent, b);
        if ra != rb {
            let (lo, hi) = if ra.0 <= rb.0 { (ra, rb) } else { (rb, ra) };
            parent.insert(hi, lo);
        }
    }

    for edge in &graph.edges {
        if edge.partition_type != PartitionType::Blocking {
            union(&mut parent, edge.source, edge.target);
        }
    }

    let mut assignment = HashMap::with_capacity(graph.vertices.len());
    for &id in graph.vertices.keys() {
        if let Some(name) = explicit_groups.get(&id) {
            assignment.insert(id, name.clone());
        } else {
            let root = find(&mut parent, id);
            assignment.insert(id, format!("default-group-{}", root));
        }
    }
    assignment
}

/// Computes each vertex's managed-memory fraction within its sharing group,
/// for a given use-case.
///
/// Operator-scope fractions are `weight / group_weight`, rounded down to 3
/// decimal digits, rounded down rather than to nearest, without implying
/// a specific fixed-point format. Slot-scope use-cases reserve
/// the whole slot for a single vertex: `1.0` for that vertex, `0.0` for
/// every sibling.
pub fn managed_memory_fractions(
    graph: &PhysicalGraph,
    sharing_groups: &HashMap<BlockId, String>,
    weights: &HashMap<BlockId, f64>,
    use_case: MemoryUseCase,
) -> HashMap<BlockId, f64> {
    let mut group_weight: HashMap<&str, f64> = HashMap::new();
    for (&id, group) in sharing_groups {
        let w = weights.get(&id).copied().unwrap_or(1.0);
        *group_weight.entry(group.as_str()).or_insert(0.0) += w;
    }

    let mut out = HashMap::with_capacity(graph.vertices.len());
    match use_case {
        MemoryUseCase::OperatorScope => {
            for (&id, group) in sharing_groups {
                let w = weights.get(&id).copied().unwrap_or(1.0);
                let total = group_weight[group.as_str()];
                let fraction = if total > 0.0 { w / total } else { 0.0 };
                out.insert(id, round_down(fraction, 3));
            }
        }
        MemoryUseCase::SlotScope => {
            // The vertex with the largest weight in each group claims the
            // whole slot fraction; ties break on the smaller BlockId for
            // determinism.
            let mut winner_per_group: HashMap<&str, BlockId> = HashMap::new();
            let mut best_weight: HashMap<&str, f64> = HashMap::new();
            let mut ids: Vec<_> = sharing_groups.keys().copied().collect();
            ids.sort();
            for id in ids {
                let group = sharing_groups[&id].as_str();
                let w = weights.get(&id).copied().unwrap_or(1.0);
                let cur_best = best_weight.get(group).copied().unwrap_or(f64::MIN);
                if w > cur_best {
                    best_weight.insert(group, w);
                    winner_per_group.insert(group, id);
                }
            }
            for (&id, group) in sharing_groups {
                let is_winner = winner_per_group.get(group.as_str()) == Some(&id);
                out.insert(id, if is_winner { 1.0 } else { 0.0 });
            }
        }
    }
    out
}

fn round_down(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::physical::*;

    fn vtx(id: u64) -> PhysicalVertex {
        PhysicalVertex {
            id: BlockId(id),
            chain_head_hash: 0,
            members: vec![ChainMember {
                logical_id: crate::ids::LogicalNodeId(id),
                chain_index: 0,
                config: serde_json::Value::Null,
            }],
            parallelism: 1,
            max_parallelism: 1,
            resources: Default::default(),
            sharing_group: String::new(),
            co_location_key: None,
        }
    }

    fn graph_with(edges: Vec<PhysicalEdge>) -> PhysicalGraph {
        let mut vertices = std::collections::HashMap::new();
        for e in &edges {
            vertices.entry(e.source).or_insert_with(|| vtx(e.source.0));
            vertices.entry(e.target).or_insert_with(|| vtx(e.target.0));
        }
        PhysicalGraph {
            vertices,
            edges,
            checkpoint_settings: CheckpointSettings {
                interval_ms: 1000,
                timeout_ms: 1000,
                alignment_timeout_ms: 0,
                retention: RetentionPolicy::DeleteOnCancellation,
                triggers: vec![],
                ack_and_commit: vec![],
            },
        }
    }

    #[test]
    fn pipelined_region_shares_one_group() {
        let edges = vec![PhysicalEdge {
            source: BlockId(1),
            target: BlockId(2),
            distribution: DistributionPattern::PointWise,
            partition_type: PartitionType::PipelinedBounded,
            partitioner: crate::graph::logical::Partitioner::Forward,
        }];
        let g = graph_with(edges);
        let assignment = assign_sharing_groups(&g, &std::collections::HashMap::new());
        assert_eq!(assignment[&BlockId(1)], assignment[&BlockId(2)]);
    }

    #[test]
    fn blocking_edge_breaks_the_region() {
        let edges = vec![PhysicalEdge {
            source: BlockId(1),
            target: BlockId(2),
            distribution: DistributionPattern::AllToAll,
            partition_type: PartitionType::Blocking,
            partitioner: crate::graph::logical::Partitioner::Hash,
        }];
        let g = graph_with(edges);
        let assignment = assign_sharing_groups(&g, &std::collections::HashMap::new());
        assert_ne!(assignment[&BlockId(1)], assignment[&BlockId(2)]);
    }

    #[test]
    fn explicit_group_overrides_default() {
        let edges = vec![PhysicalEdge {
            source: BlockId(1),
            target: BlockId(2),
            distribution: DistributionPattern::PointWise,
            partition_type: PartitionType::PipelinedBounded,
            partitioner: crate::graph::logical::Partitioner::Forward,
        }];
        let g = graph_with(edges);
        let mut explicit = std::collections::HashMap::new();
        explicit.insert(BlockId(1), "pinned".to_string());
        let assignment = assign_sharing_groups(&g, &explicit);
        assert_eq!(assignment[&BlockId(1)], "pinned");
        assert_ne!(assignment[&BlockId(1)], assignment[&BlockId(2)]);
    }

    #[test]
    fn operator_scope_fractions_sum_to_one_per_group() {
        let edges = vec![PhysicalEdge {
            source: BlockId(1),
            target: BlockId(2),
            distribution: DistributionPattern::PointWise,
            partition_type: PartitionType::PipelinedBounded,
            partitioner: crate::graph::logical::Partitioner::Forward,
        }];
        let g = graph_with(edges);
        let assignment = assign_sharing_groups(&g, &std::collections::HashMap::new());
        let mut weights = std::collections::HashMap::new();
        weights.insert(BlockId(1), 1.0);
        weights.insert(BlockId(2), 3.0);
        let fractions =
            managed_memory_fractions(&g, &assignment, &weights, MemoryUseCase::OperatorScope);
        assert_eq!(fractions[&BlockId(1)], 0.25);
        assert_eq!(fractions[&BlockId(2)], 0.75);
    }
}
