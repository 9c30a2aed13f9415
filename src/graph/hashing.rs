//! Deterministic chain-root hashing.
//!
//! Two compilations of the same logical graph must produce bit-identical
//! physical vertex identifiers, the prerequisite for savepoint
//! compatibility. We derive each logical node's hash from a stable tuple
//! `(op_kind, input_hashes, user_hash, inbound_edge_type_numbers)` visited
//! in a deterministic breadth-first order, the same shape of derivation
//! `renoir::block::group_by_hash` uses for its keying hash, built on the
//! same `wyhash` already in use elsewhere for hashmap keys.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use crate::graph::logical::LogicalGraph;
use crate::ids::LogicalNodeId;

const HASH_SEED: u64 = 0x0123_4567_89ab_cdef;

/// Deterministic 64-bit hash of a logical node, stable across repeated
/// compilations of the same (unchanged) graph.
pub type ChainHash = u64;

/// Computes the deterministic hash of every node in `graph`.
///
/// Traversal order: breadth-first from the (id-sorted) source nodes, so
/// that the order in which edges were added to the graph never affects the
/// result.
pub fn compute_node_hashes(graph: &LogicalGraph) -> HashMap<LogicalNodeId, ChainHash> {
    let mut hashes = HashMap::with_capacity(graph.nodes.len());
    let mut queue: VecDeque<LogicalNodeId> = graph.sources().into_iter().collect();
    let mut visited: std::collections::HashSet<LogicalNodeId> = queue.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        let node = match graph.nodes.get(&id) {
            Some(n) => n,
            None => continue,
        };

        let mut incoming: Vec<_> = graph.incoming(id).collect();
        incoming.sort_by_key(|e| (e.source, e.target_input_slot));
        let input_hashes: Vec<ChainHash> = incoming
            .iter()
            .map(|e| *hashes.get(&e.source).unwrap_or(&0))
            .collect();
        let edge_type_numbers: Vec<u8> = incoming.iter().map(|e| edge_type_number(e)).collect();

        let mut hasher = wyhash::WyHash::with_seed(HASH_SEED);
        node.op_kind.hash(&mut hasher);
        input_hashes.hash(&mut hasher);
        node.user_hash.hash(&mut hasher);
        edge_type_numbers.hash(&mut hasher);
        let h = hasher.finish();
        hashes.insert(id, h);

        let mut next: Vec<_> = graph.outgoing(id).map(|e| e.target).collect();
        next.sort();
        for target in next {
            if visited.insert(target) {
                queue.push_back(target);
            }
        }
    }

    hashes
}

fn edge_type_number(edge: &crate::graph::logical::LogicalEdge) -> u8 {
    use crate::graph::logical::Partitioner::*;
    match edge.partitioner {
        Forward => 0,
        Rescale => 1,
        Hash => 2,
        Broadcast => 3,
        Rebalance => 4,
        Custom => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::logical::*;

    fn node(id: u64, kind: &str) -> LogicalNode {
        LogicalNode {
            id: LogicalNodeId(id),
            op_kind: kind.to_string(),
            parallelism: 1,
            max_parallelism: 128,
            sharing_group: None,
            co_location_key: None,
            chaining_strategy: ChainingStrategy::Always,
            resources: Default::default(),
            user_hash: None,
        }
    }

    #[test]
    fn repeated_compilation_is_bit_identical() {
        let mut g = LogicalGraph::new();
        g.add_node(node(1, "source"));
        g.add_node(node(2, "map"));
        g.add_edge(LogicalEdge {
            source: LogicalNodeId(1),
            target: LogicalNodeId(2),
            partitioner: Partitioner::Forward,
            exchange_mode: ExchangeMode::Pipelined,
            target_input_slot: 0,
        });

        let h1 = compute_node_hashes(&g);
        let h2 = compute_node_hashes(&g);
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_op_kind_changes_hash() {
        let mut g1 = LogicalGraph::new();
        g1.add_node(node(1, "source"));
        let mut g2 = LogicalGraph::new();
        g2.add_node(node(1, "source_v2"));

        assert_ne!(
            compute_node_hashes(&g1)[&LogicalNodeId(1)],
            compute_node_hashes(&g2)[&LogicalNodeId(1)]
        );
    }

    #[test]
    fn user_hash_pins_identity_even_if_kind_changes_position() {
        let mut g = LogicalGraph::new();
        let mut n = node(1, "source");
        n.user_hash = Some(42);
        g.add_node(n);
        let mut g2 = LogicalGraph::new();
        let mut n2 = node(1, "source");
        n2.user_hash = Some(42);
        g2.add_node(n2);

        assert_eq!(
            compute_node_hashes(&g)[&LogicalNodeId(1)],
            compute_node_hashes(&g2)[&LogicalNodeId(1)]
        );
    }
}
