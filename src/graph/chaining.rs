//! Chain-fusion rules.

use crate::graph::logical::{LogicalEdge, LogicalGraph, LogicalNode};

/// Whether `edge` (from `source` to `target`) may be fused into a single
/// physical vertex, given that chaining is globally enabled.
///
/// All seven conditions below must hold:
/// 1. same slot-sharing group;
/// 2. source's policy allows chaining as a source, and target's allows it
///    as a sink (which for `HeadWithSources` additionally requires the
///    source to be a source operator);
/// 3. the edge partitioner is forward;
/// 4. the edge's exchange mode is not batch;
/// 5. parallelisms are equal;
/// 6. the target has exactly one inbound edge on this edge's input slot;
/// 7. chaining is globally enabled.
pub(crate) fn is_fusable(
    graph: &LogicalGraph,
    edge: &LogicalEdge,
    source: &LogicalNode,
    target: &LogicalNode,
    chaining_enabled: bool,
) -> bool {
    if !chaining_enabled {
        return false;
    }
    if source.sharing_group != target.sharing_group {
        return false;
    }
    if !source.chaining_strategy.allows_chaining_as_source() {
        return false;
    }
    let source_is_source_op = graph.is_source_op(source.id);
    if !target
        .chaining_strategy
        .allows_chaining_as_sink(source_is_source_op)
    {
        return false;
    }
    if !edge.partitioner.is_forward() {
        return false;
    }
    if edge.exchange_mode.is_batch() {
        return false;
    }
    if source.parallelism != target.parallelism {
        return false;
    }
    let inbound_on_slot = graph
        .incoming(target.id)
        .filter(|e| e.target_input_slot == edge.target_input_slot)
        .count();
    if inbound_on_slot != 1 {
        return false;
    }
    true
}
