//! Identifiers shared across the graph, slot and shuffle subsystems.
//!
//! Kept in one place (mirroring how `renoir` centralizes `BlockId`/`HostId`
//! behind `crate::scheduler`) so that every component agrees on the same
//! newtypes instead of passing around bare integers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinate type used for parallelism, indices and counts throughout the
/// runtime.
pub type CoordUInt = u64;

macro_rules! id_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[derive(serde::Serialize, serde::Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

id_newtype!(WorkerId, "Identifier of a registered worker in the cluster.");
id_newtype!(JobId, "Identifier of a submitted job.");
id_newtype!(
    LogicalNodeId,
    "Identifier of a logical operator node in the user's DAG."
);

/// Identifier of a physical vertex (a fused chain) in the compiled job
/// graph. Its value is the chain-root hash computed by
/// `graph::hashing::compute_node_hashes`, so it's rendered as hex (like any
/// other hash-derived identifier) rather than decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Index of a slot inside a worker's advertised slot set. Combined with a
/// [`WorkerId`] this forms a globally unique slot identity, see [`SlotId`].
pub type SlotIndex = u32;

/// Globally unique identity of a physical slot: `(worker-id, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub worker_id: WorkerId,
    pub index: SlotIndex,
}

impl SlotId {
    pub fn new(worker_id: WorkerId, index: SlotIndex) -> Self {
        Self { worker_id, index }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.worker_id, self.index)
    }
}

/// Monotonically increasing generator for request/allocation identifiers.
///
/// Each pool/manager keeps its own counter; identifiers are only compared
/// for equality within the scope of the owning component: each is an
/// opaque identifier minted by its own pool.
#[derive(Debug)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

id_newtype!(AllocationId, "Opaque identifier minted per concrete slot assignment.");
id_newtype!(SlotRequestId, "Identifier of a pending slot request inside a job's slot pool.");

/// Coordinates of one subtask instance: which physical vertex, and which
/// parallel instance of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubtaskCoord {
    pub block_id: BlockId,
    pub subtask_index: CoordUInt,
}

impl fmt::Display for SubtaskCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.block_id, self.subtask_index)
    }
}
