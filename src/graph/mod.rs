//! Graph compilation: rewriting a logical operator DAG into a physical job
//! graph by fusing adjacent operators into chains.

pub mod chaining;
pub mod compiler;
pub mod hashing;
pub mod logical;
pub mod physical;
pub mod sharing_plan;

pub use compiler::{compile, CheckpointConfig, GraphCompileError};
pub use logical::{ChainingStrategy, ExchangeMode, LogicalEdge, LogicalGraph, LogicalNode, Partitioner};
pub use physical::{
    CheckpointSettings, ChainMember, DistributionPattern, PartitionType, PhysicalEdge,
    PhysicalGraph, PhysicalVertex, RetentionPolicy,
};
