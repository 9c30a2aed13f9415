//! Task-execution runtime core of a distributed stream-processing engine:
//! graph compilation, slot allocation and sharing, the shuffle input path,
//! and checkpoint barrier handling.
//!
//! Cluster resource providers, the embedded RPC transport, on-disk state
//! backends, user operator code, and connectors to external systems are
//! out of scope — they're the collaborators this crate's traits
//! (`ResourceActions`, `ShuffleTransport`, `ChannelStateWriter`, `TaskBody`)
//! are built to plug into.

pub mod config;
pub mod error;
pub mod graph;
pub mod ids;
pub mod resource;
pub mod shuffle;
pub mod slot;
pub mod worker;

pub use config::{ConfigError, ResourceActions, RuntimeConfig};
pub use error::{ErrorKind, TaskFailureCause};
pub use ids::{AllocationId, BlockId, CoordUInt, JobId, LogicalNodeId, SlotId, SubtaskCoord, WorkerId};
pub use resource::ResourceProfile;
