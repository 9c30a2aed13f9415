//! Shared slot/allocation types.

use std::time::Duration;

use crate::ids::{AllocationId, SlotId, SlotRequestId, WorkerId};
use crate::resource::ResourceProfile;

/// A slot's lifecycle state. Transitions form the sequence
/// `(FREE -> (PENDING -> (ALLOCATED -> FREE)?)?)*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Pending,
    Allocated,
}

impl SlotState {
    /// Whether `self -> next` is a legal transition per the grammar above.
    pub fn can_transition_to(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Free, SlotState::Pending)
                | (SlotState::Pending, SlotState::Allocated)
                | (SlotState::Pending, SlotState::Free)
                | (SlotState::Allocated, SlotState::Free)
        )
    }
}

/// A worker's advertisement of one physical slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotOffer {
    pub slot_id: SlotId,
    pub allocation_id: AllocationId,
    pub resources: ResourceProfile,
}

/// A slot bound to a request: the payload handed back to the caller of
/// `request_new_slot` once it completes.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedSlot {
    pub slot_id: SlotId,
    pub allocation_id: AllocationId,
    pub worker_id: WorkerId,
    pub resources: ResourceProfile,
}

/// Whether a pending request should fail as soon as no slot currently
/// matches (`Streaming`), or should defer failure until the broker
/// determines no worker can *ever* satisfy it (`Batch`)
/// "Idle timeouts".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRequestMode {
    Streaming,
    Batch,
}

#[derive(Debug, Clone, Copy)]
pub struct SlotPoolTimeouts {
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for SlotPoolTimeouts {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Identifies the originator of a request for logging/diagnostics; not
/// interpreted by the pool itself.
pub type RequestLabel = SlotRequestId;
