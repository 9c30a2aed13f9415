//! Cross-cutting error kinds.
//!
//! Individual subsystems define their own `thiserror` enums (see
//! `shuffle::channel::ChannelError`, `slot::pool::SlotPoolError`, ...); this
//! module holds the classification those enums map into so that the task
//! runtime can apply one propagation policy regardless of which component
//! raised the error, the way `renoir::config::ConfigError` is a leaf type
//! but every caller in `config.rs` still reasons about it uniformly.

use std::fmt;

/// The error kinds the core distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient: the producer hasn't registered the subpartition yet.
    PartitionNotFound,
    /// Fatal to the channel: the producer released the partition.
    PartitionReleased,
    /// Fatal to every channel sharing the failed connection.
    Transport,
    /// A newer barrier already superseded this request.
    CheckpointSubsumed,
    /// Input reached end-of-stream before the barrier arrived, or user code
    /// declined the checkpoint.
    CheckpointDeclined,
    /// No slot can currently satisfy the request.
    NoResource,
    /// No slot will ever satisfy the request (rejected by the broker).
    UnfulfillableSlotRequest,
    /// The worker already bound that slot elsewhere.
    SlotOccupied,
    /// Generic failure to bind a slot.
    SlotAllocation,
    /// A request/alignment/rpc exceeded its deadline.
    Timeout,
    /// Cooperative cancellation; not a failure.
    Cancellation,
}

impl ErrorKind {
    /// Whether this kind is fatal to the owning task (as opposed to being
    /// retried locally or silently recorded).
    pub fn is_fatal_to_task(self) -> bool {
        !matches!(self, ErrorKind::PartitionNotFound | ErrorKind::Cancellation)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PartitionNotFound => "partition-not-found",
            ErrorKind::PartitionReleased => "partition-released",
            ErrorKind::Transport => "transport",
            ErrorKind::CheckpointSubsumed => "checkpoint-subsumed",
            ErrorKind::CheckpointDeclined => "checkpoint-declined",
            ErrorKind::NoResource => "no-resource",
            ErrorKind::UnfulfillableSlotRequest => "unfulfillable-slot-request",
            ErrorKind::SlotOccupied => "slot-occupied",
            ErrorKind::SlotAllocation => "slot-allocation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancellation => "cancellation",
        };
        f.write_str(s)
    }
}

/// The terminal cause a task records when it is torn down by a non-local
/// error, handed to the scheduler (an external collaborator, per §1) so it
/// can decide whether to restart the job.
#[derive(Debug, Clone)]
pub struct TaskFailureCause {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailureCause {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskFailureCause {}
