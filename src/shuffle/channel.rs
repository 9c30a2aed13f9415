//! Input channel contract and its four variants.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::{SubtaskCoord, WorkerId};
use crate::shuffle::buffer::{Buffer, DataType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(pub u64);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Identifies one channel within its owning gate; carried alongside every
/// buffer the gate returns so the reader knows which upstream it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelInfo {
    pub gate_index: u32,
    pub channel_index: u32,
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gate[{}]/channel[{}]", self.gate_index, self.channel_index)
    }
}

#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("partition {0} not found")]
    PartitionNotFound(PartitionId),
    #[error("partition {0} released")]
    PartitionReleased(PartitionId),
    #[error("transport error on connection to {0:?}: {1}")]
    Transport(Option<WorkerId>, String),
    #[error("cannot locate producer for task event")]
    ProducerUnavailable,
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::PartitionNotFound(_) => ErrorKind::PartitionNotFound,
            ChannelError::PartitionReleased(_) => ErrorKind::PartitionReleased,
            ChannelError::Transport(..) => ErrorKind::Transport,
            ChannelError::ProducerUnavailable => ErrorKind::Transport,
        }
    }
}

/// What `get_next_buffer` hands back: the payload, its type, how many more
/// buffers are already queued behind it on the producer side, and its
/// sequence number (monotonic modulo 2^32).
#[derive(Clone)]
pub struct BufferAndBacklog {
    pub buffer: Buffer,
    pub data_type: DataType,
    pub buffers_in_backlog: u32,
    pub sequence_number: u32,
}

/// Compares two modulo-2^32 sequence numbers using the half-range rule: `a`
/// is considered to come after `b` iff `a.wrapping_sub(b)` is in the lower
/// half of the range. This is what lets the gate detect a stale/duplicate
/// priority-event notification even after the counter wraps.
pub fn seq_is_after(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < (1u32 << 31)
}

/// Exponential backoff schedule for `partition-not-found` retries:
/// doubling from `initial` up to `max`, then repeating `max` until
/// `max_attempts` deliveries have been handed out, at which point the
/// schedule is exhausted and the caller should surface failure.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    current: Duration,
    attempts: u32,
}

impl BackoffSchedule {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            current: initial,
            attempts: 0,
        }
    }

    /// Returns the delay before the next retry, or `None` once
    /// `max_attempts` delays have already been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.current;
        self.attempts += 1;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }
}

/// The shared contract every channel variant implements; the gate only
/// ever talks to channels through this trait.
pub trait InputChannel: Send {
    fn channel_info(&self) -> ChannelInfo;
    fn request_subpartition(&mut self) -> Result<(), ChannelError>;
    fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError>;
    fn send_task_event(&mut self, event_bytes: Vec<u8>) -> Result<(), ChannelError>;
    fn resume_consumption(&mut self);
    fn release_all_resources(&mut self);
    fn is_released(&self) -> bool;
}

/// A channel created before its shuffle descriptor is known. `resolve`
/// atomically replaces it in-place with the local or remote variant once
/// the descriptor arrives; any backward events queued in the meantime are
/// flushed onto the replacement.
pub struct UnknownInputChannel {
    info: ChannelInfo,
    partition_id: PartitionId,
    pending_events: Vec<Vec<u8>>,
    released: bool,
}

impl UnknownInputChannel {
    pub fn new(info: ChannelInfo, partition_id: PartitionId) -> Self {
        Self {
            info,
            partition_id,
            pending_events: Vec::new(),
            released: false,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Drains buffered backward events for the caller to replay onto the
    /// resolved channel.
    pub fn take_pending_events(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pending_events)
    }
}

impl InputChannel for UnknownInputChannel {
    fn channel_info(&self) -> ChannelInfo {
        self.info
    }

    fn request_subpartition(&mut self) -> Result<(), ChannelError> {
        Ok(()) // nothing to request until resolved.
    }

    fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
        Ok(None)
    }

    fn send_task_event(&mut self, event_bytes: Vec<u8>) -> Result<(), ChannelError> {
        self.pending_events.push(event_bytes);
        Ok(())
    }

    fn resume_consumption(&mut self) {}

    fn release_all_resources(&mut self) {
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

/// A channel whose producer failed over or whose exactly-once input state
/// is being restored from a persisted snapshot before normal consumption
/// can resume. Behaves like [`UnknownInputChannel`] for traffic purposes
/// but remembers the recovery is in flight so callers don't mistake it for
/// a fresh unresolved channel.
pub struct RecoveringInputChannel {
    info: ChannelInfo,
    partition_id: PartitionId,
    recovered_sequence_number: u32,
    released: bool,
}

impl RecoveringInputChannel {
    pub fn new(info: ChannelInfo, partition_id: PartitionId, recovered_sequence_number: u32) -> Self {
        Self {
            info,
            partition_id,
            recovered_sequence_number,
            released: false,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn recovered_sequence_number(&self) -> u32 {
        self.recovered_sequence_number
    }
}

impl InputChannel for RecoveringInputChannel {
    fn channel_info(&self) -> ChannelInfo {
        self.info
    }

    fn request_subpartition(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn get_next_buffer(&mut self) -> Result<Option<BufferAndBacklog>, ChannelError> {
        Ok(None)
    }

    fn send_task_event(&mut self, _event_bytes: Vec<u8>) -> Result<(), ChannelError> {
        Err(ChannelError::ProducerUnavailable)
    }

    fn resume_consumption(&mut self) {}

    fn release_all_resources(&mut self) {
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

/// Co-location hint once a channel's producer is known to run on the same
/// worker as the consumer (`Local`) or elsewhere (`Remote`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerLocation {
    Local,
    Remote(WorkerId),
}

/// Which subtask instance of the upstream operator this channel consumes
/// from; purely descriptive, used in logs and in `ChannelInfo` composition
/// when channels are created from a physical edge fan-out.
pub fn describe(coord: SubtaskCoord) -> String {
    format!("{coord}")
}
